//! AtlasLog CLI
//!
//! Command-line interface for inspecting and editing an AtlasLog store.
//! Every invocation starts the serializer, runs one command and shuts down.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use atlaslog::{
    AtlasError, BlockId, BlockWrite, Config, LogSerializer, Outcome, Result, SyncStrategy,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// AtlasLog CLI
#[derive(Parser, Debug)]
#[command(name = "atlaslog-cli")]
#[command(about = "CLI for the AtlasLog block store")]
#[command(version)]
struct Args {
    /// Backing file
    #[arg(short, long, default_value = "./atlaslog.db")]
    db: PathBuf,

    /// Extent size in KB
    #[arg(short, long, default_value = "8192")]
    extent_kb: u64,

    /// Skip fsync after writes
    #[arg(long)]
    no_sync: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a block
    Put {
        /// Block id
        id: u64,

        /// Payload, stored as UTF-8
        value: String,
    },

    /// Read a block
    Get {
        /// Block id
        id: u64,
    },

    /// Delete a block
    Del {
        /// Block id
        id: u64,
    },

    /// Print store statistics
    Stat,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,atlaslog=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::debug!("AtlasLog CLI v{}", atlaslog::VERSION);

    if let Err(e) = run(args) {
        tracing::error!("Command failed: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = Config::builder()
        .db_path(&args.db)
        .extent_size(args.extent_kb * 1024)
        .sync_strategy(if args.no_sync {
            SyncStrategy::Never
        } else {
            SyncStrategy::EveryWrite
        })
        .build();

    let mut serializer = LogSerializer::new(config)?;
    drive(&mut serializer, |s, done| s.start(done))?;

    let result = execute(&mut serializer, args.command);
    drive(&mut serializer, |s, done| s.shutdown(done))?;
    result
}

fn execute(serializer: &mut LogSerializer, command: Commands) -> Result<()> {
    match command {
        Commands::Put { id, value } => {
            let writes = vec![BlockWrite::update(BlockId::new(id), value.as_bytes())];
            drive(serializer, |s, done| s.do_write(writes, done))?;
            println!("OK");
        }
        Commands::Get { id } => match drive(serializer, |s, done| s.do_read(BlockId::new(id), done)) {
            Ok(payload) => println!("{}", String::from_utf8_lossy(&payload)),
            Err(AtlasError::BlockNotFound(_)) => println!("(nil)"),
            Err(e) => return Err(e),
        },
        Commands::Del { id } => {
            let writes = vec![BlockWrite::delete(BlockId::new(id))];
            drive(serializer, |s, done| s.do_write(writes, done))?;
            println!("OK");
        }
        Commands::Stat => {
            let max = serializer.max_block_id();
            let in_use = (0..max.get())
                .filter(|id| serializer.block_in_use(BlockId::new(*id)))
                .count();
            println!("max_block_id: {}", max.get());
            println!("blocks_in_use: {}", in_use);
            #[cfg(feature = "diagnostics")]
            {
                println!("free_extents: {}", serializer.free_extent_count());
                if let Some(metablock) = serializer.last_metablock() {
                    println!("extent_count: {}", metablock.extent_manager.extent_count);
                    println!("lba_extents: {}", metablock.lba_index.extents.len());
                }
            }
        }
    }
    Ok(())
}

/// Submit one operation and run the event loop until its result is known
fn drive<T: 'static>(
    serializer: &mut LogSerializer,
    submit: impl FnOnce(&mut LogSerializer, Box<dyn FnOnce(Result<T>)>) -> Result<Outcome<T>>,
) -> Result<T> {
    let slot: Rc<RefCell<Option<Result<T>>>> = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&slot);
    let done: Box<dyn FnOnce(Result<T>)> = Box::new(move |result| {
        *sink.borrow_mut() = Some(result);
    });

    if let Outcome::Complete(value) = submit(serializer, done)? {
        return Ok(value);
    }
    serializer.run_until_idle();

    let result = slot.borrow_mut().take();
    result.unwrap_or(Err(AtlasError::InvalidState("operation did not complete")))
}
