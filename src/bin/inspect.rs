//! Read-only inspection tool for umbra store files.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use umbra::{Database, Options, Result};

#[derive(Parser)]
#[command(name = "umbra-inspect", about = "Inspect an umbra database file")]
struct Cli {
    /// Path to the database file.
    database: PathBuf,

    /// Page size the file was created with.
    #[arg(long, default_value_t = 4096, env = "UMBRA_PAGE_SIZE")]
    page_size: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show meta-page counters.
    Info,
    /// List every key in traversal order.
    Keys,
    /// Print the value stored under a key.
    Get {
        /// Key to look up (raw bytes).
        key: String,
    },
}

fn open(cli: &Cli) -> Result<Database> {
    let options = Options {
        page_size: cli.page_size,
        read_only: true,
        ..Options::default()
    };
    Database::open(&cli.database, options)
}

fn run(cli: &Cli) -> Result<()> {
    let db = open(cli)?;
    match &cli.command {
        Command::Info => {
            let stats = db.stats()?;
            println!("page size:  {}", stats.page_size);
            println!("txn id:     {}", stats.txnid);
            println!("page count: {}", stats.page_count);
            println!("free pages: {}", stats.free_pages);
            println!("height:     {}", stats.height);
        }
        Command::Keys => {
            for item in db.iter() {
                let (key, _) = item?;
                println!("{}", render(&key));
            }
        }
        Command::Get { key } => {
            let value = db.get(key.as_bytes())?;
            println!("{}", render(&value));
        }
    }
    Ok(())
}

fn render(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.chars().any(char::is_control) => text.to_string(),
        _ => hex::encode(bytes),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}
