use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "framevault")]
#[command(about = "Archive text into frame-addressable media and search it semantically", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    /// JSON config file (defaults apply to anything it omits)
    #[arg(short, long, global = true)]
    pub(crate) config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG wins.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Chunk text files (or folders of them) and build a media + index pair.
    Encode {
        /// Media file to write
        #[arg(short, long)]
        output: PathBuf,
        /// Index document to write (vectors go next to it with a .vec extension)
        #[arg(short, long)]
        index: PathBuf,
        /// Files or directories to ingest
        inputs: Vec<PathBuf>,
        /// Inline text to add (repeatable)
        #[arg(long)]
        text: Vec<String>,
        /// File extensions to ingest from directories (repeatable). Default: txt, md
        #[arg(long = "ext")]
        exts: Vec<String>,
        /// Output JSON build stats
        #[arg(long)]
        json: bool,
    },

    /// Semantic search over an archive.
    Search {
        media: PathBuf,
        index: PathBuf,
        query: String,
        /// Number of results
        #[arg(short = 'n', long, default_value_t = 5)]
        limit: usize,
        /// Output JSON hits with scores and frame numbers
        #[arg(long)]
        json: bool,
    },

    /// Print a chunk together with its neighbours.
    Context {
        media: PathBuf,
        index: PathBuf,
        chunk_id: u64,
        /// Neighbouring chunks on each side
        #[arg(short, long, default_value_t = 2)]
        window: u64,
    },

    /// Show index statistics.
    Stats {
        index: PathBuf,
        /// Media file, to include its header
        #[arg(long)]
        media: Option<PathBuf>,
    },

    /// Show how a file would be chunked.
    Chunk {
        file: PathBuf,
        /// Output JSON array of chunks
        #[arg(long)]
        json: bool,
    },
}
