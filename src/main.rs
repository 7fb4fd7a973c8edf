mod cli;

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use framevault::frame::PacketStreamCodec;
use framevault::text::Chunker;
use framevault::{ArchiveIndex, Capabilities, Config, EncoderSession, RetrieverSession};
use serde_json::json;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use cli::{Cli, Command};

const DEFAULT_EXTS: &[&str] = &["txt", "md"];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Encode {
            output,
            index,
            inputs,
            text,
            exts,
            json,
        } => {
            let session = EncoderSession::new(config)?;
            let mut files = 0usize;
            for file in collect_inputs(&inputs, &exts)? {
                let body = fs::read_to_string(&file)?;
                match session.add_text(&body) {
                    Ok(added) => {
                        tracing::info!(path = %file.display(), chunks = added, "added file");
                        files += 1;
                    }
                    Err(framevault::ArchiveError::EmptyInput) => {
                        tracing::warn!(path = %file.display(), "skipping empty file");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            for snippet in &text {
                session.add_text(snippet)?;
            }
            if session.pending_len() == 0 {
                eprintln!("Nothing to encode: no input text found");
                std::process::exit(2);
            }

            let stats = session.build(&output, &index)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!(
                    "Encoded {} chunks from {} files into {} ({} bytes, {:.2}s @ {} fps)",
                    stats.total_chunks,
                    files,
                    stats.output_path.display(),
                    stats.media_bytes,
                    stats.duration_seconds,
                    stats.fps
                );
                println!("Index written to {}", stats.index_path.display());
            }
            Ok(())
        }

        Command::Search {
            media,
            index,
            query,
            limit,
            json,
        } => {
            let mut session = RetrieverSession::open(&media, &index, &config)?;
            let hits = session.search_with_metadata(&query, limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
                return Ok(());
            }
            if hits.is_empty() {
                println!("No results.");
            }
            for (rank, hit) in hits.iter().enumerate() {
                println!(
                    "{}. [chunk {} | frame {} | score {:.3}]",
                    rank + 1,
                    hit.chunk_id,
                    hit.frame,
                    hit.score
                );
                println!("{}\n", hit.text.trim());
            }
            Ok(())
        }

        Command::Context {
            media,
            index,
            chunk_id,
            window,
        } => {
            let mut session = RetrieverSession::open(&media, &index, &config)?;
            if session.get_chunk_by_id(chunk_id).is_none() {
                eprintln!("Chunk {chunk_id} not found");
                std::process::exit(1);
            }
            for text in session.get_context_window(chunk_id, window) {
                println!("{}\n---", text.trim());
            }
            Ok(())
        }

        Command::Stats { index, media } => {
            let caps = Capabilities::from_config(&config)?;
            let archive = ArchiveIndex::load(&config, caps.embedder, &index)?;
            let header = media
                .as_deref()
                .map(PacketStreamCodec::read_header)
                .transpose()?;
            let report = json!({
                "index": archive.get_stats(),
                "media": header,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }

        Command::Chunk { file, json } => {
            let body = fs::read_to_string(&file)?;
            let caps = Capabilities::from_config(&config)?;
            let chunks = caps.chunker.chunk(&body, &config.chunking);
            if json {
                println!("{}", serde_json::to_string_pretty(&chunks)?);
            } else {
                for (i, chunk) in chunks.iter().enumerate() {
                    println!("[{i}] ({} chars) {chunk}", chunk.chars().count());
                }
            }
            Ok(())
        }
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Expand directories into matching files, in sorted order.
fn collect_inputs(inputs: &[PathBuf], exts: &[String]) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_file() {
            files.push(input.clone());
            continue;
        }
        if !input.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("input does not exist: {}", input.display()),
            ));
        }
        let mut found: Vec<PathBuf> = WalkDir::new(input)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .filter(|path| is_extension_allowed(path, exts))
            .collect();
        found.sort();
        files.extend(found);
    }
    Ok(files)
}

fn is_extension_allowed(path: &Path, exts: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    if exts.is_empty() {
        return DEFAULT_EXTS.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext));
    }
    exts.iter()
        .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
}
