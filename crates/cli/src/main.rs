use anyhow::Context;
use clap::Parser;
use driver::FairPlay;
use pipeline::{Outcome, RunOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "defrost")]
#[command(
    about = "Write a decrypted, runnable copy of an encrypted arm64 Mach-O binary",
    long_about = None
)]
struct Cli {
    /// Encrypted source binary (left untouched).
    source: PathBuf,
    /// Where to write the decrypted duplicate (created or overwritten).
    dest: PathBuf,
    /// Call the decryption service even if the descriptor's cryptid is already 0.
    #[arg(long)]
    force: bool,
    /// Log every step to stderr.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("warning: .env: {}", e);
        }
    }

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let outcome = pipeline::run(
        &cli.source,
        &cli.dest,
        &FairPlay,
        RunOptions { force: cli.force },
    )
    .with_context(|| format!("could not decrypt {}", cli.source.display()))?;

    match outcome {
        Outcome::Decrypted {
            crypt_offset,
            crypt_size,
        } => {
            println!("Succeeded in decrypting the binary.");
            println!(
                "  {} bytes at offset {:#x} -> {}",
                crypt_size,
                crypt_offset,
                cli.dest.display()
            );
        }
        Outcome::NoDescriptor => {
            println!(
                "No encryption descriptor found; {} is an unmodified copy.",
                cli.dest.display()
            );
        }
        Outcome::AlreadyPlaintext => {
            println!(
                "Binary is already decrypted (cryptid 0); {} is an unmodified copy.",
                cli.dest.display()
            );
        }
    }

    Ok(())
}

/// `RUST_LOG` wins unless `--verbose` is given; the default is warnings only.
fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
