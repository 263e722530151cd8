use std::path::PathBuf;

use candle_core::Device;
use clap::Parser;
use trainer::{checkpoint, TrainingError};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        if err.is_fatal() {
            eprintln!("fatal: {}", err);
        } else {
            eprintln!("verification failed: {}", err);
        }
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Check a training checkpoint against its digest", long_about = None)]
struct Args {
    #[arg(value_name = "PATH", help = "Checkpoint file written by the trainer")]
    checkpoint: PathBuf,

    #[arg(long, help = "Skip the .sha256 comparison (non-final epochs have none)")]
    no_digest: bool,

    #[arg(long, help = "Print the stored metadata as JSON")]
    show_meta: bool,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    if !args.no_digest {
        let digest = checkpoint::verify_checkpoint(&args.checkpoint)?;
        println!("{}  OK ({})", args.checkpoint.display(), digest);
    }

    let loaded = checkpoint::read_checkpoint(&args.checkpoint, &Device::Cpu)?;
    let mut names: Vec<&String> = loaded.tensors.keys().collect();
    names.sort();
    println!(
        "epoch {} (format version {}), {} tensors",
        loaded.epoch,
        loaded.version,
        names.len()
    );
    for name in names {
        if let Some(tensor) = loaded.tensors.get(name) {
            println!("  {name}: {:?} {:?}", tensor.dims(), tensor.dtype());
        }
    }

    if args.show_meta {
        let pretty = serde_json::to_string_pretty(&loaded.meta)?;
        println!("{pretty}");
    }
    Ok(())
}
