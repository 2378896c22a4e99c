//! Distributed Text Loader Inspector
//!
//! This binary builds a loader from a configuration file and logs the
//! per-rank batches it would hand to a trainer.
//!
//! # Usage
//!
//! ```bash
//! # Show the first 10 training batches of rank 0
//! dtl-inspect --config loader.toml
//!
//! # Inspect rank 1 of 4 on the dev split
//! dtl-inspect --config loader.toml --split dev --rank 1 --world-size 4
//!
//! # Continue an interrupted epoch after 200 batches
//! dtl-inspect --config loader.toml --resume-iterations 200
//! ```

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use loader_core::{IterationState, Loader, LoaderConfig, Split};

/// Distributed Text Loader Inspector
#[derive(Parser, Debug)]
#[command(name = "dtl-inspect")]
#[command(about = "Inspect the per-rank batches of a parallel text corpus")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Split to iterate (train, dev, test)
    #[arg(short, long, default_value = "train")]
    split: String,

    /// Rank to inspect, overriding the configuration
    #[arg(long)]
    rank: Option<usize>,

    /// Number of ranks, overriding the configuration
    #[arg(long)]
    world_size: Option<usize>,

    /// Stop after this many batches
    #[arg(short = 'n', long, default_value = "10")]
    max_batches: usize,

    /// Batches of the first epoch already consumed
    #[arg(long)]
    resume_iterations: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let split: Split = args.split.parse()?;

    let mut config = match &args.config {
        Some(path) => LoaderConfig::from_file(path)?,
        None => LoaderConfig::default(),
    }
    .with_env_overrides();
    if let Some(rank) = args.rank {
        config.distributed.rank = rank;
    }
    if let Some(world_size) = args.world_size {
        config.distributed.world_size = world_size;
    }

    tracing::info!("Starting DTL Inspector");
    tracing::info!("  Split: {}", split);
    tracing::info!(
        "  Rank: {}/{}",
        config.distributed.rank,
        config.distributed.world_size
    );
    tracing::info!(
        "  Target cost: {} ({})",
        config.batching.target_cost,
        config.batching.resolved_cost()
    );

    let loader = Loader::from_config(config)?;
    let mut batches = loader.iter_split(split)?;
    if let Some(iterations) = args.resume_iterations {
        batches.resume(IterationState {
            epoch: 0,
            iterations_this_epoch: iterations,
            iterations,
        });
    }

    let mut seen = 0usize;
    let mut examples = 0usize;
    let mut tokens = 0usize;

    while seen < args.max_batches {
        let Some(batch) = batches.next_batch()? else {
            break;
        };
        seen += 1;
        examples += batch.len();
        tokens += batch
            .examples
            .iter()
            .map(|e| e.fields.iter().map(|f| f.total_len()).sum::<usize>())
            .sum::<usize>();

        tracing::info!(
            "Batch {}: examples [{}, {}) of {}",
            batches.state().iterations,
            batch.start,
            batch.end(),
            batch.global_size
        );

        if let Some(first) = batch.examples.first() {
            for (field, seq) in loader.fields().iter().zip(&first.fields) {
                tracing::debug!("  {}: {}", field.name(), field.detokenize(seq));
            }
        }
    }

    let state = batches.state();
    tracing::info!(
        "Done: {} batches, {} examples, {} tokens on this rank",
        seen,
        examples,
        tokens
    );
    tracing::info!(
        "Resume point: epoch {}, {} batches into the epoch, {} overall",
        state.epoch,
        state.iterations_this_epoch,
        state.iterations
    );

    Ok(())
}
