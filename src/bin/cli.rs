//! dream-rs CLI
//!
//! Diagnostics for diffusion decoding: transfer schedules and resolved
//! generation configs.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dream_rs::decoding::{TransferAlgorithm, TransferPlan};
use dream_rs::GenerationConfig;

#[derive(Parser)]
#[command(name = "dream-cli")]
#[command(about = "Masked-diffusion decoding diagnostics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the per-step transfer schedule of an algorithm
    Schedule {
        /// Number of denoising steps
        #[arg(short, long, default_value = "16")]
        steps: usize,

        /// Transfer algorithm: origin, transition_<K> or maskgit_plus
        #[arg(short, long, default_value = "origin")]
        alg: String,

        /// Number of masked positions when decoding starts
        #[arg(short, long, default_value = "16")]
        masked_len: usize,
    },

    /// Validate a generation config and print the resolved decode plan
    Resolve {
        /// Path to a generation_config.json
        #[arg(short, long)]
        config: PathBuf,

        /// Prompt length in tokens
        #[arg(short = 'n', long)]
        input_len: usize,

        /// Position capacity of the model, if bounded
        #[arg(long)]
        max_position_embeddings: Option<usize>,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Schedule {
            steps,
            alg,
            masked_len,
        } => {
            if steps == 0 {
                anyhow::bail!("--steps must be at least 1");
            }
            let algorithm: TransferAlgorithm = alg.parse()?;
            let plan = TransferPlan::new(algorithm, steps, masked_len);

            println!("\n=== {} schedule ===", algorithm);
            println!("Steps: {}, masked positions: {}", steps, masked_len);
            println!();
            println!(
                "{:>5} {:>10} {:>10} {:>10} {:>10} {:>10}",
                "step", "t", "s", "p", "transfer", "remaining"
            );
            println!("{}", "-".repeat(60));

            for row in &plan.steps {
                let p = row
                    .transfer_probability
                    .map(|p| format!("{:.4}", p))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:>5} {:>10.4} {:>10.4} {:>10} {:>10.2} {:>10.2}",
                    row.step, row.t, row.s, p, row.transfers, row.remaining
                );
            }

            if plan.remaining() > 0.0 {
                eprintln!(
                    "\nWarning: {:.0} positions stay masked after {} steps",
                    plan.remaining(),
                    steps
                );
            }
        }

        Commands::Resolve {
            config,
            input_len,
            max_position_embeddings,
        } => {
            tracing::info!("Loading generation config from {:?}...", config);
            let generation_config = GenerationConfig::from_file(&config)
                .with_context(|| format!("Failed to load {}", config.display()))?;

            let plan = generation_config
                .resolve(input_len, max_position_embeddings)
                .context("Generation config is not usable")?;

            println!("\n=== Decode plan ===");
            println!("Algorithm:      {}", plan.policy.algorithm);
            if let Some(alg_temp) = plan.policy.alg_temp {
                println!("alg_temp:       {}", alg_temp);
            }
            println!("Steps:          {}", plan.steps);
            println!(
                "Length:         {} ({} prompt + {} generated)",
                plan.max_length,
                input_len,
                plan.max_length - input_len
            );
            println!(
                "Sampling:       temperature={}, top_p={:?}, top_k={:?}",
                plan.sampling.temperature, plan.sampling.top_p, plan.sampling.top_k
            );
            println!(
                "Tokens:         mask={}, pad={}, eos={}",
                plan.tokens.mask_token_id, plan.tokens.pad_token_id, plan.tokens.eos_token_id
            );
            println!("History:        {}", plan.output_history);
            println!("Replicas/input: {}", plan.num_return_sequences);
        }
    }

    Ok(())
}
