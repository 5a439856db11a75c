use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use genrec::cli::{Cli, Commands};

// Sessions own their worker runtime, so the entry point stays synchronous.
fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "genrec=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Chat {
            model,
            prompt,
            devices,
            max_tokens,
            temperature,
            top_p,
            timeout_ms,
            config,
            json,
        } => {
            genrec::cli::chat(
                model,
                prompt,
                devices,
                max_tokens,
                temperature,
                top_p,
                timeout_ms,
                config,
                json,
            )?;
        }
        Commands::Info { model } => {
            genrec::cli::info(model)?;
        }
        Commands::Devices { spec } => {
            genrec::cli::devices(spec)?;
        }
    }

    Ok(())
}
