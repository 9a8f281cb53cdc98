use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use receipt_core::{collect_images, Credentials};
use receipt_ocr::{purify_asset, Purifier};
use receipt_reader::{build_pipeline, BatchRunner, OnError, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "receipt-reader", version)]
#[command(about = "Extract merchant, item, amount and date from receipt photos into a CSV table")]
struct Cli {
    /// Settings file (default: ./receipt-reader.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// `.env` file holding the credentials (default: nearest `.env`)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process every image and write the combined CSV
    Run {
        /// Image files or directories
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Combined CSV path (default: Downloads/receipt_extractions.csv)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// What a failing image does to the batch
        #[arg(long, value_enum)]
        on_error: Option<OnError>,

        /// Images processed at once
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Only purify images into the purified directory
    Purify {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Run one image end to end and print its record as JSON
    Extract { image: PathBuf },

    /// Validate the Google and OpenAI credentials
    CheckKeys,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    match cli.command {
        Command::Run { inputs, output, on_error, concurrency } => {
            if let Some(output) = output {
                settings.paths.output = Some(output);
            }
            if let Some(on_error) = on_error {
                settings.batch.on_error = on_error;
            }
            if let Some(concurrency) = concurrency {
                settings.batch.concurrency = concurrency;
            }
            settings.validate()?;

            let credentials = Credentials::load(cli.env_file.as_deref())?;
            let assets = collect_images(&inputs)?;
            if assets.is_empty() {
                bail!("No supported images found in the given inputs");
            }

            let pipeline = build_pipeline(&settings, &credentials)?;
            let runner = BatchRunner::new(pipeline, settings.paths.clone(), settings.batch.clone());

            let report = tokio::select! {
                report = runner.run(assets) => report?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("Interrupted; in-flight images cancelled");
                    bail!("Interrupted");
                }
            };

            for failure in &report.skipped {
                tracing::warn!("Skipped {}: {}", failure.stem, failure.reason);
            }
            for failure in &report.artifact_failures {
                tracing::error!("No row for {}: {}", failure.stem, failure.reason);
            }
            println!("Wrote {} row(s) to {}", report.rows, report.combined_path.display());
        }

        Command::Purify { inputs } => {
            let purifier = Arc::new(Purifier::new(settings.purifier.clone())?);
            let mut failed = 0usize;
            for asset in collect_images(&inputs)? {
                match purify_asset(Arc::clone(&purifier), &asset, &settings.paths.purified_dir).await {
                    Ok((path, _)) => println!("{}", path.display()),
                    Err(e) if settings.batch.on_error == OnError::Skip => {
                        tracing::warn!("Skipping {}: {e}", asset.stem);
                        failed += 1;
                    }
                    Err(e) => return Err(e).with_context(|| format!("Failed to purify {}", asset.stem)),
                }
            }
            if failed > 0 {
                bail!("{failed} image(s) could not be purified");
            }
        }

        Command::Extract { image } => {
            let credentials = Credentials::load(cli.env_file.as_deref())?;
            let asset = collect_images(std::slice::from_ref(&image))?
                .into_iter()
                .next()
                .with_context(|| format!("{} is not a supported image", image.display()))?;
            let pipeline = build_pipeline(&settings, &credentials)?;
            let outcome = pipeline
                .process_image(&asset, &settings.paths.purified_dir)
                .await
                .with_context(|| format!("Failed to process {}", asset.stem))?;
            println!("{}", serde_json::to_string_pretty(&outcome.record)?);
        }

        Command::CheckKeys => {
            let credentials = Credentials::load(cli.env_file.as_deref())?;
            // Constructing the clients parses the private key.
            build_pipeline(&settings, &credentials)?;
            println!(
                "Service account {} ({}) and OpenAI key look valid",
                credentials.service_account.client_email,
                credentials.service_account_path.display()
            );
        }
    }

    Ok(())
}
