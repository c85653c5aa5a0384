use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facereg_core::backend::BackendKind;
use facereg_core::report::{FacesReport, NamesReport};
use facereg_core::session::ImageOutcome;
use facereg_core::{Config, StoreBackend};
use std::path::PathBuf;

mod batch;

#[derive(Parser)]
#[command(name = "facereg", about = "Recognize faces and grow a persistent identity store")]
struct Cli {
    /// Override the identity store location. A `.json` path selects the JSON
    /// backend and `.db`/`.sqlite` selects SQLite, unless --backend is given.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Override the store backend (sqlite or json)
    #[arg(long, global = true)]
    backend: Option<BackendKind>,

    /// Override the match tolerance (Euclidean distance, inclusive)
    #[arg(long, global = true)]
    tolerance: Option<f32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize the faces in one image
    Recognize {
        /// Image file; detections are read from its `.faces.json` sidecar
        image: PathBuf,
        /// Image reference to put in the report instead of the output path
        #[arg(long)]
        url: Option<String>,
        /// Print only the list of names
        #[arg(long)]
        names_only: bool,
    },
    /// Recognize every .jpg/.jpeg/.png image in a directory
    Batch {
        dir: PathBuf,
        /// Directory for annotated images and all_results.json
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List known identities
    List,
    /// Show store status
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env().context("failed to load configuration")?;
    apply_overrides(&mut config, cli.store, cli.backend, cli.tolerance)?;

    match cli.command {
        Commands::Recognize {
            image,
            url,
            names_only,
        } => {
            let mut store = config
                .open_store()
                .context("failed to load the identity store")?;
            let mut session = config.build_session().context("failed to prepare outputs")?;

            let image_ref = url.clone().unwrap_or_else(|| image.display().to_string());
            let outcome = session.process(&mut store, &image, &image_ref);

            let json = if names_only {
                serde_json::to_string_pretty(&NamesReport::from(&outcome))?
            } else {
                let mut report = FacesReport::for_output(&outcome);
                if let Some(url) = url {
                    report.image = url;
                }
                serde_json::to_string_pretty(&report)?
            };
            println!("{json}");

            if let ImageOutcome::Skipped { reason, .. } = &outcome {
                bail!("{} was skipped: {reason}", image.display());
            }
            if store.pending() > 0 {
                bail!(
                    "{} enrollment(s) could not be persisted to {}",
                    store.pending(),
                    store.backend().describe()
                );
            }
        }
        Commands::Batch { dir, output } => {
            if let Some(output) = output {
                config.output_dir = output;
            }
            let summary = batch::run_batch(&config, &dir)?;
            println!(
                "processed {} image(s), skipped {}, {} face(s), {} new",
                summary.processed, summary.skipped, summary.faces, summary.enrolled
            );
            if summary.unpersisted > 0 {
                bail!("{} enrollment(s) could not be persisted", summary.unpersisted);
            }
        }
        Commands::List => {
            let store = config
                .open_store()
                .context("failed to load the identity store")?;
            let identities = store.snapshot().identities();
            if identities.is_empty() {
                println!("No known faces");
            }
            for (name, count) in identities {
                println!("{name}\t{count}");
            }
        }
        Commands::Status => {
            let store = config
                .open_store()
                .context("failed to load the identity store")?;
            let snapshot = store.snapshot();
            println!(
                "{}",
                serde_json::json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "store": store.backend().describe(),
                    "embeddings": snapshot.len(),
                    "identities": snapshot.identities().len(),
                    "dimension": snapshot.dim(),
                    "tolerance": config.tolerance,
                })
            );
        }
    }

    Ok(())
}

/// Apply command-line overrides on top of the file and environment config.
fn apply_overrides(
    config: &mut Config,
    store: Option<PathBuf>,
    backend: Option<BackendKind>,
    tolerance: Option<f32>,
) -> Result<()> {
    if let Some(store) = store {
        if backend.is_none() {
            if let Some(kind) = BackendKind::from_extension(&store) {
                config.store_backend = kind;
            }
        }
        config.store_path = store;
    }
    if let Some(backend) = backend {
        config.store_backend = backend;
    }
    if let Some(tolerance) = tolerance {
        if !tolerance.is_finite() || tolerance < 0.0 {
            bail!("tolerance must be a non-negative number, got {tolerance}");
        }
        config.tolerance = tolerance;
    }
    Ok(())
}
