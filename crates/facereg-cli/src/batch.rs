use anyhow::{Context, Result};
use facereg_core::report::FacesReport;
use facereg_core::session::ImageOutcome;
use facereg_core::Config;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
pub const RESULTS_FILE: &str = "all_results.json";

/// Counts for one batch run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchSummary {
    pub processed: usize,
    pub skipped: usize,
    pub faces: usize,
    pub enrolled: usize,
    /// Enrollments still unpersisted after the final flush.
    pub unpersisted: usize,
}

/// Image files directly inside `dir`, sorted by file name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("cannot read {}", dir.display()))? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image && path.is_file() {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Recognize every image in `dir`, writing annotated copies and
/// `all_results.json` to the configured output directory.
pub fn run_batch(config: &Config, dir: &Path) -> Result<BatchSummary> {
    let mut store = config
        .open_store()
        .context("failed to load the identity store")?;
    let mut session = config.build_session().context("failed to prepare outputs")?;

    let images = list_images(dir)?;
    tracing::info!(dir = %dir.display(), images = images.len(), "starting batch");

    let mut summary = BatchSummary::default();
    let mut reports = Vec::with_capacity(images.len());

    for path in &images {
        let outcome = session.process(&mut store, path, &path.display().to_string());
        match &outcome {
            ImageOutcome::Recognized { result, .. } => {
                summary.processed += 1;
                summary.faces += result.faces.len();
                summary.enrolled += result.enrolled_count();
            }
            ImageOutcome::Skipped { .. } => summary.skipped += 1,
        }
        reports.push(FacesReport::for_output(&outcome));
    }

    if let Err(e) = store.flush() {
        tracing::error!(pending = store.pending(), error = %e, "failed to persist enrollments");
    }
    summary.unpersisted = store.pending();

    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("cannot create {}", config.output_dir.display()))?;
    let results_path = config.output_dir.join(RESULTS_FILE);
    let json = serde_json::to_string_pretty(&reports)?;
    std::fs::write(&results_path, json)
        .with_context(|| format!("cannot write {}", results_path.display()))?;
    tracing::info!(path = %results_path.display(), "all results saved");

    Ok(summary)
}
