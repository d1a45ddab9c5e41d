use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

use super::engine::RunSummary;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunReportFile<'a> {
    generated_at: String,
    package_path: String,
    summary: &'a RunSummary,
}

/// Writes `import-<timestamp>.json` into `reports_dir` and returns its path.
pub fn write_run_report(
    reports_dir: &Path,
    package_path: &Path,
    summary: &RunSummary,
) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir)
        .with_context(|| format!("create reports directory {}", reports_dir.display()))?;

    let timestamp = Utc::now().format("import-%Y%m%d-%H%M%S%.3f.json");
    let path = reports_dir.join(timestamp.to_string());
    let payload = RunReportFile {
        generated_at: Utc::now().to_rfc3339(),
        package_path: package_path.display().to_string(),
        summary,
    };
    let json = serde_json::to_string_pretty(&payload).context("serialize import report")?;
    fs::write(&path, json).with_context(|| format!("write import report {}", path.display()))?;
    Ok(path)
}
