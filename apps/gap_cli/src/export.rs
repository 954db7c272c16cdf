use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use client_core::ReportExporter;
use shared::protocol::{AssessmentReport, ExportReceipt};
use tracing::info;

/// Writes reports as pretty-printed JSON files into one directory.
pub struct JsonReportExporter {
    dir: PathBuf,
}

impl JsonReportExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_name(report: &AssessmentReport) -> String {
        let owner = report
            .user_id
            .as_ref()
            .map(|user_id| sanitize(user_id.as_str()))
            .unwrap_or_else(|| "anonymous".to_string());
        format!(
            "compliance-report-{owner}-{}.json",
            report.generated_at.format("%Y-%m-%d")
        )
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl ReportExporter for JsonReportExporter {
    async fn export_report(&self, report: &AssessmentReport) -> Result<ExportReceipt> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create report directory '{}'", self.dir.display()))?;

        let path = self.dir.join(Self::file_name(report));
        let body = serde_json::to_vec_pretty(report).context("failed to encode report")?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("failed to write report '{}'", path.display()))?;

        info!(path = %path.display(), items = report.items.len(), "export: report written");
        Ok(ExportReceipt {
            location: path.display().to_string(),
            item_count: report.items.len(),
        })
    }
}
