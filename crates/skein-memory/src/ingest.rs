use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use skein_core::error::{Result, SkeinError};

use crate::rag::VectorStore;

const PROGRESS_EVERY: usize = 50;

/// One entry of a sample file.
#[derive(Debug, Clone, Deserialize)]
pub struct Sample {
    #[serde(default)]
    pub id: serde_json::Value,
    #[serde(default)]
    pub content: String,
}

/// Outcome of a bulk ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub inserted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total: usize,
}

/// Parse a JSON array of `{id, content}` objects.
pub fn parse_samples(data: &str) -> Result<Vec<Sample>> {
    Ok(serde_json::from_str(data)?)
}

/// Ingest every sample in a JSON file.
///
/// Blank entries are skipped and per-item failures are logged and counted;
/// only an unreadable or unparseable file fails the whole run.
pub async fn ingest_samples(store: &VectorStore, path: &Path) -> Result<IngestReport> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| SkeinError::Io(std::io::Error::new(e.kind(), format!("{}: {}", path.display(), e))))?;
    let samples = parse_samples(&data)?;
    info!(path = %path.display(), count = samples.len(), "Loaded samples");
    Ok(ingest_all(store, &samples).await)
}

pub async fn ingest_all(store: &VectorStore, samples: &[Sample]) -> IngestReport {
    let mut report = IngestReport {
        total: samples.len(),
        ..IngestReport::default()
    };

    for sample in samples {
        if sample.content.trim().is_empty() {
            report.skipped += 1;
            continue;
        }
        match store.ingest(&sample.content).await {
            Ok(_) => {
                report.inserted += 1;
                if report.inserted % PROGRESS_EVERY == 0 {
                    info!(inserted = report.inserted, total = report.total, "Ingestion progress");
                }
            }
            Err(e) => {
                warn!(id = %sample.id, error = %e, "Failed to ingest sample");
                report.failed += 1;
            }
        }
    }

    info!(
        inserted = report.inserted,
        skipped = report.skipped,
        failed = report.failed,
        total = report.total,
        "Ingestion complete"
    );
    report
}
