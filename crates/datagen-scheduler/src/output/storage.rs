//! Writes the rendered export to a file per run.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use super::{Batch, DeliveryOutcome, OutputSink};

/// Files land at `<directory>/<task_id>/<UTC timestamp>.<ext>`.
pub struct StorageSink {
    directory: PathBuf,
}

impl StorageSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

#[async_trait]
impl OutputSink for StorageSink {
    async fn deliver(&self, batch: &Batch<'_>) -> DeliveryOutcome {
        let rendered = match datagen_generator::render(
            batch.rows,
            batch.fields,
            batch.format,
            batch.table_name,
        ) {
            Ok(text) => text,
            Err(e) => return DeliveryOutcome::failed(format!("render {}: {e}", batch.format)),
        };

        let dir = self.directory.join(batch.task_id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(dir = %dir.display(), "cannot create export directory: {e}");
            return DeliveryOutcome::failed(format!("create {}: {e}", dir.display()));
        }
        let file = dir.join(format!(
            "{}.{}",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
            batch.format.extension()
        ));
        match tokio::fs::write(&file, rendered.as_bytes()).await {
            Ok(()) => {
                debug!(file = %file.display(), bytes = rendered.len(), "export written");
                DeliveryOutcome::success(format!(
                    "wrote {} bytes to {}",
                    rendered.len(),
                    file.display()
                ))
            }
            Err(e) => {
                warn!(file = %file.display(), "export write failed: {e}");
                DeliveryOutcome::failed(format!("write {}: {e}", file.display()))
            }
        }
    }
}
