//! Output sinks and the dispatcher that picks one for each task.
//!
//! Every sink turns its own failures into a [`DeliveryOutcome`]; nothing
//! here returns an error to the pipeline. Delivery is attempted once.

mod storage;
mod webhook;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;

use datagen_core::config::OutputConfig;
use datagen_core::types::{ExportFormat, FieldSpec, Row};

use crate::error::Result;
use crate::types::{OutputSpec, OutputStatus, ScheduledTask};

pub use storage::StorageSink;
pub use webhook::{sign, verify, Envelope, WebhookSink, ALLOWED_METHODS, SIGNATURE_HEADER, TIMESTAMP_HEADER};

/// One generated batch on its way to a sink.
pub struct Batch<'a> {
    pub task_id: &'a str,
    pub task_name: &'a str,
    pub rows: &'a [Row],
    pub fields: &'a [FieldSpec],
    pub format: ExportFormat,
    pub table_name: Option<&'a str>,
}

impl<'a> Batch<'a> {
    pub fn for_task(task: &'a ScheduledTask, rows: &'a [Row]) -> Self {
        Self {
            task_id: &task.id,
            task_name: &task.name,
            rows,
            fields: &task.fields,
            format: task.export_format,
            table_name: task.table_name.as_deref(),
        }
    }
}

/// Recorded on the execution log as `output_status` / `output_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryOutcome {
    pub status: OutputStatus,
    pub message: String,
}

impl DeliveryOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: OutputStatus::Success,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: OutputStatus::Failed,
            message: message.into(),
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            status: OutputStatus::Skipped,
            message: message.into(),
        }
    }
}

/// A destination for generated data.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn deliver(&self, batch: &Batch<'_>) -> DeliveryOutcome;
}

/// Sink kinds that are configurable but have no delivery path.
struct UnsupportedSink {
    kind: &'static str,
}

#[async_trait]
impl OutputSink for UnsupportedSink {
    async fn deliver(&self, _batch: &Batch<'_>) -> DeliveryOutcome {
        DeliveryOutcome::skipped(format!("{} delivery is not supported", self.kind))
    }
}

/// Which timeout a webhook delivery uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Triggered by a task run.
    Task,
    /// Ad-hoc test from the owner.
    Test,
}

pub struct OutputDispatcher {
    client: reqwest::Client,
    task_timeout: Duration,
    test_timeout: Duration,
    storage_dir: PathBuf,
}

impl OutputDispatcher {
    pub fn new(config: &OutputConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .build()?;
        Ok(Self {
            client,
            task_timeout: Duration::from_secs(config.webhook_timeout_secs),
            test_timeout: Duration::from_secs(config.test_timeout_secs),
            storage_dir: PathBuf::from(&config.storage_dir),
        })
    }

    /// The sink for `output`, or `None` when the task has no output.
    pub fn sink_for(&self, output: &OutputSpec, mode: DeliveryMode) -> Option<Box<dyn OutputSink>> {
        let timeout = match mode {
            DeliveryMode::Task => self.task_timeout,
            DeliveryMode::Test => self.test_timeout,
        };
        match output {
            OutputSpec::None => None,
            OutputSpec::Webhook(spec) => Some(Box::new(WebhookSink::new(
                self.client.clone(),
                spec.clone(),
                timeout,
            ))),
            OutputSpec::Email(_) => Some(Box::new(UnsupportedSink { kind: "email" })),
            OutputSpec::Storage(spec) => {
                let dir = spec
                    .directory
                    .as_ref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| self.storage_dir.clone());
                Some(Box::new(StorageSink::new(dir)))
            }
        }
    }

    /// Deliver a task run's rows. `None` when the task has no output.
    pub async fn deliver(&self, task: &ScheduledTask, rows: &[Row]) -> Option<DeliveryOutcome> {
        let sink = self.sink_for(&task.output, DeliveryMode::Task)?;
        Some(sink.deliver(&Batch::for_task(task, rows)).await)
    }

    /// Push a one-row sample batch through the sink for `output`, using the
    /// test timeout. `None` when `output` is [`OutputSpec::None`].
    pub async fn test_delivery(&self, output: &OutputSpec) -> Option<DeliveryOutcome> {
        let sink = self.sink_for(output, DeliveryMode::Test)?;
        let mut sample = Row::new();
        sample.insert("message".into(), json!("test delivery"));
        sample.insert(
            "sent_at".into(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        let rows = vec![sample];
        let fields = vec![FieldSpec::new("message", "string"), FieldSpec::new("sent_at", "datetime")];
        let batch = Batch {
            task_id: "test",
            task_name: "Test delivery",
            rows: &rows,
            fields: &fields,
            format: ExportFormat::Json,
            table_name: None,
        };
        Some(sink.deliver(&batch).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EmailSpec, NewTask, WebhookSpec};

    fn dispatcher() -> OutputDispatcher {
        OutputDispatcher::new(&OutputConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn no_output_means_no_outcome() {
        let spec = NewTask::new("t", "* * * * *", vec![]);
        let task = ScheduledTask::new("alice", spec, "UTC".into(), Utc::now());
        assert!(dispatcher().deliver(&task, &[]).await.is_none());
    }

    #[tokio::test]
    async fn email_is_skipped() {
        let mut spec = NewTask::new("t", "* * * * *", vec![]);
        spec.output = OutputSpec::Email(EmailSpec {
            recipients: vec!["ops@example.com".into()],
        });
        let task = ScheduledTask::new("alice", spec, "UTC".into(), Utc::now());
        let outcome = dispatcher().deliver(&task, &[]).await.unwrap();
        assert_eq!(outcome.status, OutputStatus::Skipped);
    }

    #[tokio::test]
    async fn unreachable_webhook_fails_without_error() {
        // port 9 (discard) on localhost is closed in test environments
        let spec = OutputSpec::Webhook(WebhookSpec::new("http://127.0.0.1:9/hook"));
        let outcome = dispatcher().test_delivery(&spec).await.unwrap();
        assert_eq!(outcome.status, OutputStatus::Failed);
        assert!(!outcome.message.is_empty());
    }

    #[tokio::test]
    async fn test_delivery_without_output_is_none() {
        assert!(dispatcher().test_delivery(&OutputSpec::None).await.is_none());
    }
}
