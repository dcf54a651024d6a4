//! Structured lifecycle outcomes for the messaging collaborator.

use std::fmt;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::artifact::SizeMetrics;
use crate::error::Step;
use crate::types::{Operation, OperationId, RequestId};

/// Outcome code of one lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "published")]
    Published,
    #[serde(rename = "verified")]
    Verified,
    #[serde(rename = "verification-pending")]
    VerificationPending,
    #[serde(rename = "no-op")]
    NoOp,
    #[serde(rename = "published-removed")]
    PublishedRemoved,
    #[serde(rename = "fully-removed")]
    FullyRemoved,
    PushFailed,
    ArtifactMissing,
    GateTimeout,
    #[serde(rename = "failed")]
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Published => "published",
            Outcome::Verified => "verified",
            Outcome::VerificationPending => "verification-pending",
            Outcome::NoOp => "no-op",
            Outcome::PublishedRemoved => "published-removed",
            Outcome::FullyRemoved => "fully-removed",
            Outcome::PushFailed => "PushFailed",
            Outcome::ArtifactMissing => "ArtifactMissing",
            Outcome::GateTimeout => "GateTimeout",
            Outcome::Failed => "failed",
        }
    }

    /// Whether the store ended in the state the operation intended.
    pub fn is_success(self) -> bool {
        !matches!(
            self,
            Outcome::PushFailed | Outcome::ArtifactMissing | Outcome::GateTimeout | Outcome::Failed
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts about one finished operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleReport {
    pub request_id: RequestId,
    pub operation: Operation,
    pub op_id: OperationId,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_metrics: Option<SizeMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Store revision the operation pushed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<Step>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl LifecycleReport {
    pub fn new(
        request_id: RequestId,
        operation: Operation,
        op_id: OperationId,
        outcome: Outcome,
    ) -> Self {
        Self {
            request_id,
            operation,
            op_id,
            outcome,
            url: None,
            size_metrics: None,
            fingerprint: None,
            revision: None,
            step: None,
            error_detail: None,
            finished_at: Utc::now(),
        }
    }
}

/// Receives every lifecycle report. Responsible for all user-facing messaging.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, report: &LifecycleReport) -> anyhow::Result<()>;
}

/// Writes reports to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, report: &LifecycleReport) -> anyhow::Result<()> {
        let url = report.url.as_deref().unwrap_or("-");
        if report.outcome.is_success() {
            tracing::info!(
                request_id = %report.request_id,
                operation = %report.operation,
                outcome = %report.outcome,
                url,
                "lifecycle operation finished"
            );
        } else {
            tracing::error!(
                request_id = %report.request_id,
                operation = %report.operation,
                outcome = %report.outcome,
                step = ?report.step,
                error = report.error_detail.as_deref().unwrap_or("-"),
                "lifecycle operation failed"
            );
        }
        Ok(())
    }
}

/// Appends one JSON object per report to stdout or a file.
#[derive(Debug)]
pub struct JsonLinesNotifier {
    target: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl JsonLinesNotifier {
    pub fn stdout() -> Self {
        Self {
            target: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            target: Some(path.into()),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Notifier for JsonLinesNotifier {
    async fn notify(&self, report: &LifecycleReport) -> anyhow::Result<()> {
        let line = serde_json::to_string(report).context("Failed to serialize report")?;
        let _guard = self.write_lock.lock().await;
        match &self.target {
            None => println!("{}", line),
            Some(path) => {
                use std::io::Write;
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("Failed to open report file: {}", path.display()))?;
                writeln!(file, "{}", line)
                    .with_context(|| format!("Failed to write report file: {}", path.display()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcome: Outcome) -> LifecycleReport {
        LifecycleReport::new(
            RequestId::new(42).unwrap(),
            Operation::Cleanup,
            OperationId::new(),
            outcome,
        )
    }

    #[test]
    fn outcome_codes_match_wire_names() {
        for outcome in [
            Outcome::Published,
            Outcome::Verified,
            Outcome::VerificationPending,
            Outcome::NoOp,
            Outcome::PublishedRemoved,
            Outcome::FullyRemoved,
            Outcome::PushFailed,
            Outcome::ArtifactMissing,
            Outcome::GateTimeout,
            Outcome::Failed,
        ] {
            let json = serde_json::to_string(&outcome).unwrap();
            assert_eq!(json, format!("\"{}\"", outcome.as_str()));
        }
    }

    #[test]
    fn report_omits_absent_facts() {
        let json = serde_json::to_value(report(Outcome::NoOp)).unwrap();
        assert_eq!(json["outcome"], "no-op");
        assert_eq!(json["request_id"], 42);
        assert_eq!(json["operation"], "cleanup");
        assert!(json.get("url").is_none());
        assert!(json.get("error_detail").is_none());
    }

    #[tokio::test]
    async fn json_lines_appends_to_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("reports.jsonl");
        let notifier = JsonLinesNotifier::file(&path);

        notifier.notify(&report(Outcome::FullyRemoved)).await.unwrap();
        let mut failed = report(Outcome::PushFailed);
        failed.step = Some(Step::Push);
        failed.error_detail = Some("rejected".into());
        notifier.notify(&failed).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<LifecycleReport> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].outcome, Outcome::FullyRemoved);
        assert_eq!(lines[1].step, Some(Step::Push));
    }

    #[test]
    fn failure_outcomes() {
        assert!(Outcome::NoOp.is_success());
        assert!(Outcome::VerificationPending.is_success());
        assert!(!Outcome::GateTimeout.is_success());
    }
}
