//! Error types for remint-core

use std::fmt::Write;
use std::time::Duration;

use thiserror::Error;

use crate::model::{RecordId, StoreLocation};

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for remint-core
#[derive(Error, Debug)]
pub enum Error {
    /// Reading the index failed
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    /// Writing a batch failed or timed out
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// A record's content could not produce a canonical identifier
    #[error("Derivation error for record {record_id} in {location}: {source}")]
    Derivation {
        location: StoreLocation,
        record_id: RecordId,
        #[source]
        source: DerivationError,
    },

    /// Store adapter errors outside of scan/apply (client construction etc.)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Scan(err) => Some(err.remediation()),
            Self::Apply(err) => Some(err.remediation()),
            Self::Derivation { location, record_id, .. } => Some(
                Remediation::new(format!(
                    "Record {record_id} in {location} lacks the fields its identifier is derived from. Fix or remove it, then re-run."
                ))
                .command("Preview affected records", "remint plan")
                .alternative("Narrow the source types so malformed legacy records are excluded."),
            ),
            Self::Store(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the log file directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("The store returned JSON remint could not handle.")
                    .alternative("Check that the store URL points at a compatible search cluster."),
            ),
        }
    }
}

/// Failures reported by a store adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Network failure or store unreachable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Non-success HTTP status
    #[error("store returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The store refused an individual document operation
    #[error("store rejected update of {record_id} in {location}: {reason}")]
    Rejected {
        location: String,
        record_id: String,
        reason: String,
    },

    /// The store did not answer within the request deadline
    #[error("store request timed out after {} ms", .0.as_millis())]
    Timeout(Duration),

    /// Response body did not have the expected shape
    #[error("invalid store response: {0}")]
    InvalidResponse(String),
}

impl StoreError {
    /// Whether re-running the migration later is likely to succeed without
    /// operator intervention.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Rejected { .. } | Self::InvalidResponse(_) => false,
        }
    }

    /// Operator-facing verdict on whether a plain re-run is worth trying.
    #[must_use]
    pub fn rerun_hint(&self) -> &'static str {
        if self.is_transient() {
            "The failure looks transient; re-running later is likely to succeed."
        } else {
            "The failure is not transient; re-running unchanged will fail the same way."
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) => Remediation::new(
                "The store is unreachable or overloaded. Wait for it to recover and re-run the migration.",
            )
            .command("Check cluster health", "curl -s \"$REMINT_STORE_URL/_cluster/health\"")
            .alternative("Lower migration.max_concurrency to reduce load on the store."),
            Self::Http { status, .. } if *status == 401 || *status == 403 => Remediation::new(
                "The store refused the credentials. Set store.username/store.password.",
            )
            .command("Show effective config", "remint config"),
            Self::Http { .. } => Remediation::new(
                "The store returned an error status. Inspect the store logs and re-run.",
            )
            .alternative("Check that store.indices names existing indices."),
            Self::Rejected { .. } => Remediation::new(
                "The store rejected a document update. Inspect the record, fix it, and re-run.",
            )
            .command("Preview operations", "remint plan"),
            Self::InvalidResponse(_) => Remediation::new(
                "The store response did not match the expected search/bulk format.",
            )
            .alternative("Verify store.url points at an Elasticsearch or OpenSearch cluster."),
        }
    }
}

/// The scanner could not read a page
#[derive(Error, Debug)]
#[error("scan stopped after {pages_read} pages ({records_read} records): {source}")]
pub struct ScanError {
    /// Pages successfully delivered before the failure
    pub pages_read: u64,
    /// Records successfully delivered before the failure
    pub records_read: u64,
    #[source]
    pub source: StoreError,
}

impl ScanError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        let mut remediation = self.source.remediation();
        remediation
            .alternatives
            .push("Nothing was written; re-running starts the scan from the beginning.".to_string());
        remediation.alternatives.push(self.source.rerun_hint().to_string());
        remediation
    }
}

/// Why a single batch failed
#[derive(Error, Debug)]
pub enum ApplyFailure {
    /// The store answered with an error
    #[error("{0}")]
    Store(#[from] StoreError),

    /// The batch exceeded its deadline
    #[error("batch timed out after {} ms", .0.as_millis())]
    Timeout(Duration),

    /// The worker running the batch died
    #[error("worker aborted: {0}")]
    Worker(String),
}

/// A batch write failed; carries exact progress made before the abort
#[derive(Error, Debug)]
#[error(
    "batch {} failed ({cause}); {batches_applied} batches / {operations_applied} operations applied before abort",
    batch_label(.failed_batch)
)]
pub struct ApplyError {
    /// Submission-order sequence number (1-indexed) of the first failing batch
    pub failed_batch: Option<usize>,
    /// Batches that completed successfully
    pub batches_applied: usize,
    /// Operations contained in the successfully applied batches
    pub operations_applied: u64,
    #[source]
    pub cause: ApplyFailure,
}

fn batch_label(batch: &Option<usize>) -> String {
    batch.map_or_else(|| "?".to_string(), |b| b.to_string())
}

impl ApplyError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        let summary = format!(
            "{} operations were written before the failure. Updates are idempotent: fix the cause and re-run the whole migration.",
            self.operations_applied
        );
        let mut remediation = Remediation::new(summary).command("Re-run", "remint up");
        match &self.cause {
            ApplyFailure::Timeout(_) => {
                remediation = remediation
                    .alternative("Raise migration.bulk_timeout_secs or lower migration.max_batch_size.");
            }
            ApplyFailure::Store(err) => {
                remediation.alternatives.push(err.remediation().summary);
                remediation.alternatives.push(err.rerun_hint().to_string());
            }
            ApplyFailure::Worker(_) => {
                remediation = remediation.alternative("Check the logs for the worker panic message.");
            }
        }
        remediation
    }
}

/// Identifier derivation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DerivationError {
    #[error("target entity type is empty")]
    EmptyType,

    #[error("field `{field}` required by {entity_type} identifiers is missing or not a scalar")]
    MissingField { entity_type: String, field: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the TOML syntax and retry.")
                .command("Show defaults", "remint config"),
            Self::SerializeFailed(_) => {
                Remediation::new("Failed to serialize configuration. Check config values.")
                    .alternative("Recreate the config from known-good defaults.")
            }
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Show effective config", "remint config")
                    .alternative("Review validation errors and adjust remint.toml.")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remediation_renders_commands_and_alternatives() {
        let text = Remediation::new("do the thing")
            .command("Run", "remint up")
            .alternative("or not")
            .render_plain();
        assert!(text.contains("To fix:"));
        assert!(text.contains("- Run: remint up"));
        assert!(text.contains("- or not"));
    }

    #[test]
    fn transient_classification() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(StoreError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(StoreError::Http { status: 503, body: String::new() }.is_transient());
        assert!(StoreError::Http { status: 429, body: String::new() }.is_transient());
        assert!(!StoreError::Http { status: 400, body: String::new() }.is_transient());
        assert!(!StoreError::InvalidResponse("x".into()).is_transient());
    }

    #[test]
    fn apply_error_reports_progress() {
        let err = ApplyError {
            failed_batch: Some(2),
            batches_applied: 1,
            operations_applied: 50,
            cause: ApplyFailure::Timeout(Duration::from_millis(1500)),
        };
        let msg = err.to_string();
        assert!(msg.contains("batch 2 failed"));
        assert!(msg.contains("1500 ms"));
        assert!(msg.contains("50 operations"));
        assert!(err.remediation().summary.contains("50 operations"));
    }

    #[test]
    fn unknown_failed_batch_renders_placeholder() {
        let err = ApplyError {
            failed_batch: None,
            batches_applied: 0,
            operations_applied: 0,
            cause: ApplyFailure::Worker("boom".into()),
        };
        assert!(err.to_string().starts_with("batch ? failed"));
    }

    #[test]
    fn derivation_error_names_record() {
        let err = Error::Derivation {
            location: StoreLocation::new("idx_sdo-000001"),
            record_id: RecordId::new("abc"),
            source: DerivationError::MissingField {
                entity_type: "Incident".into(),
                field: "name".into(),
            },
        };
        let rendered = format_error_with_remediation(&err);
        assert!(rendered.contains("abc"));
        assert!(rendered.contains("idx_sdo-000001"));
        assert!(rendered.contains("`name`"));
    }

    #[test]
    fn scan_error_remediation_mentions_rerun() {
        let err = ScanError {
            pages_read: 3,
            records_read: 300,
            source: StoreError::Unavailable("connection refused".into()),
        };
        assert!(err.to_string().contains("3 pages"));
        let remediation = err.remediation();
        assert!(remediation.alternatives.iter().any(|a| a.contains("Nothing was written")));
        assert!(remediation.alternatives.iter().any(|a| a.contains("likely to succeed")));
    }

    #[test]
    fn permanent_store_failures_say_rerun_will_not_help() {
        let scan = ScanError {
            pages_read: 0,
            records_read: 0,
            source: StoreError::Http { status: 400, body: "bad query".into() },
        };
        assert!(scan.remediation().alternatives.iter().any(|a| a.contains("not transient")));

        let apply = ApplyError {
            failed_batch: Some(1),
            batches_applied: 0,
            operations_applied: 0,
            cause: ApplyFailure::Store(StoreError::Rejected {
                location: "idx".into(),
                record_id: "r1".into(),
                reason: "mapper_parsing_exception".into(),
            }),
        };
        let rendered = format_error_with_remediation(&Error::Apply(apply));
        assert!(rendered.contains("not transient"), "got:\n{rendered}");

        let apply = ApplyError {
            failed_batch: Some(3),
            batches_applied: 2,
            operations_applied: 100,
            cause: ApplyFailure::Store(StoreError::Http { status: 503, body: String::new() }),
        };
        assert!(apply.remediation().alternatives.iter().any(|a| a.contains("likely to succeed")));
    }
}
