use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{Category, JobSpec};

/// How a single run of a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeKind {
    Success,
    PartialSuccess,
    Failure,
    Timeout,
}

impl OutcomeKind {
    /// Whether the run yielded records worth forwarding to the sink.
    pub fn produced_output(&self) -> bool {
        matches!(self, OutcomeKind::Success | OutcomeKind::PartialSuccess)
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutcomeKind::Success => "success",
            OutcomeKind::PartialSuccess => "partial-success",
            OutcomeKind::Failure => "failure",
            OutcomeKind::Timeout => "timeout",
        })
    }
}

/// Failure taxonomy attached to `failure` and `timeout` outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorClass {
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "missing-dependency")]
    MissingDependency,
    #[serde(rename = "missing-module")]
    MissingModule,
    #[serde(rename = "tls-certificate-error")]
    TlsCertificate,
    #[serde(rename = "attribute-or-schema-mismatch")]
    SchemaMismatch,
    #[serde(rename = "unknown")]
    Unknown,
}

const TLS_MARKERS: &[&str] = &["certificate", "tls", "ssl", "handshake"];
const MISSING_MODULE_MARKERS: &[&str] = &[
    "entry point",
    "no such module",
    "module not found",
    "not implemented",
    "no scraper",
];
const MISSING_DEPENDENCY_MARKERS: &[&str] = &[
    "no module named",
    "command not found",
    "missing dependency",
    "not installed",
    "cannot find library",
    "no such file",
];
const SCHEMA_MARKERS: &[&str] = &[
    "attribute",
    "schema",
    "missing field",
    "unknown field",
    "invalid type",
];

impl ErrorClass {
    /// Match a free-form error message against the known failure families.
    ///
    /// Checked in order: TLS, missing module, missing dependency, schema.
    pub fn classify(message: &str) -> ErrorClass {
        let m = message.to_ascii_lowercase();
        let hit = |markers: &[&str]| markers.iter().any(|k| m.contains(k));

        if hit(TLS_MARKERS) {
            ErrorClass::TlsCertificate
        } else if hit(MISSING_MODULE_MARKERS) {
            ErrorClass::MissingModule
        } else if hit(MISSING_DEPENDENCY_MARKERS) {
            ErrorClass::MissingDependency
        } else if hit(SCHEMA_MARKERS) {
            ErrorClass::SchemaMismatch
        } else {
            ErrorClass::Unknown
        }
    }

    /// Transient failures are worth another attempt inside the same batch.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorClass::Timeout | ErrorClass::TlsCertificate)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Timeout => "timeout",
            ErrorClass::MissingDependency => "missing-dependency",
            ErrorClass::MissingModule => "missing-module",
            ErrorClass::TlsCertificate => "tls-certificate-error",
            ErrorClass::SchemaMismatch => "attribute-or-schema-mismatch",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-fatal conditions surfaced on a run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarningKind {
    PersistenceDegraded,
}

/// A run that has started but not finished. Can only become an
/// [`ExecutionRecord`] by sealing it.
#[derive(Debug)]
pub struct OpenExecution {
    batch_id: Uuid,
    job_name: String,
    category: Category,
    attempt: u32,
    started_at: DateTime<Utc>,
}

impl OpenExecution {
    pub fn start(batch_id: Uuid, spec: &JobSpec, attempt: u32) -> Self {
        Self {
            batch_id,
            job_name: spec.name.clone(),
            category: spec.category,
            attempt,
            started_at: Utc::now(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn succeed(self, records: u64) -> ExecutionRecord {
        self.seal(OutcomeKind::Success, records, None, None)
    }

    pub fn partial(self, records: u64, errors: &[String]) -> ExecutionRecord {
        let class = errors.first().map(|e| ErrorClass::classify(e));
        self.seal(OutcomeKind::PartialSuccess, records, class, Some(errors.join("; ")))
    }

    pub fn fail(self, class: ErrorClass, error: impl Into<String>) -> ExecutionRecord {
        self.seal(OutcomeKind::Failure, 0, Some(class), Some(error.into()))
    }

    pub fn time_out(self, budget: Duration) -> ExecutionRecord {
        let msg = format!("exceeded {}s budget", budget.as_secs());
        self.seal(OutcomeKind::Timeout, 0, Some(ErrorClass::Timeout), Some(msg))
    }

    fn seal(
        self,
        outcome: OutcomeKind,
        records_produced: u64,
        error_class: Option<ErrorClass>,
        error: Option<String>,
    ) -> ExecutionRecord {
        ExecutionRecord {
            batch_id: self.batch_id,
            job_name: self.job_name,
            category: self.category,
            attempt: self.attempt,
            started_at: self.started_at,
            finished_at: Utc::now(),
            outcome,
            records_produced,
            error_class,
            error,
        }
    }
}

/// Sealed result of one attempted run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub batch_id: Uuid,
    pub job_name: String,
    pub category: Category,
    /// 1-based.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: OutcomeKind,
    pub records_produced: u64,
    pub error_class: Option<ErrorClass>,
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Cadence, SizeClass};

    fn spec() -> JobSpec {
        JobSpec::new("mun_toronto", Category::Municipal, SizeClass::Medium, Cadence::Daily)
    }

    #[test]
    fn classify_known_families() {
        assert_eq!(
            ErrorClass::classify("SSL: CERTIFICATE_VERIFY_FAILED"),
            ErrorClass::TlsCertificate
        );
        assert_eq!(
            ErrorClass::classify("scraper entry point `people` missing"),
            ErrorClass::MissingModule
        );
        assert_eq!(
            ErrorClass::classify("No module named 'lxml'"),
            ErrorClass::MissingDependency
        );
        assert_eq!(
            ErrorClass::classify("object has no attribute 'district'"),
            ErrorClass::SchemaMismatch
        );
        assert_eq!(ErrorClass::classify("connection reset by peer"), ErrorClass::Unknown);
    }

    #[test]
    fn only_timeouts_and_tls_are_transient() {
        assert!(ErrorClass::Timeout.is_transient());
        assert!(ErrorClass::TlsCertificate.is_transient());
        assert!(!ErrorClass::MissingDependency.is_transient());
        assert!(!ErrorClass::MissingModule.is_transient());
        assert!(!ErrorClass::Unknown.is_transient());
    }

    #[test]
    fn error_class_wire_names() {
        let json = serde_json::to_string(&ErrorClass::TlsCertificate).unwrap();
        assert_eq!(json, r#""tls-certificate-error""#);
        let json = serde_json::to_string(&ErrorClass::SchemaMismatch).unwrap();
        assert_eq!(json, r#""attribute-or-schema-mismatch""#);
        let json = serde_json::to_string(&OutcomeKind::PartialSuccess).unwrap();
        assert_eq!(json, r#""partial-success""#);
    }

    #[test]
    fn sealing_records_outcome_and_attempt() {
        let batch = Uuid::new_v4();
        let rec = OpenExecution::start(batch, &spec(), 2).succeed(12);
        assert_eq!(rec.batch_id, batch);
        assert_eq!(rec.attempt, 2);
        assert_eq!(rec.outcome, OutcomeKind::Success);
        assert_eq!(rec.records_produced, 12);
        assert!(rec.error_class.is_none());
        assert!(rec.finished_at >= rec.started_at);
    }

    #[test]
    fn timeout_discards_records() {
        let rec = OpenExecution::start(Uuid::new_v4(), &spec(), 1).time_out(Duration::from_secs(60));
        assert_eq!(rec.outcome, OutcomeKind::Timeout);
        assert_eq!(rec.records_produced, 0);
        assert_eq!(rec.error_class, Some(ErrorClass::Timeout));
    }

    #[test]
    fn partial_classifies_first_error() {
        let errors = vec!["row 4: missing field `ward`".to_string(), "row 9: boom".to_string()];
        let rec = OpenExecution::start(Uuid::new_v4(), &spec(), 1).partial(30, &errors);
        assert_eq!(rec.outcome, OutcomeKind::PartialSuccess);
        assert_eq!(rec.error_class, Some(ErrorClass::SchemaMismatch));
        assert!(rec.error.unwrap().contains("row 9"));
    }
}
