//! Scraper units: the black-box work a job performs.
//!
//! The orchestrator knows two kinds of unit, expressed as the closed
//! [`JobUnit`] variant:
//! - [`CommandScraper`] runs an external process that prints one JSON record
//!   per stdout line.
//! - any in-process [`Scraper`] implementation (closures via [`FnScraper`]).

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use civic_core::{CommandSettings, ErrorClass};

/// What a running scraper knows about itself.
#[derive(Debug, Clone)]
pub struct ScrapeContext {
    pub job_name: String,
    pub batch_id: Uuid,
    pub attempt: u32,
}

/// One collected record. `id` is the stable identity used for upserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedRecord {
    pub id: String,
    pub payload: serde_json::Value,
}

impl ScrapedRecord {
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// Everything a scraper hands back when it completes.
#[derive(Debug, Clone, Default)]
pub struct ScrapeOutput {
    pub records: Vec<ScrapedRecord>,
    /// Internal errors the scraper reported but recovered from.
    pub errors: Vec<String>,
}

impl ScrapeOutput {
    pub fn records(records: Vec<ScrapedRecord>) -> Self {
        Self {
            records,
            errors: Vec::new(),
        }
    }
}

/// Error type for a scraper that could not produce usable output.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScrapeError {
    #[error("missing dependency: {0}")]
    MissingDependency(String),
    #[error("missing module: {0}")]
    MissingModule(String),
    #[error("TLS certificate error: {0}")]
    Tls(String),
    #[error("output does not match expected shape: {0}")]
    Schema(String),
    #[error("{0}")]
    Other(String),
}

impl ScrapeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ScrapeError::MissingDependency(_) => ErrorClass::MissingDependency,
            ScrapeError::MissingModule(_) => ErrorClass::MissingModule,
            ScrapeError::Tls(_) => ErrorClass::TlsCertificate,
            ScrapeError::Schema(_) => ErrorClass::SchemaMismatch,
            ScrapeError::Other(msg) => ErrorClass::classify(msg),
        }
    }
}

/// An in-process unit of scraping work.
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn run(&self, ctx: ScrapeContext) -> Result<ScrapeOutput, ScrapeError>;
}

type ScrapeFn = dyn Fn(ScrapeContext) -> BoxFuture<'static, Result<ScrapeOutput, ScrapeError>> + Send + Sync;

/// Adapts an async closure into a [`Scraper`].
pub struct FnScraper {
    f: Box<ScrapeFn>,
}

impl FnScraper {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ScrapeContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<ScrapeOutput, ScrapeError>> + Send + 'static,
    {
        Self {
            f: Box::new(move |ctx| Box::pin(f(ctx))),
        }
    }
}

#[async_trait]
impl Scraper for FnScraper {
    async fn run(&self, ctx: ScrapeContext) -> Result<ScrapeOutput, ScrapeError> {
        (self.f)(ctx).await
    }
}

/// The closed set of ways a job can be carried out.
#[derive(Clone)]
pub enum JobUnit {
    Command(CommandScraper),
    Native(Arc<dyn Scraper>),
}

impl JobUnit {
    pub fn native(scraper: impl Scraper + 'static) -> Self {
        JobUnit::Native(Arc::new(scraper))
    }

    pub async fn run(&self, ctx: ScrapeContext) -> Result<ScrapeOutput, ScrapeError> {
        match self {
            JobUnit::Command(cmd) => cmd.run(ctx).await,
            JobUnit::Native(scraper) => scraper.run(ctx).await,
        }
    }
}

impl std::fmt::Debug for JobUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobUnit::Command(cmd) => f.debug_tuple("Command").field(&cmd.settings.program).finish(),
            JobUnit::Native(_) => f.write_str("Native"),
        }
    }
}

// ── Command scraper ─────────────────────────────────────────────────

/// Stderr lines kept for error reporting.
const STDERR_TAIL: usize = 20;

/// Runs a scraper as a child process.
///
/// Protocol: each stdout line is a JSON object with a string `id` field; the
/// whole object becomes the record payload. Lines that are not such objects
/// are reported as internal errors. A non-zero exit with no records is a
/// failure classified from the stderr tail; with records it is a partial
/// success. The child is killed if the run is abandoned.
#[derive(Debug, Clone)]
pub struct CommandScraper {
    settings: Arc<CommandSettings>,
}

impl CommandScraper {
    pub fn new(settings: CommandSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    pub async fn run(&self, ctx: ScrapeContext) -> Result<ScrapeOutput, ScrapeError> {
        let s = &self.settings;
        let mut cmd = Command::new(&s.program);
        cmd.args(&s.args)
            .envs(&s.env)
            .env("CIVIC_JOB_NAME", &ctx.job_name)
            .env("CIVIC_BATCH_ID", ctx.batch_id.to_string())
            .env("CIVIC_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &s.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ScrapeError::MissingDependency(format!("{}: command not found", s.program))
            }
            _ => ScrapeError::Other(format!("failed to spawn {}: {}", s.program, e)),
        })?;

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut tail = std::collections::VecDeque::with_capacity(STDERR_TAIL);
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            tail.into_iter().collect::<Vec<_>>()
        });

        let mut output = ScrapeOutput::default();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match parse_record_line(&line) {
                            Ok(record) => output.records.push(record),
                            Err(e) => output.errors.push(e),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        output.errors.push(format!("stdout read error: {}", e));
                        break;
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ScrapeError::Other(format!("failed to wait for {}: {}", s.program, e)))?;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        debug!(
            job = %ctx.job_name,
            status = %status,
            records = output.records.len(),
            "scraper process exited"
        );

        if status.success() {
            return Ok(output);
        }

        let reason = if stderr_tail.is_empty() {
            format!("{} exited with {}", s.program, status)
        } else {
            stderr_tail.join("\n")
        };
        if output.records.is_empty() {
            Err(ScrapeError::Other(reason))
        } else {
            output.errors.push(reason);
            Ok(output)
        }
    }
}

/// Parse one stdout line into a record.
fn parse_record_line(line: &str) -> Result<ScrapedRecord, String> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| format!("invalid type in record line: {}", e))?;
    let id = value
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| "record is missing field `id`".to_string())?
        .to_string();
    Ok(ScrapedRecord { id, payload: value })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ScrapeContext {
        ScrapeContext {
            job_name: "test".into(),
            batch_id: Uuid::new_v4(),
            attempt: 1,
        }
    }

    #[test]
    fn parse_record_line_requires_string_id() {
        let rec = parse_record_line(r#"{"id":"p-1","name":"Ada"}"#).unwrap();
        assert_eq!(rec.id, "p-1");
        assert_eq!(rec.payload["name"], "Ada");

        let err = parse_record_line(r#"{"name":"Ada"}"#).unwrap_err();
        assert_eq!(ErrorClass::classify(&err), ErrorClass::SchemaMismatch);

        let err = parse_record_line("not json").unwrap_err();
        assert_eq!(ErrorClass::classify(&err), ErrorClass::SchemaMismatch);
    }

    #[test]
    fn scrape_error_classes() {
        assert_eq!(ScrapeError::Tls("x".into()).class(), ErrorClass::TlsCertificate);
        assert_eq!(ScrapeError::MissingModule("x".into()).class(), ErrorClass::MissingModule);
        assert_eq!(
            ScrapeError::Other("certificate has expired".into()).class(),
            ErrorClass::TlsCertificate
        );
        assert_eq!(ScrapeError::Other("boom".into()).class(), ErrorClass::Unknown);
    }

    #[tokio::test]
    async fn fn_scraper_runs_closure() {
        let unit = JobUnit::native(FnScraper::new(|ctx: ScrapeContext| async move {
            Ok(ScrapeOutput::records(vec![ScrapedRecord::new(
                ctx.job_name.clone(),
                serde_json::json!({ "attempt": ctx.attempt }),
            )]))
        }));
        let out = unit.run(ctx()).await.unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].id, "test");
    }

    #[tokio::test]
    async fn missing_program_is_missing_dependency() {
        let cmd = CommandScraper::new(CommandSettings {
            program: "civic-definitely-not-installed".into(),
            args: vec![],
            workdir: None,
            env: Default::default(),
        });
        let err = cmd.run(ctx()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::MissingDependency);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_scraper_reads_records_and_errors() {
        let cmd = CommandScraper::new(CommandSettings {
            program: "sh".into(),
            args: vec![
                "-c".into(),
                r#"echo '{"id":"a","v":1}'; echo 'garbage'; echo '{"id":"b","v":2}'"#.into(),
            ],
            workdir: None,
            env: Default::default(),
        });
        let out = cmd.run(ctx()).await.unwrap();
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.errors.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_failure_without_records_is_classified_from_stderr() {
        let cmd = CommandScraper::new(CommandSettings {
            program: "sh".into(),
            args: vec!["-c".into(), "echo 'SSL certificate verify failed' >&2; exit 3".into()],
            workdir: None,
            env: Default::default(),
        });
        let err = cmd.run(ctx()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::TlsCertificate);
    }
}
