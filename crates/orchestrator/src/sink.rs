//! Persistence collaborator: idempotent upserts of scraped records.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use civic_core::{SinkKind, SinkSettings};

use crate::locks::{read, write};
use crate::scraper::ScrapedRecord;

/// Result of one upsert call. Rows are keyed by record id, so repeating an
/// upsert leaves the store unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub accepted: usize,
    pub rejected: usize,
    pub error: Option<String>,
}

impl UpsertReport {
    pub fn is_degraded(&self) -> bool {
        self.rejected > 0 || self.error.is_some()
    }
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn upsert_records(&self, job_name: &str, records: &[ScrapedRecord]) -> UpsertReport;
}

/// Build the sink selected in `[sink]`.
pub fn open_sink(settings: &SinkSettings) -> Arc<dyn RecordSink> {
    match settings.kind {
        SinkKind::Memory => Arc::new(MemorySink::new()),
        SinkKind::File => Arc::new(FileSink::new(&settings.dir)),
    }
}

/// Splits out records without an id. Later duplicates of an id win.
fn partition_valid(records: &[ScrapedRecord]) -> (BTreeMap<&str, &serde_json::Value>, usize) {
    let mut rows = BTreeMap::new();
    let mut rejected = 0;
    for rec in records {
        if rec.id.trim().is_empty() {
            rejected += 1;
        } else {
            rows.insert(rec.id.as_str(), &rec.payload);
        }
    }
    (rows, rejected)
}

// ── Memory sink ─────────────────────────────────────────────────────

/// In-process store keyed by (job, record id).
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: RwLock<HashMap<String, HashMap<String, serde_json::Value>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> usize {
        read(&self.rows).values().map(HashMap::len).sum()
    }

    pub fn rows_for(&self, job_name: &str) -> usize {
        read(&self.rows).get(job_name).map_or(0, HashMap::len)
    }

    pub fn get(&self, job_name: &str, id: &str) -> Option<serde_json::Value> {
        read(&self.rows).get(job_name)?.get(id).cloned()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn upsert_records(&self, job_name: &str, records: &[ScrapedRecord]) -> UpsertReport {
        let (rows, rejected) = partition_valid(records);
        let accepted = rows.len();
        let mut store = write(&self.rows);
        let table = store.entry(job_name.to_string()).or_default();
        for (id, payload) in rows {
            table.insert(id.to_string(), payload.clone());
        }
        UpsertReport {
            accepted,
            rejected,
            error: None,
        }
    }
}

// ── File sink ───────────────────────────────────────────────────────

/// One JSON object per job (`<dir>/<job>.json`, record id → payload). Job
/// names are percent-encoded, so distinct jobs never share a file.
/// Each upsert merges into the existing document and replaces it atomically.
#[derive(Debug)]
pub struct FileSink {
    dir: PathBuf,
    // Read-merge-write must not interleave.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileSink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path_for(&self, job_name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", urlencoding::encode(job_name)))
    }

    async fn merge_into(
        &self,
        path: &Path,
        rows: BTreeMap<&str, &serde_json::Value>,
    ) -> Result<usize, String> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| format!("create {}: {}", self.dir.display(), e))?;

        let mut doc: BTreeMap<String, serde_json::Value> = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| format!("existing {} is unreadable: {}", path.display(), e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(format!("read {}: {}", path.display(), e)),
        };
        for (id, payload) in rows {
            doc.insert(id.to_string(), payload.clone());
        }

        let json = serde_json::to_vec_pretty(&doc).map_err(|e| format!("serialize: {}", e))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| format!("write {}: {}", tmp.display(), e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| format!("rename {}: {}", tmp.display(), e))?;
        Ok(doc.len())
    }
}

#[async_trait]
impl RecordSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn upsert_records(&self, job_name: &str, records: &[ScrapedRecord]) -> UpsertReport {
        let (rows, rejected) = partition_valid(records);
        if rows.is_empty() {
            return UpsertReport {
                accepted: 0,
                rejected,
                error: None,
            };
        }
        let accepted = rows.len();
        let path = self.path_for(job_name);

        let _guard = self.write_lock.lock().await;
        match self.merge_into(&path, rows).await {
            Ok(total) => {
                debug!(job = %job_name, accepted, total, path = %path.display(), "records upserted");
                UpsertReport {
                    accepted,
                    rejected,
                    error: None,
                }
            }
            Err(e) => {
                warn!(job = %job_name, error = %e, "record upsert failed");
                UpsertReport {
                    accepted: 0,
                    rejected: rejected + accepted,
                    error: Some(e),
                }
            }
        }
    }
}
