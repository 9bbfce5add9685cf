//! Static catalog of known scraper jobs.

use indexmap::IndexMap;
use tracing::info;

use civic_core::{Cadence, Category, JobEntry, JobSpec, SizeClass};

use crate::scraper::{CommandScraper, JobUnit};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate job name in catalog: {0}")]
    DuplicateJob(String),
    #[error("job not found: {0}")]
    NotFound(String),
}

/// Optional constraints for [`JobRegistry::list`]. Unset fields match everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobFilter {
    pub category: Option<Category>,
    pub size: Option<SizeClass>,
    pub cadence: Option<Cadence>,
}

impl JobFilter {
    pub fn matches(&self, spec: &JobSpec) -> bool {
        self.category.map_or(true, |c| c == spec.category)
            && self.size.map_or(true, |s| s == spec.size)
            && self.cadence.map_or(true, |k| k == spec.cadence)
    }
}

#[derive(Debug)]
struct RegisteredJob {
    spec: JobSpec,
    unit: Option<JobUnit>,
}

/// Read-only job catalog, in load order.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: IndexMap<String, RegisteredJob>,
}

impl JobRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Build from `[[jobs]]` config entries. Entries with a `command` are
    /// bound to a [`CommandScraper`]; the rest are left unbound.
    pub fn from_entries(entries: &[JobEntry]) -> Result<Self, RegistryError> {
        let mut builder = Self::builder();
        for entry in entries {
            let unit = entry
                .command
                .clone()
                .map(|c| JobUnit::Command(CommandScraper::new(c)));
            builder = builder.job(entry.spec.clone(), unit);
        }
        builder.build()
    }

    /// Jobs matching `filter`, in catalog order.
    pub fn list(&self, filter: &JobFilter) -> Vec<&JobSpec> {
        self.jobs
            .values()
            .map(|j| &j.spec)
            .filter(|spec| filter.matches(spec))
            .collect()
    }

    pub fn get(&self, name: &str) -> Result<&JobSpec, RegistryError> {
        self.jobs
            .get(name)
            .map(|j| &j.spec)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// The unit bound to a job, if any.
    pub(crate) fn unit(&self, name: &str) -> Option<&JobUnit> {
        self.jobs.get(name).and_then(|j| j.unit.as_ref())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Collects jobs, then validates them into a [`JobRegistry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entries: Vec<RegisteredJob>,
    /// `bind` targets with no catalog entry.
    unmatched: Vec<String>,
}

impl RegistryBuilder {
    pub fn job(mut self, spec: JobSpec, unit: Option<JobUnit>) -> Self {
        self.entries.push(RegisteredJob { spec, unit });
        self
    }

    /// Bind an in-process unit to a job already added (or replace its unit).
    /// Naming a job that was never added fails the build.
    pub fn bind(mut self, name: &str, unit: JobUnit) -> Self {
        match self.entries.iter_mut().find(|e| e.spec.name == name) {
            Some(entry) => entry.unit = Some(unit),
            None => self.unmatched.push(name.to_string()),
        }
        self
    }

    /// Fails on the first unmatched binding, then on the first duplicate name.
    pub fn build(self) -> Result<JobRegistry, RegistryError> {
        if let Some(name) = self.unmatched.into_iter().next() {
            return Err(RegistryError::NotFound(name));
        }
        let mut jobs = IndexMap::with_capacity(self.entries.len());
        for entry in self.entries {
            if jobs.contains_key(&entry.spec.name) {
                return Err(RegistryError::DuplicateJob(entry.spec.name));
            }
            jobs.insert(entry.spec.name.clone(), entry);
        }
        let unbound = jobs.values().filter(|j| j.unit.is_none()).count();
        info!(jobs = jobs.len(), unbound, "job registry loaded");
        Ok(JobRegistry { jobs })
    }
}
