use std::path::PathBuf;
use std::time::Duration;

use super::types::{OrchestratorConfig, SinkKind};
use crate::job::{Cadence, Category, SizeClass};

#[test]
fn empty_toml_uses_defaults() {
    let cfg = OrchestratorConfig::from_toml("").unwrap();
    assert_eq!(cfg.pool.min_concurrency, 10);
    assert_eq!(cfg.pool.max_concurrency, 20);
    assert_eq!(cfg.timeouts.budget_for(SizeClass::Small), Duration::from_secs(30));
    assert_eq!(cfg.timeouts.budget_for(SizeClass::Medium), Duration::from_secs(60));
    assert_eq!(cfg.timeouts.budget_for(SizeClass::Large), Duration::from_secs(120));
    assert_eq!(cfg.retry.max_retries, 1);
    assert_eq!(cfg.sink.kind, SinkKind::Memory);
    assert!(cfg.jobs.is_empty());
}

#[test]
fn parse_full_toml() {
    let toml = r#"
[pool]
min_concurrency = 2
max_concurrency = 4
high_water_pct = 90.0
low_water_pct = 40.0

[timeouts]
medium_secs = 45

[retry]
max_retries = 2
backoff_secs = 5

[cadences]
daily = "30 1 * * *"

[reporting]
run_log = "data/runs/executions.jsonl"
sink_timeout_secs = 5

[sink]
kind = "file"
dir = "/var/lib/civic/records"

[[jobs]]
name = "ca_on_toronto"
category = "municipal"
size = "medium"
cadence = "daily"
command = { program = "scrape", args = ["ca_on_toronto"] }

[[jobs]]
name = "ca_house"
category = "parliamentary"
size = "large"
"#;
    let cfg = OrchestratorConfig::from_toml(toml).unwrap();
    assert_eq!(cfg.pool.min_concurrency, 2);
    assert_eq!(cfg.pool.max_concurrency, 4);
    assert_eq!(cfg.timeouts.medium_secs, 45);
    assert_eq!(cfg.timeouts.small_secs, 30);
    assert_eq!(cfg.retry.backoff_after(2), Duration::from_secs(10));
    assert_eq!(cfg.cadences.expression(Cadence::Daily), Some("30 1 * * *"));
    assert_eq!(cfg.cadences.expression(Cadence::Manual), None);
    assert_eq!(cfg.reporting.run_log, Some(PathBuf::from("data/runs/executions.jsonl")));
    assert_eq!(cfg.reporting.sink_timeout(), Duration::from_secs(5));
    assert_eq!(cfg.sink.kind, SinkKind::File);

    assert_eq!(cfg.jobs.len(), 2);
    let toronto = &cfg.jobs[0];
    assert_eq!(toronto.spec.category, Category::Municipal);
    assert_eq!(toronto.spec.cadence, Cadence::Daily);
    let cmd = toronto.command.as_ref().unwrap();
    assert_eq!(cmd.program, "scrape");
    assert_eq!(cmd.args, vec!["ca_on_toronto".to_string()]);

    let house = &cfg.jobs[1];
    assert_eq!(house.spec.cadence, Cadence::Manual);
    assert!(house.command.is_none());
}

#[test]
fn rejects_inverted_pool_bounds() {
    let err = OrchestratorConfig::from_toml("[pool]\nmin_concurrency = 8\nmax_concurrency = 4\n").unwrap_err();
    assert!(err.to_string().contains("exceeds"));
}

#[test]
fn rejects_zero_floor() {
    assert!(OrchestratorConfig::from_toml("[pool]\nmin_concurrency = 0\n").is_err());
}

#[test]
fn rejects_zero_timeout() {
    let err = OrchestratorConfig::from_toml("[timeouts]\nlarge_secs = 0\n").unwrap_err();
    assert!(err.to_string().contains("large"));
}

#[test]
fn rejects_zero_sink_timeout() {
    let err = OrchestratorConfig::from_toml("[reporting]\nsink_timeout_secs = 0\n").unwrap_err();
    assert!(err.to_string().contains("sink_timeout_secs"));
}

#[test]
fn rejects_inverted_water_marks() {
    let toml = "[pool]\nhigh_water_pct = 40.0\nlow_water_pct = 60.0\n";
    assert!(OrchestratorConfig::from_toml(toml).is_err());
}

#[test]
fn rejects_unknown_category() {
    let toml = r#"
[[jobs]]
name = "x"
category = "federal"
size = "small"
"#;
    assert!(OrchestratorConfig::from_toml(toml).is_err());
}

#[test]
fn missing_file_is_io_error() {
    let err = OrchestratorConfig::from_file("/definitely/not/here.toml").unwrap_err();
    assert!(matches!(err, crate::error::CoreError::Io(_)));
}
