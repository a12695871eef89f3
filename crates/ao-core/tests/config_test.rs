use std::io::Write;

use ao_core::config::{BalanceStrategy, Config, ConfigError};
use ao_core::types::RuntimeKind;

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.daemon.host, "127.0.0.1");
    assert_eq!(cfg.daemon.port, 7420);
    assert_eq!(cfg.daemon.log_level, "info");
    assert_eq!(cfg.router.strategy, BalanceStrategy::RoundRobin);
    assert_eq!(cfg.runtime.docker_bin, "docker");
    assert!(cfg.agents.is_empty());
}

#[test]
fn config_roundtrip() {
    let cfg = Config::default();
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("[breaker]"));

    let parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.daemon.port, cfg.daemon.port);
    assert_eq!(parsed.health.unhealthy_after, cfg.health.unhealthy_after);
    parsed.validate().expect("config validates");
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[router]
strategy = "least_loaded"
retry_budget = 4

[breaker]
failure_threshold = 2
"#;
    let cfg: Config = toml::from_str(partial).expect("parse partial");
    assert_eq!(cfg.router.strategy, BalanceStrategy::LeastLoaded);
    assert_eq!(cfg.router.retry_budget, 4);
    assert_eq!(cfg.breaker.failure_threshold, 2);
    // defaults should fill in the rest
    assert_eq!(cfg.breaker.reset_timeout_ms, 30_000);
    assert_eq!(cfg.router.max_in_flight_per_instance, 64);
    cfg.validate().expect("config validates");
}

#[test]
fn load_from_file_with_bootstrap_agents() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(
        file,
        r#"
[daemon]
port = 9000

[[agents]]
id = "echo-1"
type = "echo"
version = "1.0.0"
runtime = "in-process"
capabilities = ["ping"]
replicas = 3
config = {{ handler = "echo" }}

[[agents]]
id = "grader"
type = "quiz"
version = "2.1.0"
runtime = "http"
config = {{ endpoints = ["http://127.0.0.1:8081"] }}

[agents.autoscale]
min_replicas = 1
max_replicas = 5
target_utilization = 0.6
"#
    )
    .expect("write config");

    let cfg = Config::load_from(file.path()).expect("load config");
    assert_eq!(cfg.daemon.port, 9000);
    assert_eq!(cfg.agents.len(), 2);

    let echo = &cfg.agents[0];
    assert_eq!(echo.definition.agent_type, "echo");
    assert_eq!(echo.definition.runtime, RuntimeKind::InProcess);
    assert_eq!(echo.replicas, 3);
    assert_eq!(echo.definition.config_str("handler"), Some("echo"));
    assert!(echo.definition.capabilities.contains("ping"));

    let grader = &cfg.agents[1];
    assert_eq!(grader.replicas, 1);
    assert_eq!(grader.definition.version.major, 2);
    let policy = grader.autoscale.as_ref().expect("autoscale policy");
    assert_eq!(policy.max_replicas, 5);
}

#[test]
fn invalid_autoscale_policy_fails_validation() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(
        file,
        r#"
[[agents]]
id = "bad"
type = "echo"
version = "1.0.0"
runtime = "in-process"

[agents.autoscale]
min_replicas = 4
max_replicas = 2
"#
    )
    .expect("write config");

    let err = Config::load_from(file.path()).expect_err("validation should fail");
    assert!(matches!(err, ConfigError::Validation(_)));
    assert!(err.to_string().contains("agents.bad.autoscale"));
}

#[test]
fn missing_file_is_io_error() {
    let err = Config::load_from("/definitely/not/here.toml").expect_err("missing file");
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn malformed_toml_is_parse_error() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(file, "[router\nstrategy = ").expect("write config");
    let err = Config::load_from(file.path()).expect_err("parse should fail");
    assert!(matches!(err, ConfigError::Parse(_)));
}
