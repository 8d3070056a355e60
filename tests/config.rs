use std::io::Write;
use std::time::Duration;

use deploygraph::logging::parse_level_str;
use deploygraph::{DeployGraphError, EngineConfig, OutputRule};
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn loads_every_field_from_file() {
    let file = write_config(
        r#"
[engine]
node_timeout_secs = 900
cancel_on_failure = true
output_rule = { terminal = "CommitCreate" }
secret_namespace = "vault"
log_level = "debug"
"#,
    );

    let cfg = EngineConfig::load(file.path()).unwrap();
    assert_eq!(cfg.node_timeout(), Some(Duration::from_secs(900)));
    assert!(cfg.cancel_on_failure);
    assert_eq!(cfg.output_rule, OutputRule::Terminal("CommitCreate".to_string()));
    assert_eq!(cfg.secret_namespace, "vault");
    assert_eq!(cfg.log_level.as_deref(), Some("debug"));
}

#[test]
fn missing_fields_use_defaults() {
    let cfg = EngineConfig::from_toml_str("[engine]\n").unwrap();
    assert_eq!(cfg, EngineConfig::default());
    assert_eq!(cfg.node_timeout(), None);
    assert!(!cfg.cancel_on_failure);
    assert_eq!(cfg.output_rule, OutputRule::LastCompleted);
    assert_eq!(cfg.secret_namespace, "secrets");

    let empty = EngineConfig::from_toml_str("").unwrap();
    assert_eq!(empty, EngineConfig::default());
}

#[test]
fn positional_rule_can_be_spelled_out() {
    let cfg = EngineConfig::from_toml_str("[engine]\noutput_rule = \"last_completed\"\n").unwrap();
    assert_eq!(cfg.output_rule, OutputRule::LastCompleted);
}

#[test]
fn zero_timeout_is_rejected() {
    let err = EngineConfig::from_toml_str("[engine]\nnode_timeout_secs = 0\n").unwrap_err();
    assert!(matches!(err, DeployGraphError::Validation(msg) if msg.contains("node_timeout_secs")));
}

#[test]
fn empty_terminal_name_is_rejected() {
    let err = EngineConfig::from_toml_str("[engine]\noutput_rule = { terminal = \" \" }\n")
        .unwrap_err();
    assert!(matches!(err, DeployGraphError::Validation(_)));
}

#[test]
fn empty_secret_namespace_is_rejected() {
    let cfg = EngineConfig {
        secret_namespace: String::new(),
        ..EngineConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn unreadable_or_malformed_files_are_errors() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    assert!(matches!(
        EngineConfig::load(&missing),
        Err(DeployGraphError::Validation(msg)) if msg.contains("absent.toml")
    ));

    let file = write_config("[engine\nnode_timeout_secs = ");
    assert!(EngineConfig::load(file.path()).is_err());

    let file = write_config("[engine]\ncancel_on_failure = \"yes\"\n");
    assert!(EngineConfig::load(file.path()).is_err());
}

#[test]
fn log_levels_parse_case_insensitively() {
    assert_eq!(parse_level_str("DEBUG"), Some(tracing::Level::DEBUG));
    assert_eq!(parse_level_str(" warning "), Some(tracing::Level::WARN));
    assert_eq!(parse_level_str("trace"), Some(tracing::Level::TRACE));
    assert_eq!(parse_level_str("loud"), None);
}
