use std::fs;
use std::time::Duration;

use serial_test::serial;
use tempfile::TempDir;

use super::settings::Settings;
use super::{load_config, load_config_from};

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.broker.queue_capacity, 1024);
    assert_eq!(settings.broker.publish_timeout_ms, 1000);
    assert_eq!(settings.broker.publish_timeout(), Duration::from_secs(1));
    assert_eq!(settings.logging.level, "info");
}

#[test]
#[serial]
fn load_config_without_sources_uses_defaults() {
    temp_env::with_vars_unset(
        [
            "TOPICBUS__BROKER__QUEUE_CAPACITY",
            "TOPICBUS__BROKER__PUBLISH_TIMEOUT_MS",
            "TOPICBUS__LOGGING__LEVEL",
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg, Settings::default());
        },
    );
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("topicbus.toml");
    let toml = r#"
        [broker]
        queue_capacity = 16

        [logging]
        level = "debug"
    "#;
    fs::write(&path, toml).expect("write config file");

    let cfg = load_config_from(&path).expect("load_config_from failed");
    assert_eq!(cfg.broker.queue_capacity, 16);
    // not present in the file, so the default survives
    assert_eq!(cfg.broker.publish_timeout_ms, 1000);
    assert_eq!(cfg.logging.level, "debug");
}

#[test]
#[serial]
fn environment_overrides_file() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("topicbus.toml");
    fs::write(&path, "[broker]\npublish_timeout_ms = 250\n").expect("write config file");

    temp_env::with_var("TOPICBUS__BROKER__PUBLISH_TIMEOUT_MS", Some("0"), || {
        let cfg = load_config_from(&path).expect("load_config_from failed");
        assert_eq!(cfg.broker.publish_timeout_ms, 0);
    });
}

#[test]
#[serial]
fn zero_queue_capacity_is_rejected() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("topicbus.toml");
    fs::write(&path, "[broker]\nqueue_capacity = 0\n").expect("write config file");

    assert!(load_config_from(&path).is_err());
}
