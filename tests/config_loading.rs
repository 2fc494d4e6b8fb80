use std::io::Write;
use std::str::FromStr;

use engage_core::config::AppConfig;
use engage_core::types::Channel;
use engage_core::EngageError;
use rust_decimal::Decimal;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(content.as_bytes()).expect("write toml");
    tmp
}

#[test]
fn test_load_full_config_from_file() {
    let tmp = write_config(
        r#"
[storage]
data_dir = "/tmp/engage-test"
busy_timeout_ms = 2500

[ledger]
default_currency = "EUR"
default_low_balance_threshold = "5.00"

[engine]
max_retries = 3
initial_backoff_ms = 500
max_backoff_ms = 60000
jitter = false
lease_secs = 15
max_steps_per_drive = 16

[dispatch]
timeout_ms = 2000

[worker]
poll_interval_ms = 250
concurrency = 4
batch_size = 50

[pricing]
sms = "0.07"
whatsapp = "0.09"

[pricing.classes.whatsapp]
marketing = "0.12"

[router]
flow_burst = 2
closed_retention_secs = 600
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.storage.data_dir, "/tmp/engage-test");
    assert_eq!(config.data_dir(), std::path::PathBuf::from("/tmp/engage-test"));
    assert_eq!(config.storage.busy_timeout_ms, 2500);
    assert_eq!(config.ledger.default_currency, "EUR");
    assert_eq!(config.ledger.default_low_balance_threshold, Decimal::new(5, 0));
    assert_eq!(config.engine.max_retries, 3);
    assert!(!config.engine.jitter);
    assert_eq!(config.engine.lease_secs, 15);
    assert_eq!(config.dispatch.timeout_ms, 2000);
    assert_eq!(config.worker.concurrency, 4);
    assert_eq!(config.worker.batch_size, 50);
    assert_eq!(config.pricing.unit_price(Channel::Sms), Decimal::from_str("0.07").unwrap());
    assert_eq!(config.pricing.unit_price(Channel::Voip), Decimal::new(10, 2));
    assert_eq!(
        config.pricing.classes["whatsapp"]["marketing"],
        Decimal::from_str("0.12").unwrap()
    );
    assert_eq!(config.router.flow_burst, 2);
    assert_eq!(config.router.closed_retention_secs, 600);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("ENGAGE_TEST_DATA_DIR", "/var/lib/engage-expanded");

    let tmp = write_config(
        r#"
[storage]
data_dir = "${ENGAGE_TEST_DATA_DIR}"
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.storage.data_dir, "/var/lib/engage-expanded");

    std::env::remove_var("ENGAGE_TEST_DATA_DIR");
}

#[test]
fn test_empty_config_uses_defaults() {
    let tmp = write_config("");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.ledger.default_currency, "USD");
    assert_eq!(config.engine.max_retries, 5);
    assert_eq!(config.engine.initial_backoff_ms, 30_000);
    assert_eq!(config.engine.max_backoff_ms, 3_600_000);
    assert!(config.engine.jitter);
    assert_eq!(config.dispatch.timeout_ms, 10_000);
    assert_eq!(config.worker.concurrency, 8);
    assert_eq!(config.router.flow_burst, 4);
    assert_eq!(config.router.closed_retention_secs, 86_400);
    assert_eq!(config.pricing.unit_price(Channel::Sms), Decimal::new(5, 2));
    assert!(config.pricing.classes.is_empty());
}

#[test]
fn test_negative_price_rejected() {
    let tmp = write_config(
        r#"
[pricing]
rcs = "-0.01"
"#,
    );

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, EngageError::Config(ref msg) if msg.contains("pricing.rcs")));
}

#[test]
fn test_unknown_pricing_class_channel_rejected() {
    let tmp = write_config(
        r#"
[pricing.classes.fax]
standard = "0.50"
"#,
    );

    assert!(matches!(AppConfig::load(tmp.path()), Err(EngageError::Config(_))));
}

#[test]
fn test_backoff_bounds_checked() {
    let tmp = write_config(
        r#"
[engine]
initial_backoff_ms = 10000
max_backoff_ms = 1000
"#,
    );

    assert!(matches!(AppConfig::load(tmp.path()), Err(EngageError::Config(_))));
}

#[test]
fn test_lease_must_outlast_dispatch_timeout() {
    let tmp = write_config(
        r#"
[engine]
lease_secs = 5

[dispatch]
timeout_ms = 5000
"#,
    );

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, EngageError::Config(ref msg) if msg.contains("lease_secs")));
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/engage.toml")).unwrap_err();
    assert!(matches!(err, EngageError::ConfigNotFound(_)));
}

#[test]
fn test_malformed_toml_rejected() {
    let tmp = write_config("[engine\nmax_retries = ");
    assert!(matches!(AppConfig::load(tmp.path()), Err(EngageError::Config(_))));
}
