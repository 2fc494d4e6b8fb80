use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EngageError, Result};
use crate::types::Channel;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub router: RouterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the SQLite files. `~/` is expanded.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// How long a writer waits on a locked database before giving up.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_data_dir() -> String { "~/.engage".to_string() }
fn default_busy_timeout_ms() -> u64 { 5_000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Currency assigned to tenants created without an explicit one.
    #[serde(default = "default_currency")]
    pub default_currency: String,
    /// Low-balance threshold for tenants created without an explicit one.
    #[serde(default)]
    pub default_low_balance_threshold: Decimal,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_currency: default_currency(),
            default_low_balance_threshold: Decimal::ZERO,
        }
    }
}

fn default_currency() -> String { "USD".to_string() }

/// Flow stepping and retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retryable send failures tolerated before the run fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Spread retry times by 0.8x–1.2x.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    /// How long a stepper's claim on a run stays valid.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Upper bound on nodes advanced in one drive of a run.
    #[serde(default = "default_max_steps_per_drive")]
    pub max_steps_per_drive: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: default_jitter(),
            lease_secs: default_lease_secs(),
            max_steps_per_drive: default_max_steps_per_drive(),
        }
    }
}

fn default_max_retries() -> u32 { 5 }
fn default_initial_backoff_ms() -> u64 { 30_000 }
fn default_max_backoff_ms() -> u64 { 3_600_000 }
fn default_jitter() -> bool { true }
fn default_lease_secs() -> u64 { 60 }
fn default_max_steps_per_drive() -> usize { 64 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Per-send provider timeout. A timeout counts as transient unavailability.
    #[serde(default = "default_dispatch_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_dispatch_timeout_ms(),
        }
    }
}

fn default_dispatch_timeout_ms() -> u64 { 10_000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Runs driven in parallel by one worker process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Due runs fetched per sweep.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            concurrency: default_concurrency(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_poll_interval_ms() -> u64 { 1_000 }
fn default_concurrency() -> usize { 8 }
fn default_batch_size() -> usize { 100 }

/// Per-channel unit prices.
///
/// SMS is priced per segment, WhatsApp per template message, VOIP per
/// call and RCS per message. `classes` overrides the unit price for a cost
/// class: `[pricing.classes.whatsapp] marketing = "0.12"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_sms_price")]
    pub sms: Decimal,
    #[serde(default = "default_whatsapp_price")]
    pub whatsapp: Decimal,
    #[serde(default = "default_voip_price")]
    pub voip: Decimal,
    #[serde(default = "default_rcs_price")]
    pub rcs: Decimal,
    #[serde(default)]
    pub classes: HashMap<String, HashMap<String, Decimal>>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            sms: default_sms_price(),
            whatsapp: default_whatsapp_price(),
            voip: default_voip_price(),
            rcs: default_rcs_price(),
            classes: HashMap::new(),
        }
    }
}

impl PricingConfig {
    pub fn unit_price(&self, channel: Channel) -> Decimal {
        match channel {
            Channel::Sms => self.sms,
            Channel::WhatsApp => self.whatsapp,
            Channel::Voip => self.voip,
            Channel::Rcs => self.rcs,
        }
    }
}

fn default_sms_price() -> Decimal { Decimal::new(5, 2) }
fn default_whatsapp_price() -> Decimal { Decimal::new(8, 2) }
fn default_voip_price() -> Decimal { Decimal::new(10, 2) }
fn default_rcs_price() -> Decimal { Decimal::new(4, 2) }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Flow-originated conversations served back-to-back before a waiting
    /// human-originated one must be served.
    #[serde(default = "default_flow_burst")]
    pub flow_burst: usize,
    /// How long a closed conversation is kept before the worker forgets it.
    #[serde(default = "default_closed_retention_secs")]
    pub closed_retention_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            flow_burst: default_flow_burst(),
            closed_retention_secs: default_closed_retention_secs(),
        }
    }
}

fn default_flow_burst() -> usize { 4 }
fn default_closed_retention_secs() -> u64 { 86_400 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| EngageError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| EngageError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Reject values that would make the engine misbehave at run time.
    pub fn check(&self) -> Result<()> {
        for channel in Channel::ALL {
            if self.pricing.unit_price(channel).is_sign_negative() {
                return Err(EngageError::Config(format!(
                    "pricing.{} must not be negative",
                    channel
                )));
            }
        }
        for (code, classes) in &self.pricing.classes {
            code.parse::<Channel>()
                .map_err(|_| EngageError::Config(format!("pricing.classes: unknown channel '{}'", code)))?;
            if let Some((name, _)) = classes.iter().find(|(_, p)| p.is_sign_negative()) {
                return Err(EngageError::Config(format!(
                    "pricing.classes.{}.{} must not be negative",
                    code, name
                )));
            }
        }
        if self.engine.initial_backoff_ms > self.engine.max_backoff_ms {
            return Err(EngageError::Config(
                "engine.initial_backoff_ms exceeds engine.max_backoff_ms".into(),
            ));
        }
        if self.engine.lease_secs.saturating_mul(1000) <= self.dispatch.timeout_ms {
            return Err(EngageError::Config(
                "engine.lease_secs must outlast dispatch.timeout_ms".into(),
            ));
        }
        if self.worker.concurrency == 0 {
            return Err(EngageError::Config("worker.concurrency must be at least 1".into()));
        }
        Ok(())
    }

    /// Resolve the data directory (expand ~).
    pub fn data_dir(&self) -> PathBuf {
        let dir = &self.storage.data_dir;
        if let Some(rest) = dir.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(dir)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_ENGAGE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_ENGAGE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_ENGAGE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_ENGAGE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_ENGAGE_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_retries, 5);
        assert_eq!(config.engine.lease_secs, 60);
        assert_eq!(config.dispatch.timeout_ms, 10_000);
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.pricing.sms, Decimal::new(5, 2));
        assert_eq!(config.router.flow_burst, 4);
        assert_eq!(config.ledger.default_currency, "USD");
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_pricing_classes() {
        let toml_str = r#"
[pricing]
sms = "0.0075"

[pricing.classes.whatsapp]
marketing = "0.12"
utility = "0.03"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.pricing.sms, Decimal::new(75, 4));
        let wa = config.pricing.classes.get("whatsapp").unwrap();
        assert_eq!(wa.get("marketing"), Some(&Decimal::new(12, 2)));
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_check_rejects_unknown_pricing_channel() {
        let toml_str = r#"
[pricing.classes.fax]
standard = "1.00"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert!(matches!(config.check(), Err(EngageError::Config(_))));
    }

    #[test]
    fn test_check_rejects_inverted_backoff() {
        let toml_str = r#"
[engine]
initial_backoff_ms = 10000
max_backoff_ms = 500
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert!(config.check().is_err());
    }

    #[test]
    fn test_data_dir_expands_home() {
        let config = AppConfig::default();
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(config.data_dir(), PathBuf::from(home).join(".engage"));
        }

        let mut config = AppConfig::default();
        config.storage.data_dir = "/var/lib/engage".into();
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/engage"));
    }
}
