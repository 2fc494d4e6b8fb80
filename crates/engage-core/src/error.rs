use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngageError {
    // Ledger errors
    #[error("Insufficient funds for tenant {tenant}: requested {requested}, available {available}")]
    InsufficientFunds {
        tenant: String,
        requested: Decimal,
        available: Decimal,
    },

    #[error("Unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("Inactive tenant: {0}")]
    InactiveTenant(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    // Dispatch errors
    #[error("Channel unavailable: {channel}: {message}")]
    ChannelUnavailable {
        channel: String,
        message: String,
        transient: bool,
    },

    #[error("Rate limited on channel {channel}")]
    RateLimited {
        channel: String,
        retry_after_secs: Option<u64>,
    },

    #[error("Invalid destination on channel {channel}: {message}")]
    InvalidDestination { channel: String, message: String },

    // Flow errors
    #[error("Flow not active: {0}")]
    FlowNotActive(String),

    #[error("Run already active for flow {flow} and contact {contact}")]
    AlreadyRunning { flow: String, contact: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Run already terminal: {0}")]
    AlreadyTerminal(String),

    /// Optimistic concurrency conflict on a run record. Recovered by the
    /// stepper; never surfaced to callers of the public APIs.
    #[error("Version conflict on run {run}: expected version {expected}")]
    VersionConflict { run: String, expected: i64 },

    #[error("Flow validation failed: {0}")]
    Validation(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngageError {
    /// Whether a dispatch failure may succeed if attempted again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngageError::RateLimited { .. } => true,
            EngageError::ChannelUnavailable { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Short machine-readable code, used in step history and attempt records.
    pub fn code(&self) -> &'static str {
        match self {
            EngageError::InsufficientFunds { .. } => "insufficient_funds",
            EngageError::UnknownTenant(_) => "unknown_tenant",
            EngageError::InactiveTenant(_) => "inactive_tenant",
            EngageError::InvalidAmount(_) => "invalid_amount",
            EngageError::ChannelUnavailable { .. } => "channel_unavailable",
            EngageError::RateLimited { .. } => "rate_limited",
            EngageError::InvalidDestination { .. } => "invalid_destination",
            EngageError::FlowNotActive(_) => "flow_not_active",
            EngageError::AlreadyRunning { .. } => "already_running",
            EngageError::NotFound(_) => "not_found",
            EngageError::AlreadyTerminal(_) => "already_terminal",
            EngageError::VersionConflict { .. } => "version_conflict",
            EngageError::Validation(_) => "validation",
            EngageError::Config(_) | EngageError::ConfigNotFound(_) => "config",
            EngageError::Database(_) => "database",
            EngageError::Io(_) => "io",
            EngageError::Json(_) => "json",
        }
    }

    /// Storage-level failures. These are fatal to the current operation and
    /// must never be read as a business outcome.
    pub fn is_storage(&self) -> bool {
        matches!(self, EngageError::Database(_) | EngageError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, EngageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(EngageError::RateLimited {
            channel: "sms".into(),
            retry_after_secs: None
        }
        .is_retryable());
        assert!(EngageError::ChannelUnavailable {
            channel: "sms".into(),
            message: "timeout".into(),
            transient: true
        }
        .is_retryable());
        assert!(!EngageError::ChannelUnavailable {
            channel: "sms".into(),
            message: "provider confirmed non-delivery".into(),
            transient: false
        }
        .is_retryable());
        assert!(!EngageError::InvalidDestination {
            channel: "sms".into(),
            message: "bad number".into()
        }
        .is_retryable());
        assert!(!EngageError::InsufficientFunds {
            tenant: "t".into(),
            requested: Decimal::ONE,
            available: Decimal::ZERO
        }
        .is_retryable());
    }

    #[test]
    fn storage_errors_are_not_business_errors() {
        let e = EngageError::Database("disk I/O error".into());
        assert!(e.is_storage());
        assert!(!e.is_retryable());
        assert_eq!(e.code(), "database");
    }
}
