use std::collections::HashMap;

use engage_core::config::AppConfig;
use engage_core::types::{Contact, MessagePayload};

/// A contact reachable on every channel through one phone number.
pub fn phone_contact(id: &str, phone: &str) -> Contact {
    Contact::new(id).with_phone(phone)
}

/// A contact with attributes, for decision predicates.
pub fn contact_with_attributes(id: &str, phone: &str, attrs: &[(&str, &str)]) -> Contact {
    let mut contact = phone_contact(id, phone);
    contact.attributes = attrs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<HashMap<_, _>>();
    contact
}

pub fn text_payload(body: &str) -> MessagePayload {
    MessagePayload {
        template: "test".into(),
        body: body.into(),
        cost_class: None,
    }
}

/// Config tuned for tests: no jitter, short backoff and lease.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.engine.jitter = false;
    config.engine.initial_backoff_ms = 1_000;
    config.engine.max_backoff_ms = 8_000;
    config.engine.lease_secs = 30;
    config.dispatch.timeout_ms = 500;
    config
}

/// A fresh temp directory for SQLite files; removed on drop.
pub fn temp_data_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}
