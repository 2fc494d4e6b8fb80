use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use engage_core::error::Result;
use engage_core::traits::ConversationSource;
use engage_core::types::{Channel, Contact, ConversationStatus};

/// Decision predicate. Evaluated synchronously against contact and
/// conversation state; never mutates anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// The contact sent an inbound message within the last `within_secs`.
    Replied {
        within_secs: u64,
        #[serde(default)]
        channel: Option<Channel>,
    },
    /// The contact's latest conversation has this status.
    ConversationStatus { is: ConversationStatus },
    /// A comparison over contact attributes, see [`evaluate_condition`].
    Attribute { expr: String },
}

impl Predicate {
    pub fn replied_within(secs: u64) -> Self {
        Predicate::Replied {
            within_secs: secs,
            channel: None,
        }
    }

    pub fn evaluate(
        &self,
        contact: &Contact,
        conversations: &dyn ConversationSource,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match self {
            Predicate::Replied {
                within_secs,
                channel,
            } => {
                let Some(conversation) = conversations.conversation_for(&contact.id, *channel) else {
                    return Ok(false);
                };
                let since = i64::try_from(*within_secs)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .and_then(|window| now.checked_sub_signed(window))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                conversations.has_replied(&conversation, since)
            }
            Predicate::ConversationStatus { is } => {
                match conversations.conversation_for(&contact.id, None) {
                    Some(conversation) => Ok(conversations.current_status(&conversation)? == *is),
                    None => Ok(false),
                }
            }
            Predicate::Attribute { expr } => Ok(evaluate_condition(expr, &contact.attributes)),
        }
    }

    /// Reject expressions that can never match.
    pub fn check(&self) -> std::result::Result<(), String> {
        match self {
            Predicate::Attribute { expr } => {
                if ["contains", "!=", "=="]
                    .iter()
                    .any(|op| parse_operator(expr.trim(), op).is_some_and(|(k, _)| !k.is_empty()))
                {
                    Ok(())
                } else {
                    Err(format!("unparseable attribute expression '{}'", expr))
                }
            }
            Predicate::Replied { within_secs: 0, .. } => {
                Err("replied window must be positive".into())
            }
            _ => Ok(()),
        }
    }
}

/// Evaluate a simple conditional expression against contact attributes.
///
/// Supported expressions:
/// - `key == "value"`: exact match
/// - `key != "value"`: not equal
/// - `key contains "substr"`: substring match
///
/// Returns `false` for unparseable expressions and missing keys.
pub fn evaluate_condition(expr: &str, attributes: &HashMap<String, String>) -> bool {
    let expr = expr.trim();

    if let Some((key, substr)) = parse_operator(expr, "contains") {
        return attributes.get(key).is_some_and(|s| s.contains(substr));
    }

    if let Some((key, value)) = parse_operator(expr, "!=") {
        return attributes.get(key).is_some_and(|s| s != value);
    }

    if let Some((key, value)) = parse_operator(expr, "==") {
        return attributes.get(key).is_some_and(|s| s == value);
    }

    false
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    Some((key.trim(), val.trim().trim_matches('"')))
}
