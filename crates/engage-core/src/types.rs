use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngageError, Result};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn from_string(s: &str) -> Self {
                Self(s.to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Billable account identifier.
    TenantId
);
string_id!(
    /// Flow definition identifier.
    FlowId
);
string_id!(
    /// Identifier of one execution of a flow against one contact.
    RunId
);
string_id!(ContactId);
string_id!(ConversationId);

/// Messaging channel. The set is closed: every stepper and pricing match
/// over it is exhaustive.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Sms,
    WhatsApp,
    Voip,
    Rcs,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Sms, Channel::WhatsApp, Channel::Voip, Channel::Rcs];

    pub fn code(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::WhatsApp => "whatsapp",
            Channel::Voip => "voip",
            Channel::Rcs => "rcs",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Channel {
    type Err = EngageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sms" => Ok(Channel::Sms),
            "whatsapp" => Ok(Channel::WhatsApp),
            "voip" => Ok(Channel::Voip),
            "rcs" => Ok(Channel::Rcs),
            other => Err(EngageError::Validation(format!(
                "unknown channel code '{}'",
                other
            ))),
        }
    }
}

/// Parse a money amount from its decimal string form.
///
/// Accepts at most four fractional digits; anything finer is rejected
/// rather than rounded.
pub fn parse_amount(s: &str) -> Result<Decimal> {
    let amount = Decimal::from_str(s.trim())
        .map_err(|e| EngageError::InvalidAmount(format!("'{}': {}", s, e)))?;
    if amount.scale() > 4 {
        return Err(EngageError::InvalidAmount(format!(
            "'{}': more than 4 fractional digits",
            s
        )));
    }
    Ok(amount.normalize())
}

/// Rendered content handed to a channel provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Template reference (provider-side template name for WhatsApp).
    pub template: String,
    /// Rendered body. For VOIP this is the text-to-speech script.
    #[serde(default)]
    pub body: String,
    /// Optional pricing class (e.g. "marketing", "utility").
    #[serde(default)]
    pub cost_class: Option<String>,
}

/// What a provider reports back for an accepted send.
#[derive(Debug, Clone)]
pub struct ProviderReceipt {
    pub provider_message_id: String,
    /// Provider-billed cost, when the provider reports one.
    pub cost: Option<Decimal>,
}

/// Failure reported by a channel provider.
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// The provider could not take the message. `transient = false` means
    /// the provider confirmed non-delivery and a retry will not help.
    Unavailable { message: String, transient: bool },
    RateLimited { retry_after_secs: Option<u64> },
    InvalidDestination(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Unavailable { message, transient } => {
                write!(f, "unavailable ({}): {}", if *transient { "transient" } else { "terminal" }, message)
            }
            ProviderError::RateLimited { retry_after_secs } => match retry_after_secs {
                Some(s) => write!(f, "rate limited, retry after {}s", s),
                None => write!(f, "rate limited"),
            },
            ProviderError::InvalidDestination(msg) => write!(f, "invalid destination: {}", msg),
        }
    }
}

impl ProviderError {
    pub fn into_engage(self, channel: Channel) -> EngageError {
        match self {
            ProviderError::Unavailable { message, transient } => EngageError::ChannelUnavailable {
                channel: channel.to_string(),
                message,
                transient,
            },
            ProviderError::RateLimited { retry_after_secs } => EngageError::RateLimited {
                channel: channel.to_string(),
                retry_after_secs,
            },
            ProviderError::InvalidDestination(message) => EngageError::InvalidDestination {
                channel: channel.to_string(),
                message,
            },
        }
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Waiting => "waiting",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = EngageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "waiting" => Ok(RunStatus::Waiting),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(EngageError::Database(format!("unknown run status '{}'", other))),
        }
    }
}

/// Conversation status as seen by the router.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Open,
    Assigned,
    Closed,
}

/// A contact as exposed by the contact collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    /// Owning tenant, when the directory tracks one.
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub whatsapp: Option<String>,
    #[serde(default)]
    pub rcs: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub opted_out: bool,
}

impl Contact {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: ContactId(id.into()),
            ..Default::default()
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_whatsapp(mut self, number: impl Into<String>) -> Self {
        self.whatsapp = Some(number.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// The address to use on a channel. WhatsApp and RCS fall back to the
    /// phone number when no dedicated address is set.
    pub fn address(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Sms | Channel::Voip => self.phone.as_deref(),
            Channel::WhatsApp => self.whatsapp.as_deref().or(self.phone.as_deref()),
            Channel::Rcs => self.rcs.as_deref().or(self.phone.as_deref()),
        }
    }
}

/// Events published on the engine's event bus.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    RunStarted {
        run_id: RunId,
        flow_id: FlowId,
        contact_id: ContactId,
    },
    StepCompleted {
        run_id: RunId,
        node_id: String,
        outcome: String,
    },
    RunWaiting {
        run_id: RunId,
        resume_at: DateTime<Utc>,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        reason: String,
    },
    DispatchAttempted {
        tenant_id: TenantId,
        channel: Channel,
        outcome: String,
        cost: Decimal,
    },
    LowBalance {
        tenant_id: TenantId,
        balance: Decimal,
        threshold: Decimal,
        /// Parent chain, nearest first. Lets parent accounts see that a
        /// child is running dry.
        ancestors: Vec<TenantId>,
    },
    InsufficientFunds {
        tenant_id: TenantId,
        requested: Decimal,
        available: Decimal,
        ancestors: Vec<TenantId>,
    },
}
