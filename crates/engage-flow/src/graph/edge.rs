use serde::{Deserialize, Serialize};

pub const YES: &str = "yes";
pub const NO: &str = "no";

/// An edge connecting two nodes of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Branch label; `yes` or `no` on decision edges, absent elsewhere.
    #[serde(default)]
    pub label: Option<String>,
}

impl Edge {
    /// Create an unlabeled edge.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            label: None,
        }
    }

    pub fn yes(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            label: Some(YES.into()),
            ..Self::new(from, to)
        }
    }

    pub fn no(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            label: Some(NO.into()),
            ..Self::new(from, to)
        }
    }
}
