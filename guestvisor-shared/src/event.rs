use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle event published after a guest operation succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    pub time: DateTime<Utc>,
}

impl Event {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            action: action.into(),
            time: Utc::now(),
        }
    }
}
