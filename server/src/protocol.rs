use serde::{Deserialize, Serialize};

/// Commands a foreground controller sends to the scheduler.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    SetAlarm {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    ClearAlarm,
}

/// Messages the scheduler broadcasts to live foreground contexts.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    AlarmTriggered {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mailbox {
    pub messages: Vec<ServerMessage>,
}
