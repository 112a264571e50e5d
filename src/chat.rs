use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

/// A single chat line. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub text: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: message_id(None),
            text: text.into(),
            sender: Sender::User,
            timestamp: Utc::now(),
        }
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self {
            id: message_id(Some("bot")),
            text: text.into(),
            sender: Sender::Bot,
            timestamp: Utc::now(),
        }
    }

    /// A bot-authored message reporting a failed exchange.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            id: message_id(Some("error")),
            text: text.into(),
            sender: Sender::Bot,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: session_id(now),
            name: name.into(),
            messages: Vec::new(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Bumps `last_activity` without ever moving it backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn first_user_message(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.sender == Sender::User)
    }
}

// Creation time in millis plus a 9 character random suffix.
fn session_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.timestamp_millis(), &suffix[..9])
}

fn message_id(tag: Option<&str>) -> String {
    let base = format!(
        "{}{}",
        Utc::now().timestamp_millis(),
        &Uuid::new_v4().simple().to_string()[..6]
    );
    match tag {
        Some(tag) => format!("{}-{}", base, tag),
        None => base,
    }
}
