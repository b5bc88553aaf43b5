//! Signal records.

use serde::{Deserialize, Serialize};

/// Who generated a signal. Every variant carries the owning account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalSource {
    System {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    Agent {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    Webhook {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    Process {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
}

impl SignalSource {
    pub fn system() -> Self {
        SignalSource::System { user_id: None }
    }

    pub fn agent(id: &str, user_id: Option<&str>) -> Self {
        SignalSource::Agent {
            id: id.to_string(),
            user_id: user_id.map(str::to_string),
        }
    }

    /// Agent id when the source is an agent.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            SignalSource::Agent { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            SignalSource::System { user_id }
            | SignalSource::Agent { user_id, .. }
            | SignalSource::Webhook { user_id, .. }
            | SignalSource::Process { user_id, .. } => user_id.as_deref(),
        }
    }

    /// Drop blank ids so equivalent sources compare equal.
    pub fn normalized(self) -> Self {
        fn clean(value: Option<String>) -> Option<String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }
        match self {
            SignalSource::System { user_id } => SignalSource::System {
                user_id: clean(user_id),
            },
            SignalSource::Agent { id, user_id } => SignalSource::Agent {
                id: id.trim().to_string(),
                user_id: clean(user_id),
            },
            SignalSource::Webhook { id, user_id } => SignalSource::Webhook {
                id: clean(id),
                user_id: clean(user_id),
            },
            SignalSource::Process { id, user_id } => SignalSource::Process {
                id: clean(id),
                user_id: clean(user_id),
            },
        }
    }

    /// Short description used in signal text.
    pub fn describe(&self) -> String {
        match self {
            SignalSource::System { .. } => "system".to_string(),
            SignalSource::Agent { id, .. } => format!("agent:{}", id),
            SignalSource::Webhook { id, .. } => match id {
                Some(id) => format!("webhook:{}", id),
                None => "webhook".to_string(),
            },
            SignalSource::Process { id, .. } => match id {
                Some(id) => format!("process:{}", id),
                None => "process".to_string(),
            },
        }
    }
}

/// An immutable generated signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub id: String,
    #[serde(rename = "type")]
    pub signal_type: String,
    pub source: SignalSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub created_at: i64,
}

/// Input for [`crate::signals::Signals::generate`].
#[derive(Debug, Clone, PartialEq)]
pub struct SignalGenerateInput {
    pub signal_type: String,
    pub source: SignalSource,
    pub data: Option<serde_json::Value>,
}

impl SignalGenerateInput {
    pub fn new(signal_type: &str, source: SignalSource) -> Self {
        Self {
            signal_type: signal_type.to_string(),
            source,
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Registration of an agent for signals matching `pattern`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalSubscription {
    pub agent_id: String,
    pub pattern: String,
    /// Silent deliveries are appended to context without running inference
    pub silent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for [`crate::signals::Signals::subscribe`].
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSubscribeInput {
    pub agent_id: String,
    pub pattern: String,
    /// Defaults to `true`
    pub silent: Option<bool>,
    pub user_id: Option<String>,
}

impl SignalSubscribeInput {
    pub fn new(agent_id: &str, pattern: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            pattern: pattern.to_string(),
            silent: None,
            user_id: None,
        }
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = Some(silent);
        self
    }
}

/// A persisted future delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelayedSignal {
    pub id: String,
    #[serde(rename = "type")]
    pub signal_type: String,
    pub deliver_at: i64,
    pub source: SignalSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// At most one entry exists per `(type, repeat_key)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_key: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for [`crate::signals::DelayedSignals::schedule`].
#[derive(Debug, Clone, PartialEq)]
pub struct DelayedSignalInput {
    pub signal_type: String,
    pub deliver_at: i64,
    pub source: SignalSource,
    pub data: Option<serde_json::Value>,
    pub repeat_key: Option<String>,
}

impl DelayedSignalInput {
    pub fn new(signal_type: &str, deliver_at: i64, source: SignalSource) -> Self {
        Self {
            signal_type: signal_type.to_string(),
            deliver_at,
            source,
            data: None,
            repeat_key: None,
        }
    }

    pub fn with_repeat_key(mut self, repeat_key: &str) -> Self {
        self.repeat_key = Some(repeat_key.to_string());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_json_shape() {
        let json = serde_json::to_value(SignalSource::agent("a1", Some("u1"))).unwrap();
        assert_eq!(json["type"], "agent");
        assert_eq!(json["id"], "a1");
        assert_eq!(json["user_id"], "u1");

        let system: SignalSource = serde_json::from_str(r#"{"type":"system"}"#).unwrap();
        assert_eq!(system, SignalSource::system());
    }

    #[test]
    fn test_normalized_drops_blank_ids() {
        let source = SignalSource::Webhook {
            id: Some("  ".into()),
            user_id: Some(" u2 ".into()),
        }
        .normalized();
        assert_eq!(
            source,
            SignalSource::Webhook {
                id: None,
                user_id: Some("u2".into())
            }
        );
        assert_eq!(source.describe(), "webhook");
        assert_eq!(source.user_id(), Some("u2"));
    }

    #[test]
    fn test_signal_type_field_name() {
        let signal = Signal {
            id: "s1".into(),
            signal_type: "build:done".into(),
            source: SignalSource::system(),
            data: None,
            created_at: 1,
        };
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["type"], "build:done");
    }
}
