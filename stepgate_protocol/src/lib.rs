use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Messages sent by the sequencer to the actuator service.
///
/// On the wire every message is an envelope `{"type": ..., "data": {...}}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type", content = "data")]
pub enum ClientMessage {
    /// Scheduled trigger for every active channel of one step.
    GpioTrigger { channels: Vec<u8>, duration: u32 },
    /// Direct trigger from user interaction.
    ImmediateTrigger { channel: u8, duration: u32 },
    /// Explicit release; an empty list releases every channel.
    StopChannels { channels: Vec<u8> },
    Ping {},
}

/// Messages sent by the actuator service back to the sequencer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type", content = "data")]
pub enum ActuatorMessage {
    ConnectionStatus {
        connected: bool,
        gpio_available: bool,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        channel_mapping: BTreeMap<u8, u8>,
    },
    Error {
        error: String,
        #[serde(default)]
        channel: Option<i64>,
    },
    GpioTriggerResponse {
        channels: Vec<u8>,
        duration: u32,
        #[serde(default)]
        results: BTreeMap<u8, bool>,
        success: bool,
    },
    ImmediateTriggerResponse {
        channel: u8,
        duration: u32,
        success: bool,
    },
    StopChannelsResponse {
        channels: ReleasedChannels,
        success: bool,
    },
    Pong {
        #[serde(default)]
        timestamp: f64,
    },
}

/// `stop_channels_response` echoes either the released list or the literal `"all"`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ReleasedChannels {
    Listed(Vec<u8>),
    Keyword(String),
}

impl ReleasedChannels {
    pub fn all() -> Self {
        ReleasedChannels::Keyword("all".to_string())
    }
}

/// Closed set of `type` tags a message enum understands.
pub trait MessageKind {
    const KINDS: &'static [&'static str];

    fn kind(&self) -> &'static str;
}

impl MessageKind for ClientMessage {
    const KINDS: &'static [&'static str] =
        &["gpio_trigger", "immediate_trigger", "stop_channels", "ping"];

    fn kind(&self) -> &'static str {
        match self {
            ClientMessage::GpioTrigger { .. } => "gpio_trigger",
            ClientMessage::ImmediateTrigger { .. } => "immediate_trigger",
            ClientMessage::StopChannels { .. } => "stop_channels",
            ClientMessage::Ping {} => "ping",
        }
    }
}

impl MessageKind for ActuatorMessage {
    const KINDS: &'static [&'static str] = &[
        "connection_status",
        "error",
        "gpio_trigger_response",
        "immediate_trigger_response",
        "stop_channels_response",
        "pong",
    ];

    fn kind(&self) -> &'static str {
        match self {
            ActuatorMessage::ConnectionStatus { .. } => "connection_status",
            ActuatorMessage::Error { .. } => "error",
            ActuatorMessage::GpioTriggerResponse { .. } => "gpio_trigger_response",
            ActuatorMessage::ImmediateTriggerResponse { .. } => "immediate_trigger_response",
            ActuatorMessage::StopChannelsResponse { .. } => "stop_channels_response",
            ActuatorMessage::Pong { .. } => "pong",
        }
    }
}

/// A decoded envelope: either one of the known variants or a tag this side
/// does not understand yet.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound<T> {
    Known(T),
    Unknown { kind: String },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed `{kind}` message: {source}")]
    Malformed {
        kind: String,
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

pub fn decode<T>(text: &str) -> Result<Inbound<T>, ProtocolError>
where
    T: DeserializeOwned + MessageKind,
{
    let envelope: Envelope = serde_json::from_str(text)?;
    if !T::KINDS.contains(&envelope.kind.as_str()) {
        return Ok(Inbound::Unknown {
            kind: envelope.kind,
        });
    }
    serde_json::from_str(text)
        .map(Inbound::Known)
        .map_err(|source| ProtocolError::Malformed {
            kind: envelope.kind,
            source,
        })
}

pub fn encode<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batch_trigger_uses_type_data_envelope() {
        let msg = ClientMessage::GpioTrigger {
            channels: vec![0, 2, 5],
            duration: 50,
        };
        let value: serde_json::Value = serde_json::from_str(&encode(&msg).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "gpio_trigger", "data": {"channels": [0, 2, 5], "duration": 50}})
        );
    }

    #[test]
    fn ping_carries_empty_object() {
        let value: serde_json::Value =
            serde_json::from_str(&encode(&ClientMessage::Ping {}).unwrap()).unwrap();
        assert_eq!(value, json!({"type": "ping", "data": {}}));
    }

    #[test]
    fn decodes_error_with_null_channel() {
        let text = r#"{"type":"error","data":{"error":"boom","channel":null}}"#;
        let msg = decode::<ActuatorMessage>(text).unwrap();
        assert_eq!(
            msg,
            Inbound::Known(ActuatorMessage::Error {
                error: "boom".to_string(),
                channel: None,
            })
        );
    }

    #[test]
    fn decodes_status_with_string_keyed_mapping() {
        let text = r#"{"type":"connection_status","data":{"connected":true,"gpio_available":false,"channel_mapping":{"0":2,"7":9}}}"#;
        let Inbound::Known(ActuatorMessage::ConnectionStatus {
            connected,
            gpio_available,
            channel_mapping,
        }) = decode::<ActuatorMessage>(text).unwrap()
        else {
            panic!("expected connection status");
        };
        assert!(connected);
        assert!(!gpio_available);
        assert_eq!(channel_mapping.get(&7), Some(&9));
    }

    #[test]
    fn stop_response_accepts_all_keyword() {
        let text = r#"{"type":"stop_channels_response","data":{"channels":"all","success":true}}"#;
        let msg = decode::<ActuatorMessage>(text).unwrap();
        assert_eq!(
            msg,
            Inbound::Known(ActuatorMessage::StopChannelsResponse {
                channels: ReleasedChannels::all(),
                success: true,
            })
        );
    }

    #[test]
    fn unknown_type_falls_back() {
        let text = r#"{"type":"firmware_update","data":{"version":3}}"#;
        let msg = decode::<ActuatorMessage>(text).unwrap();
        assert_eq!(
            msg,
            Inbound::Unknown {
                kind: "firmware_update".to_string()
            }
        );
    }

    #[test]
    fn known_type_with_bad_payload_is_malformed() {
        let text = r#"{"type":"immediate_trigger","data":{"channel":"three"}}"#;
        let err = decode::<ClientMessage>(text).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { ref kind, .. } if kind == "immediate_trigger"));
    }

    #[test]
    fn garbage_is_invalid_json() {
        assert!(matches!(
            decode::<ClientMessage>("not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn kind_matches_serialized_tag() {
        let msg = ClientMessage::StopChannels { channels: vec![] };
        let value: serde_json::Value = serde_json::from_str(&encode(&msg).unwrap()).unwrap();
        assert_eq!(value["type"], msg.kind());
    }
}
