//! Wire frame types
//!
//! Defines the JSON frames exchanged with the upstream over the
//! websocket: the auth handshake, the id-carrying command envelope and
//! the server-pushed result/event frames.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use haven_core::{Context, StateChangedData};

// =============================================================================
// Outgoing frames (client -> upstream)
// =============================================================================

#[derive(Debug, Serialize)]
pub struct AuthFrame<'a> {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub access_token: &'a str,
}

impl<'a> AuthFrame<'a> {
    pub fn new(access_token: &'a str) -> Self {
        Self {
            msg_type: "auth",
            access_token,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubscribeEventsFrame<'a> {
    pub id: u64,
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub event_type: &'a str,
}

impl<'a> SubscribeEventsFrame<'a> {
    pub fn new(id: u64, event_type: &'a str) -> Self {
        Self {
            id,
            msg_type: "subscribe_events",
            event_type,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GetStatesFrame {
    pub id: u64,
    #[serde(rename = "type")]
    pub msg_type: &'static str,
}

impl GetStatesFrame {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            msg_type: "get_states",
        }
    }
}

/// A service call, before the id envelope is attached
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallServiceRequest {
    pub domain: String,
    pub service: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_data: Option<HashMap<String, serde_json::Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<HashMap<String, String>>,
}

impl CallServiceRequest {
    pub fn new(domain: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: HashMap<String, serde_json::Value>) -> Self {
        self.service_data = Some(data);
        self
    }
}

#[derive(Debug, Serialize)]
pub struct CallServiceFrame<'a> {
    pub id: u64,
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(flatten)]
    pub request: &'a CallServiceRequest,
}

impl<'a> CallServiceFrame<'a> {
    pub fn new(id: u64, request: &'a CallServiceRequest) -> Self {
        Self {
            id,
            msg_type: "call_service",
            request,
        }
    }
}

// =============================================================================
// Incoming frames (upstream -> client)
// =============================================================================

/// Any frame the upstream can push at us
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Sent by the upstream immediately after connect
    #[serde(alias = "auth_challenge")]
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result(ResultFrame),
    Event(EventFrame),
    Pong {
        id: u64,
    },
}

/// Reply to a command, correlated by id
#[derive(Debug, Clone, Deserialize)]
pub struct ResultFrame {
    pub id: u64,
    pub success: bool,

    #[serde(default)]
    pub result: Option<serde_json::Value>,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

impl ResultFrame {
    /// Human-readable failure reason, wherever the upstream put it
    pub fn failure_message(&self) -> String {
        if let Some(msg) = &self.message {
            return msg.clone();
        }
        if let Some(err) = &self.error {
            if let Some(msg) = &err.message {
                return msg.clone();
            }
        }
        "unknown error".to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// A server-pushed event, correlated to a subscription by id
#[derive(Debug, Clone, Deserialize)]
pub struct EventFrame {
    pub id: u64,
    pub event: EventMessage,
}

/// The event body delivered to subscription handlers
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventMessage {
    #[serde(default)]
    pub event_type: String,

    #[serde(default)]
    pub data: StateChangedData,

    #[serde(default)]
    pub context: Context,

    #[serde(default)]
    pub time_fired: Option<DateTime<Utc>>,

    #[serde(default)]
    pub origin: Option<String>,
}
