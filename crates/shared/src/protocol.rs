use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{MemoryId, RiskLevel};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventName {
    Connect,
    SensorData,
    AnalysisResult,
    Intervention,
    ChatReply,
    RiskCard,
    EnvironmentUpdate,
    Other(String),
}

impl EventName {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "connect" => EventName::Connect,
            "sensor_data" => EventName::SensorData,
            "analysis_result" => EventName::AnalysisResult,
            "intervention" => EventName::Intervention,
            "chat_reply" => EventName::ChatReply,
            "risk_card" => EventName::RiskCard,
            "environment_update" => EventName::EnvironmentUpdate,
            other => EventName::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventName::Connect => "connect",
            EventName::SensorData => "sensor_data",
            EventName::AnalysisResult => "analysis_result",
            EventName::Intervention => "intervention",
            EventName::ChatReply => "chat_reply",
            EventName::RiskCard => "risk_card",
            EventName::EnvironmentUpdate => "environment_update",
            EventName::Other(raw) => raw,
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Screen/activity observation pushed by the sensing pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorData {
    pub text: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub raw_category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Structured risk flag; older backends only encode it in `text`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_risk: Option<bool>,
}

pub const SCREEN_OBSERVER_KIND: &str = "screen_observer";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisResult {
    pub summary: String,
    pub risk_level: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_type: Option<String>,
    pub actions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_highlights: Option<Vec<MemoryId>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Intervention {
    pub summary: String,
    pub actions: Vec<String>,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatReply {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskCard {
    pub title: String,
    pub summary: String,
    pub risk_level: RiskLevel,
    pub actions: Vec<String>,
    pub risk_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hex_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turbulence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f32>,
}

#[derive(Debug, Clone)]
pub enum InboundEvent {
    Connect,
    SensorData(SensorData),
    AnalysisResult(AnalysisResult),
    Intervention(Intervention),
    ChatReply(ChatReply),
    RiskCard(RiskCard),
    EnvironmentUpdate(EnvironmentUpdate),
    Other { name: String, payload: Value },
}

impl InboundEvent {
    /// Decodes a named event. Missing fields fall back to their defaults;
    /// only payloads of the wrong shape are rejected.
    pub fn decode(name: &str, payload: Value) -> Result<Self, serde_json::Error> {
        Ok(match EventName::parse(name) {
            EventName::Connect => InboundEvent::Connect,
            EventName::SensorData => InboundEvent::SensorData(lenient(payload)?),
            EventName::AnalysisResult => InboundEvent::AnalysisResult(lenient(payload)?),
            EventName::Intervention => InboundEvent::Intervention(lenient(payload)?),
            EventName::ChatReply => InboundEvent::ChatReply(lenient(payload)?),
            EventName::RiskCard => InboundEvent::RiskCard(lenient(payload)?),
            EventName::EnvironmentUpdate => InboundEvent::EnvironmentUpdate(lenient(payload)?),
            EventName::Other(name) => InboundEvent::Other { name, payload },
        })
    }

    pub fn name(&self) -> EventName {
        match self {
            InboundEvent::Connect => EventName::Connect,
            InboundEvent::SensorData(_) => EventName::SensorData,
            InboundEvent::AnalysisResult(_) => EventName::AnalysisResult,
            InboundEvent::Intervention(_) => EventName::Intervention,
            InboundEvent::ChatReply(_) => EventName::ChatReply,
            InboundEvent::RiskCard(_) => EventName::RiskCard,
            InboundEvent::EnvironmentUpdate(_) => EventName::EnvironmentUpdate,
            InboundEvent::Other { name, .. } => EventName::Other(name.clone()),
        }
    }
}

fn lenient<T: DeserializeOwned + Default>(payload: Value) -> Result<T, serde_json::Error> {
    if payload.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(payload)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum OutboundEvent {
    ChatMessage { message: String },
    AdjustTolerance { risk_type: String, amount: f64 },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::ChatMessage { .. } => "chat_message",
            OutboundEvent::AdjustTolerance { .. } => "adjust_tolerance",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            OutboundEvent::ChatMessage { message } => serde_json::json!({ "message": message }),
            OutboundEvent::AdjustTolerance { risk_type, amount } => {
                serde_json::json!({ "risk_type": risk_type, "amount": amount })
            }
        }
    }
}

/// Backend-owned long-term memory record, as returned by `GET /memories`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<MemoryId>,
    pub timestamp: String,
    pub scene: String,
    pub statement: String,
    pub entities: Vec<String>,
    pub user_state: String,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
}

impl MemoryRecord {
    /// Records stored before ids existed are addressed by their timestamp.
    pub fn node_id(&self) -> MemoryId {
        self.id
            .clone()
            .unwrap_or_else(|| MemoryId::new(self.timestamp.clone()))
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }

    pub fn shares_entity_with(&self, other: &MemoryRecord) -> usize {
        self.entities
            .iter()
            .filter(|entity| other.entities.contains(entity))
            .count()
    }
}

/// Accepts RFC 3339 and the naive ISO form the backend writes with
/// `datetime.isoformat()`; naive values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
