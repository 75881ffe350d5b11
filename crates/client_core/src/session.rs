//! Per-session histories fed by inbound events: the screen timeline, the
//! agent council log and the liaison chat.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use shared::{
    domain::{Agent, ChatRole},
    protocol::{
        AnalysisResult, ChatReply, EnvironmentUpdate, Intervention, OutboundEvent, RiskCard,
        SensorData, SCREEN_OBSERVER_KIND,
    },
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{error::TransportError, log::BoundedLog, transport::EventSink};

pub const GREETING: &str = "Hello! I'm your Liaison. I'm here to help you manage your health and productivity. How are you feeling right now?";

const SCREEN_ANALYSIS_MARKER: &str = "Screen Analysis: ";
const FALLBACK_DESCRIPTION: &str = "Activity Detected";
const RISK_MARKER: &str = "Risk: True";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    /// Decoded screenshot bytes (JPEG as sent by the screen observer).
    pub image: Vec<u8>,
    pub category: String,
    pub description: String,
    pub risk: bool,
    pub duration: Option<f64>,
}

#[derive(Debug)]
struct TimelineInner {
    entries: BoundedLog<TimelineEntry>,
    last_id: u64,
}

/// Rolling strip of recent screen observations.
#[derive(Debug, Clone)]
pub struct TimelineStore {
    inner: Arc<Mutex<TimelineInner>>,
}

impl TimelineStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TimelineInner {
                entries: BoundedLog::with_capacity(capacity),
                last_id: 0,
            })),
        }
    }

    /// Appends an entry for screen observations that carry a screenshot.
    /// Anything else, or an image that is not valid base64, is ignored.
    pub fn on_sensor_data(&self, data: &SensorData) -> Option<TimelineEntry> {
        if data.kind != SCREEN_OBSERVER_KIND {
            return None;
        }
        let encoded = data.image_base64.as_deref()?;
        let image = match decode_image(encoded) {
            Ok(image) => image,
            Err(err) => {
                warn!(error = %err, "dropping timeline entry with undecodable image");
                return None;
            }
        };

        let now = Utc::now();
        let mut inner = lock(&self.inner);
        let millis = u64::try_from(now.timestamp_millis()).unwrap_or_default();
        let id = millis.max(inner.last_id + 1);
        inner.last_id = id;

        let entry = TimelineEntry {
            id,
            timestamp: now,
            image,
            category: data.raw_category.clone(),
            description: describe_screen(&data.text),
            risk: data
                .health_risk
                .unwrap_or_else(|| data.text.contains(RISK_MARKER)),
            duration: data.duration,
        };
        inner.entries.push_back(entry.clone());
        debug!(id, risk = entry.risk, "timeline entry added");
        Some(entry)
    }

    pub fn entries(&self) -> Vec<TimelineEntry> {
        lock(&self.inner).entries.to_vec()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn decode_image(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let body = match encoded.split_once(";base64,") {
        Some((prefix, body)) if prefix.starts_with("data:") => body,
        _ => encoded,
    };
    STANDARD.decode(body.trim())
}

/// First sentence following `Screen Analysis: `, or a generic label.
pub fn describe_screen(text: &str) -> String {
    text.split_once(SCREEN_ANALYSIS_MARKER)
        .map(|(_, rest)| rest.split(SCREEN_ANALYSIS_MARKER).next().unwrap_or_default())
        .map(|segment| segment.split('.').next().unwrap_or_default())
        .filter(|sentence| !sentence.is_empty())
        .unwrap_or(FALLBACK_DESCRIPTION)
        .to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub id: Uuid,
    pub agent: Agent,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct CouncilInner {
    lines: BoundedLog<LogLine>,
    active: Vec<Agent>,
}

/// Newest-first narration of what the backend agents are doing.
#[derive(Debug, Clone)]
pub struct CouncilLog {
    inner: Arc<Mutex<CouncilInner>>,
}

const DELIBERATING: [Agent; 3] = [Agent::Triage, Agent::DrNexus, Agent::Guardian];

impl CouncilLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CouncilInner {
                lines: BoundedLog::with_capacity(capacity),
                active: Vec::new(),
            })),
        }
    }

    pub fn on_connect(&self) {
        self.push(Agent::System, "Connected to VitalKernel.".to_string());
    }

    pub fn on_sensor_data(&self, data: &SensorData) {
        let mut inner = lock(&self.inner);
        inner.active = DELIBERATING.to_vec();
        inner
            .lines
            .push_front(line(Agent::System, format!("New Signal: {}", data.text)));
    }

    pub fn on_analysis_result(&self, result: &AnalysisResult) {
        let mut inner = lock(&self.inner);
        inner.active.clear();
        inner.lines.push_front(line(
            Agent::Chair,
            format!(
                "Risk: {}. Actions: {} recommended.",
                result.risk_level,
                result.actions.len()
            ),
        ));
    }

    pub fn on_intervention(&self, intervention: &Intervention) {
        self.push(
            Agent::Guardian,
            format!("Intervention issued: {}", intervention.summary),
        );
    }

    pub fn on_risk_card(&self, card: &RiskCard) {
        self.push(
            Agent::DrNexus,
            format!(
                "{}: {} risk ({})",
                card.title, card.risk_level, card.risk_type
            ),
        );
    }

    pub fn on_environment_update(&self, update: &EnvironmentUpdate) {
        if let Some(hex) = update.hex_color.as_deref() {
            self.push(Agent::System, format!("Environment shifted to {hex}"));
        }
    }

    pub fn lines(&self) -> Vec<LogLine> {
        lock(&self.inner).lines.to_vec()
    }

    pub fn active_agents(&self) -> Vec<Agent> {
        lock(&self.inner).active.clone()
    }

    fn push(&self, agent: Agent, message: String) {
        lock(&self.inner).lines.push_front(line(agent, message));
    }
}

fn line(agent: Agent, message: String) -> LogLine {
    LogLine {
        id: Uuid::new_v4(),
        agent,
        message,
        timestamp: Utc::now(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: u64,
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub alert: Option<RiskCard>,
}

#[derive(Debug)]
struct ChatInner {
    messages: BoundedLog<ChatMessage>,
    typing: bool,
    next_id: u64,
}

impl ChatInner {
    fn append(&mut self, role: ChatRole, content: String, alert: Option<RiskCard>) {
        self.next_id += 1;
        self.messages.push_back(ChatMessage {
            id: self.next_id,
            role,
            content,
            timestamp: Utc::now(),
            alert,
        });
    }
}

/// Conversation with the liaison agent. Outbound messages go through the
/// injected sink; replies arrive as `chat_reply` events.
#[derive(Clone)]
pub struct ChatPanel {
    inner: Arc<Mutex<ChatInner>>,
    sink: Arc<dyn EventSink>,
}

impl ChatPanel {
    pub fn new(capacity: usize, sink: Arc<dyn EventSink>) -> Self {
        let mut inner = ChatInner {
            messages: BoundedLog::with_capacity(capacity),
            typing: false,
            next_id: 0,
        };
        inner.append(ChatRole::Assistant, GREETING.to_string(), None);
        Self {
            inner: Arc::new(Mutex::new(inner)),
            sink,
        }
    }

    /// Returns `Ok(false)` when the trimmed input is empty and nothing was
    /// sent.
    pub fn send(&self, text: &str) -> Result<bool, TransportError> {
        let message = text.trim();
        if message.is_empty() {
            return Ok(false);
        }
        {
            let mut inner = lock(&self.inner);
            inner.append(ChatRole::User, message.to_string(), None);
            inner.typing = true;
        }
        let sent = self.sink.emit(OutboundEvent::ChatMessage {
            message: message.to_string(),
        });
        if let Err(err) = sent {
            lock(&self.inner).typing = false;
            return Err(err);
        }
        Ok(true)
    }

    pub fn adjust_tolerance(
        &self,
        risk_type: impl Into<String>,
        amount: f64,
    ) -> Result<(), TransportError> {
        self.sink.emit(OutboundEvent::AdjustTolerance {
            risk_type: risk_type.into(),
            amount,
        })
    }

    pub fn on_chat_reply(&self, reply: &ChatReply) {
        let mut inner = lock(&self.inner);
        inner.typing = false;
        inner.append(ChatRole::Assistant, reply.message.clone(), None);
    }

    /// MEDIUM and HIGH results are echoed into the chat as a system alert.
    pub fn on_analysis_result(&self, result: &AnalysisResult) -> bool {
        if !result.risk_level.is_alerting() {
            return false;
        }
        lock(&self.inner).append(ChatRole::System, alert_text(result), None);
        true
    }

    pub fn on_risk_card(&self, card: &RiskCard) {
        let content = format!("**{}**\n\n{}", card.title, card.summary);
        lock(&self.inner).append(ChatRole::System, content, Some(card.clone()));
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        lock(&self.inner).messages.to_vec()
    }

    pub fn is_typing(&self) -> bool {
        lock(&self.inner).typing
    }
}

pub fn alert_text(result: &AnalysisResult) -> String {
    let actions = result
        .actions
        .iter()
        .map(|action| format!("- {action}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "⚠️ **{} RISK DETECTED**\n\n{}\n\nSuggested Actions:\n{}",
        result.risk_level, result.summary, actions
    )
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
