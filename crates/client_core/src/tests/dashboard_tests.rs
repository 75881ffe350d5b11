use super::*;

use std::time::Duration;

use serde_json::json;
use shared::domain::{Agent, ChatRole, MemoryId};
use tokio::sync::mpsc;

use crate::test_support::{record, MockBackend, RecordingSink};

async fn dashboard_with(backend: MockBackend) -> (Dashboard, Arc<RecordingSink>) {
    let url = backend.spawn().await;
    let sink = Arc::new(RecordingSink::default());
    let api = Arc::new(HttpMemoryApi::new(&url).expect("api"));
    (Dashboard::new(&Settings::default(), sink.clone(), api), sink)
}

fn event(name: &str, payload: serde_json::Value) -> InboundEvent {
    InboundEvent::decode(name, payload).expect("decode")
}

fn drain(updates: &mut broadcast::Receiver<ViewUpdate>) -> Vec<ViewUpdate> {
    let mut seen = Vec::new();
    while let Ok(update) = updates.try_recv() {
        seen.push(update);
    }
    seen
}

#[tokio::test]
async fn high_risk_analysis_updates_every_store() {
    let backend = MockBackend::with_records(vec![
        record("m1", "2024-05-01T09:00:00", "Flow", &["desk"]),
        record("m2", "2024-05-01T10:00:00", "Calm", &["desk"]),
    ]);
    let (mut dashboard, _sink) = dashboard_with(backend).await;
    dashboard.mount().await;
    let mut updates = dashboard.subscribe_updates();

    dashboard.dispatch(&event(
        "analysis_result",
        json!({
            "summary": "Three hours without a break",
            "risk_level": "HIGH",
            "risk_type": "sedentary",
            "actions": ["Stand up", "Walk for 5 minutes"],
            "graph_highlights": ["m2"]
        }),
    ));

    assert_eq!(dashboard.risk.level(), RiskLevel::High);
    let alert = dashboard.chat.messages().pop().expect("alert");
    assert_eq!(alert.role, ChatRole::System);
    assert!(alert.content.starts_with("⚠️ **HIGH RISK DETECTED**"));
    assert_eq!(
        dashboard.council.lines()[0].message,
        "Risk: HIGH. Actions: 2 recommended."
    );
    assert!(
        dashboard
            .graph
            .snapshot()
            .node(&MemoryId::from("m2"))
            .expect("node")
            .highlighted
    );
    assert!(!dashboard.intervention.is_open());

    dashboard.dispatch(&event(
        "intervention",
        json!({ "summary": "Stand up now", "actions": ["Stretch"], "risk_level": "HIGH" }),
    ));
    assert!(dashboard.intervention.is_open());
    let chat_len = dashboard.chat.messages().len();
    dashboard.intervention.dismiss();
    assert!(!dashboard.intervention.is_open());
    assert_eq!(dashboard.chat.messages().len(), chat_len);

    assert_eq!(
        drain(&mut updates),
        vec![
            ViewUpdate::Risk(RiskLevel::High),
            ViewUpdate::Council,
            ViewUpdate::Chat,
            ViewUpdate::GraphHighlights,
            ViewUpdate::InterventionOpened,
            ViewUpdate::Council,
        ]
    );
}

#[tokio::test]
async fn low_risk_analysis_does_not_alert_chat() {
    let (mut dashboard, _sink) = dashboard_with(MockBackend::default()).await;
    dashboard.dispatch(&event("analysis_result", json!({ "risk_level": "LOW" })));

    assert_eq!(dashboard.risk.level(), RiskLevel::Low);
    assert_eq!(dashboard.chat.messages().len(), 1);
}

#[tokio::test]
async fn run_processes_events_in_arrival_order() {
    let (mut dashboard, sink) = dashboard_with(MockBackend::default()).await;
    let (tx, rx) = mpsc::unbounded_channel();

    tx.send(InboundEvent::Connect).expect("send");
    tx.send(event(
        "sensor_data",
        json!({ "text": "Screen Analysis: Writing. Risk: True", "type": "screen_observer", "image_base64": "aGVsbG8=" }),
    ))
    .expect("send");
    for level in ["HIGH", "MEDIUM", "LOW"] {
        tx.send(event("analysis_result", json!({ "risk_level": level })))
            .expect("send");
    }
    tx.send(event("chat_reply", json!({ "message": "Noted." })))
        .expect("send");
    tx.send(event("environment_update", json!({ "hex_color": "#ef4444", "turbulence": 0.8, "speed": 0.5 })))
        .expect("send");
    tx.send(event("heartbeat", json!({}))).expect("send");
    drop(tx);

    tokio::time::timeout(Duration::from_secs(5), dashboard.run(rx))
        .await
        .expect("run finishes");

    assert_eq!(dashboard.risk.level(), RiskLevel::Low);
    let timeline = dashboard.timeline.entries();
    assert_eq!(timeline.len(), 1);
    assert!(timeline[0].risk);
    assert_eq!(timeline[0].description, "Writing");

    let lines = dashboard.council.lines();
    assert_eq!(lines.len(), 6);
    assert_eq!(lines[0].message, "Environment shifted to #ef4444");
    assert_eq!(lines.last().expect("first").agent, Agent::System);
    assert!(dashboard.council.active_agents().is_empty());

    let chat = dashboard.chat.messages();
    assert_eq!(chat.last().expect("reply").content, "Noted.");
    assert_eq!(chat.len(), 4);

    assert_eq!(dashboard.environment.snapshot().target.turbulence, 0.8);
    assert!(sink.events().is_empty());
}

#[tokio::test]
async fn chat_and_tolerance_go_through_the_injected_sink() {
    let (dashboard, sink) = dashboard_with(MockBackend::default()).await;

    dashboard.chat.send("I feel stiff").expect("send");
    dashboard
        .chat
        .adjust_tolerance("sedentary", 0.1)
        .expect("tolerance");

    assert_eq!(
        sink.events(),
        vec![
            shared::protocol::OutboundEvent::ChatMessage {
                message: "I feel stiff".to_string()
            },
            shared::protocol::OutboundEvent::AdjustTolerance {
                risk_type: "sedentary".to_string(),
                amount: 0.1
            },
        ]
    );
}

#[tokio::test]
async fn extra_router_handlers_run_after_built_in_ones() {
    let (mut dashboard, _sink) = dashboard_with(MockBackend::default()).await;
    let risk = dashboard.risk.clone();
    let observed = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    dashboard
        .router_mut()
        .subscribe(EventName::AnalysisResult, move |_| {
            sink.lock().expect("lock").push(risk.level());
        });

    dashboard.dispatch(&event("analysis_result", json!({ "risk_level": "MEDIUM" })));
    assert_eq!(*observed.lock().expect("lock"), vec![RiskLevel::Medium]);
}

#[tokio::test]
async fn mount_fills_memories_and_graph() {
    let backend = MockBackend::with_records(vec![
        record("a", "2024-05-01T09:00:00", "Flow", &["desk"]),
        record("b", "2024-05-02T09:00:00", "Anxious", &["desk"]),
    ]);
    let (dashboard, _sink) = dashboard_with(backend).await;
    dashboard.mount().await;

    assert_eq!(dashboard.memories.records().len(), 2);
    let graph = dashboard.graph.snapshot();
    assert!(graph.is_linked(&MemoryId::from("a"), &MemoryId::from("b")));
    assert_eq!(dashboard.memories.graph().snapshot(), graph);
}
