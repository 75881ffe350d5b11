use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use serde_json::json;
use shared::protocol::{parse_timestamp, MemoryRecord, OutboundEvent};
use tokio::net::TcpListener;

use crate::{error::TransportError, transport::EventSink};

/// Sink double that records every emitted event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<OutboundEvent>>,
    closed: AtomicBool,
}

impl RecordingSink {
    pub fn closed() -> Self {
        let sink = Self::default();
        sink.closed.store(true, Ordering::SeqCst);
        sink
    }

    pub fn events(&self) -> Vec<OutboundEvent> {
        self.events.lock().expect("lock").clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: OutboundEvent) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.events.lock().expect("lock").push(event);
        Ok(())
    }
}

pub fn record(id: &str, timestamp: &str, user_state: &str, entities: &[&str]) -> MemoryRecord {
    MemoryRecord {
        id: Some(id.into()),
        timestamp: timestamp.to_string(),
        scene: format!("scene {id}"),
        statement: format!("statement {id}"),
        entities: entities.iter().map(|entity| entity.to_string()).collect(),
        user_state: user_state.to_string(),
        outcome: "Neutral".to_string(),
        remarks: None,
    }
}

/// In-process stand-in for the backend's `/memories` routes.
#[derive(Clone, Default)]
pub struct MockBackend {
    pub records: Arc<Mutex<Vec<MemoryRecord>>>,
    /// Ids whose delete answers 500 without removing anything.
    pub failing: Arc<Mutex<HashSet<String>>>,
    pub range_calls: Arc<Mutex<Vec<(String, String)>>>,
    pub list_calls: Arc<Mutex<usize>>,
    pub graph_envelope: bool,
}

impl MockBackend {
    pub fn with_records(records: Vec<MemoryRecord>) -> Self {
        Self {
            records: Arc::new(Mutex::new(records)),
            ..Self::default()
        }
    }

    pub fn fail_on(&self, id: &str) {
        self.failing.lock().expect("lock").insert(id.to_string());
    }

    pub fn ids(&self) -> Vec<String> {
        self.records
            .lock()
            .expect("lock")
            .iter()
            .map(|record| record.node_id().0)
            .collect()
    }

    pub async fn spawn(self) -> String {
        std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = Router::new()
            .route("/memories", get(list_memories))
            .route("/memories/all", delete(delete_all))
            .route("/memories/range", delete(delete_range))
            .route("/memories/:id", delete(delete_one))
            .with_state(self);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }
}

async fn list_memories(State(backend): State<MockBackend>) -> impl IntoResponse {
    *backend.list_calls.lock().expect("lock") += 1;
    let records = backend.records.lock().expect("lock").clone();
    if backend.graph_envelope {
        let nodes: Vec<_> = records
            .iter()
            .map(|record| json!({ "id": record.timestamp, "label": record.statement, "details": record }))
            .collect();
        Json(json!({ "nodes": nodes, "links": [] }))
    } else {
        Json(json!(records))
    }
}

async fn delete_one(
    State(backend): State<MockBackend>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if backend.failing.lock().expect("lock").contains(&id) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": "storage unavailable" })),
        );
    }
    let mut records = backend.records.lock().expect("lock");
    let before = records.len();
    records.retain(|record| record.node_id().0 != id);
    if records.len() == before {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "Memory not found" })),
        );
    }
    (StatusCode::OK, Json(json!({ "status": "deleted", "id": id })))
}

async fn delete_all(State(backend): State<MockBackend>) -> impl IntoResponse {
    backend.records.lock().expect("lock").clear();
    Json(json!({ "status": "cleared" }))
}

async fn delete_range(
    State(backend): State<MockBackend>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let (Some(start), Some(end)) = (params.get("start"), params.get("end")) else {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "detail": "start and end are required" })),
        );
    };
    backend
        .range_calls
        .lock()
        .expect("lock")
        .push((start.clone(), end.clone()));
    let (Some(start), Some(end)) = (parse_timestamp(start), parse_timestamp(end)) else {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "detail": "invalid timestamp" })),
        );
    };
    let mut records = backend.records.lock().expect("lock");
    let before = records.len();
    records.retain(|record| {
        record
            .parsed_timestamp()
            .map_or(true, |at| at < start || at > end)
    });
    (
        StatusCode::OK,
        Json(json!({ "deleted": before - records.len() })),
    )
}
