pub mod codec;
pub mod config;
pub mod environment;
pub mod error;
pub mod graph;
pub mod log;
pub mod memory_api;
pub mod memory_manager;
pub mod risk;
pub mod router;
pub mod session;
pub mod transport;

use std::sync::Arc;

use anyhow::{Context, Result};
use shared::{
    domain::RiskLevel,
    protocol::{EventName, InboundEvent},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{info, warn};

pub use config::{load_settings, load_settings_from, Settings};
pub use environment::EnvironmentField;
pub use error::{MemoryApiError, TransportError};
pub use graph::{GraphSnapshot, GraphState};
pub use memory_api::{HttpMemoryApi, MemoryApi};
pub use memory_manager::{BulkDeleteReport, MemoryManager};
pub use risk::{InterventionModal, RiskState};
pub use router::{EventRouter, SubscriptionId};
pub use session::{ChatPanel, CouncilLog, TimelineStore};
pub use transport::{EventSink, Inbound, LinkState, SocketTransport};

/// Coarse change notifications for whatever renders the stores. Surfaces
/// re-read the store named by the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewUpdate {
    Connected,
    Timeline,
    Council,
    Chat,
    Risk(RiskLevel),
    InterventionOpened,
    Environment,
    GraphHighlights,
}

/// Root view model. Owns the event router and every store; each store
/// registers its own handlers so they stay independent of one another.
pub struct Dashboard {
    router: EventRouter,
    updates: broadcast::Sender<ViewUpdate>,
    frame_interval: std::time::Duration,
    pub timeline: TimelineStore,
    pub council: CouncilLog,
    pub chat: ChatPanel,
    pub risk: RiskState,
    pub intervention: InterventionModal,
    pub environment: EnvironmentField,
    pub graph: GraphState,
    pub memories: MemoryManager,
}

impl Dashboard {
    pub fn new(settings: &Settings, sink: Arc<dyn EventSink>, api: Arc<dyn MemoryApi>) -> Self {
        let (updates, _) = broadcast::channel(256);
        let graph = GraphState::new();
        let mut dashboard = Self {
            router: EventRouter::new(),
            updates,
            frame_interval: settings.frame_interval(),
            timeline: TimelineStore::new(settings.timeline_capacity),
            council: CouncilLog::new(settings.council_capacity),
            chat: ChatPanel::new(settings.chat_capacity, sink),
            risk: RiskState::new(),
            intervention: InterventionModal::new(),
            environment: EnvironmentField::new(settings.smoothing_rate),
            memories: MemoryManager::new(api, graph.clone()),
            graph,
        };
        dashboard.register_handlers();
        dashboard
    }

    /// Dials the backend and wires a dashboard to it. The returned
    /// transport is the same sink the chat panel emits through.
    pub fn connect(settings: &Settings) -> Result<(Self, Arc<SocketTransport>, Inbound)> {
        let (transport, inbound) =
            SocketTransport::connect(settings).context("failed to start socket transport")?;
        let transport = Arc::new(transport);
        let api = HttpMemoryApi::new(settings.backend_url())
            .context("failed to build memory api client")?;
        let dashboard = Self::new(settings, transport.clone(), Arc::new(api));
        Ok((dashboard, transport, inbound))
    }

    fn register_handlers(&mut self) {
        let updates = self.updates.clone();
        let notify = move |update: ViewUpdate| {
            let _ = updates.send(update);
        };

        let council = self.council.clone();
        let n = notify.clone();
        self.router.subscribe(EventName::Connect, move |_| {
            council.on_connect();
            n(ViewUpdate::Connected);
            n(ViewUpdate::Council);
        });

        let timeline = self.timeline.clone();
        let n = notify.clone();
        self.router.subscribe(EventName::SensorData, move |event| {
            if let InboundEvent::SensorData(data) = event {
                if timeline.on_sensor_data(data).is_some() {
                    n(ViewUpdate::Timeline);
                }
            }
        });

        let council = self.council.clone();
        let n = notify.clone();
        self.router.subscribe(EventName::SensorData, move |event| {
            if let InboundEvent::SensorData(data) = event {
                council.on_sensor_data(data);
                n(ViewUpdate::Council);
            }
        });

        let risk = self.risk.clone();
        let n = notify.clone();
        self.router.subscribe(EventName::AnalysisResult, move |event| {
            if let InboundEvent::AnalysisResult(result) = event {
                risk.on_analysis_result(result);
                n(ViewUpdate::Risk(result.risk_level.clone()));
            }
        });

        let council = self.council.clone();
        let n = notify.clone();
        self.router.subscribe(EventName::AnalysisResult, move |event| {
            if let InboundEvent::AnalysisResult(result) = event {
                council.on_analysis_result(result);
                n(ViewUpdate::Council);
            }
        });

        let chat = self.chat.clone();
        let n = notify.clone();
        self.router.subscribe(EventName::AnalysisResult, move |event| {
            if let InboundEvent::AnalysisResult(result) = event {
                if chat.on_analysis_result(result) {
                    n(ViewUpdate::Chat);
                }
            }
        });

        let graph = self.graph.clone();
        let n = notify.clone();
        self.router.subscribe(EventName::AnalysisResult, move |event| {
            if let InboundEvent::AnalysisResult(result) = event {
                if graph.on_analysis_result(result) {
                    n(ViewUpdate::GraphHighlights);
                }
            }
        });

        let intervention = self.intervention.clone();
        let n = notify.clone();
        self.router.subscribe(EventName::Intervention, move |event| {
            if let InboundEvent::Intervention(payload) = event {
                intervention.on_intervention(payload);
                n(ViewUpdate::InterventionOpened);
            }
        });

        let council = self.council.clone();
        let n = notify.clone();
        self.router.subscribe(EventName::Intervention, move |event| {
            if let InboundEvent::Intervention(payload) = event {
                council.on_intervention(payload);
                n(ViewUpdate::Council);
            }
        });

        let chat = self.chat.clone();
        let n = notify.clone();
        self.router.subscribe(EventName::ChatReply, move |event| {
            if let InboundEvent::ChatReply(reply) = event {
                chat.on_chat_reply(reply);
                n(ViewUpdate::Chat);
            }
        });

        let chat = self.chat.clone();
        let n = notify.clone();
        self.router.subscribe(EventName::RiskCard, move |event| {
            if let InboundEvent::RiskCard(card) = event {
                chat.on_risk_card(card);
                n(ViewUpdate::Chat);
            }
        });

        let council = self.council.clone();
        let n = notify.clone();
        self.router.subscribe(EventName::RiskCard, move |event| {
            if let InboundEvent::RiskCard(card) = event {
                council.on_risk_card(card);
                n(ViewUpdate::Council);
            }
        });

        let environment = self.environment.clone();
        let n = notify.clone();
        self.router.subscribe(EventName::EnvironmentUpdate, move |event| {
            if let InboundEvent::EnvironmentUpdate(update) = event {
                environment.on_environment_update(update);
                n(ViewUpdate::Environment);
            }
        });

        let council = self.council.clone();
        self.router.subscribe(EventName::EnvironmentUpdate, move |event| {
            if let InboundEvent::EnvironmentUpdate(update) = event {
                council.on_environment_update(update);
                notify(ViewUpdate::Council);
            }
        });
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<ViewUpdate> {
        self.updates.subscribe()
    }

    /// Extra handlers run after the built-in ones for the same name.
    pub fn router_mut(&mut self) -> &mut EventRouter {
        &mut self.router
    }

    pub fn dispatch(&mut self, event: &InboundEvent) -> usize {
        self.router.dispatch(event)
    }

    /// Dispatches inbound events serially, in arrival order, until the
    /// transport closes the channel.
    pub async fn run(&mut self, mut inbound: Inbound) {
        while let Some(event) = inbound.recv().await {
            self.dispatch(&event);
        }
        info!("inbound channel closed; dashboard stopped");
    }

    /// Initial fill of the memory list and graph.
    pub async fn mount(&self) {
        if let Err(err) = self.memories.load().await {
            warn!(error = %err, "failed to load memories");
        }
        if let Err(err) = self.memories.refresh_graph().await {
            warn!(error = %err, "failed to load memory graph");
        }
    }

    pub fn spawn_frame_loop(&self) -> JoinHandle<()> {
        environment::spawn_frame_loop(self.environment.clone(), self.frame_interval)
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/dashboard_tests.rs"]
mod dashboard_tests;
