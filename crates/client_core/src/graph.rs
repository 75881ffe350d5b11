//! Memory relationship graph: one node per stored record, one edge per pair
//! of records that mention a common entity, recolored in place when the
//! backend flags records as risk-relevant.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::{
    domain::{palette, MemoryId, Rgb},
    protocol::{AnalysisResult, MemoryRecord},
};
use tracing::{debug, info};

use crate::{error::MemoryApiError, memory_api::MemoryApi};

pub const HIGHLIGHT_SIZE: f32 = 3.0;
pub const DEFAULT_SIZE: f32 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub id: MemoryId,
    pub label: String,
    pub record: MemoryRecord,
    pub color: Rgb,
    pub size: f32,
    pub highlighted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    pub source: MemoryId,
    pub target: MemoryId,
    /// Number of entities the two records have in common.
    pub shared: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphSnapshot {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

pub fn state_color(user_state: &str) -> Rgb {
    Rgb::from_rgb24(match user_state {
        "Anxious" => palette::NODE_ANXIOUS,
        "Flow" => palette::NODE_FLOW,
        _ => palette::NODE_DEFAULT,
    })
}

fn style(node: &mut GraphNode, highlights: &HashSet<MemoryId>) {
    node.highlighted = highlights.contains(&node.id);
    if node.highlighted {
        node.color = Rgb::from_rgb24(palette::NODE_HIGHLIGHT);
        node.size = HIGHLIGHT_SIZE;
    } else {
        node.color = state_color(&node.record.user_state);
        node.size = DEFAULT_SIZE;
    }
}

impl GraphSnapshot {
    /// Records sharing a node id collapse into the first one seen. Each
    /// unordered pair of distinct nodes gets at most one edge.
    pub fn build(records: &[MemoryRecord], highlights: &HashSet<MemoryId>) -> Self {
        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(records.len());
        for record in records {
            let id = record.node_id();
            if !seen.insert(id.clone()) {
                continue;
            }
            let mut node = GraphNode {
                id,
                label: record.scene.clone(),
                record: record.clone(),
                color: state_color(&record.user_state),
                size: DEFAULT_SIZE,
                highlighted: false,
            };
            style(&mut node, highlights);
            nodes.push(node);
        }

        let mut edges = Vec::new();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                let shared = a.record.shares_entity_with(&b.record);
                if shared > 0 {
                    edges.push(GraphEdge {
                        source: a.id.clone(),
                        target: b.id.clone(),
                        shared,
                    });
                }
            }
        }

        Self { nodes, edges }
    }

    pub fn node(&self, id: &MemoryId) -> Option<&GraphNode> {
        self.nodes.iter().find(|node| &node.id == id)
    }

    pub fn contains(&self, id: &MemoryId) -> bool {
        self.node(id).is_some()
    }

    pub fn is_linked(&self, a: &MemoryId, b: &MemoryId) -> bool {
        self.edges.iter().any(|edge| {
            (&edge.source == a && &edge.target == b) || (&edge.source == b && &edge.target == a)
        })
    }

    pub fn neighbors(&self, id: &MemoryId) -> Vec<&MemoryId> {
        self.edges
            .iter()
            .filter_map(|edge| {
                if &edge.source == id {
                    Some(&edge.target)
                } else if &edge.target == id {
                    Some(&edge.source)
                } else {
                    None
                }
            })
            .collect()
    }

    fn restyle(&mut self, highlights: &HashSet<MemoryId>) {
        for node in &mut self.nodes {
            style(node, highlights);
        }
    }
}

/// Ticket handed out by [`GraphState::begin_refresh`]. Completing with a
/// ticket older than the latest one is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RefreshTicket(u64);

#[derive(Debug, Default)]
struct GraphInner {
    snapshot: GraphSnapshot,
    highlights: HashSet<MemoryId>,
    selected: Option<MemoryId>,
    generation: u64,
}

#[derive(Debug, Clone, Default)]
pub struct GraphState {
    inner: Arc<Mutex<GraphInner>>,
}

impl GraphState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_refresh(&self) -> RefreshTicket {
        let mut inner = self.lock();
        inner.generation += 1;
        RefreshTicket(inner.generation)
    }

    /// Makes every outstanding ticket stale, e.g. when the view goes away.
    pub fn invalidate(&self) {
        self.lock().generation += 1;
    }

    pub fn complete_refresh(&self, ticket: RefreshTicket, records: &[MemoryRecord]) -> bool {
        let mut inner = self.lock();
        if ticket.0 != inner.generation {
            debug!(ticket = ticket.0, current = inner.generation, "discarding stale graph fetch");
            return false;
        }
        let snapshot = GraphSnapshot::build(records, &inner.highlights);
        let selection_gone = inner
            .selected
            .as_ref()
            .is_some_and(|id| !snapshot.contains(id));
        if selection_gone {
            inner.selected = None;
        }
        debug!(
            nodes = snapshot.nodes.len(),
            edges = snapshot.edges.len(),
            "graph rebuilt"
        );
        inner.snapshot = snapshot;
        true
    }

    /// Fetches every record and rebuilds the graph. Returns `false` when a
    /// newer refresh superseded this one.
    pub async fn refresh(&self, api: &dyn MemoryApi) -> Result<bool, MemoryApiError> {
        let ticket = self.begin_refresh();
        let records = api.list().await?;
        Ok(self.complete_refresh(ticket, &records))
    }

    /// Replaces the highlight set when the result carries one. Ids missing
    /// from the current graph are kept and match nothing until a fetch
    /// brings them in.
    pub fn on_analysis_result(&self, result: &AnalysisResult) -> bool {
        let Some(highlights) = &result.graph_highlights else {
            return false;
        };
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.highlights = highlights.iter().cloned().collect();
        inner.snapshot.restyle(&inner.highlights);
        info!(count = inner.highlights.len(), "graph highlights updated");
        true
    }

    pub fn highlights(&self) -> HashSet<MemoryId> {
        self.lock().highlights.clone()
    }

    /// Returns `false` for ids not in the current graph.
    pub fn select(&self, id: &MemoryId) -> bool {
        let mut inner = self.lock();
        if !inner.snapshot.contains(id) {
            return false;
        }
        inner.selected = Some(id.clone());
        true
    }

    pub fn clear_selection(&self) {
        self.lock().selected = None;
    }

    pub fn selected(&self) -> Option<GraphNode> {
        let inner = self.lock();
        let id = inner.selected.as_ref()?;
        inner.snapshot.node(id).cloned()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        self.lock().snapshot.clone()
    }

    fn lock(&self) -> MutexGuard<'_, GraphInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests/graph_tests.rs"]
mod tests;
