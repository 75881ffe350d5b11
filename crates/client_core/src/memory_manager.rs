use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::NaiveDate;
use shared::{domain::MemoryId, protocol::MemoryRecord};
use tracing::{info, warn};

use crate::{error::MemoryApiError, graph::GraphState, memory_api::MemoryApi};

/// Per-id outcome of a bulk delete. Deletes are issued one at a time and
/// nothing is rolled back, so both lists can be non-empty.
#[derive(Debug, Default)]
pub struct BulkDeleteReport {
    pub deleted: Vec<MemoryId>,
    pub failed: Vec<(MemoryId, MemoryApiError)>,
}

impl BulkDeleteReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
struct ManagerInner {
    records: Vec<MemoryRecord>,
    selected: BTreeSet<MemoryId>,
}

/// List-and-delete view over stored memories. Every mutation is followed
/// by a relist and a graph refresh so both views match the backend.
#[derive(Clone)]
pub struct MemoryManager {
    api: Arc<dyn MemoryApi>,
    graph: GraphState,
    inner: Arc<Mutex<ManagerInner>>,
}

impl MemoryManager {
    pub fn new(api: Arc<dyn MemoryApi>, graph: GraphState) -> Self {
        Self {
            api,
            graph,
            inner: Arc::new(Mutex::new(ManagerInner::default())),
        }
    }

    /// Fetches every record, newest first. Selected ids that no longer
    /// exist are dropped from the selection.
    pub async fn load(&self) -> Result<usize, MemoryApiError> {
        let mut records = self.api.list().await?;
        records.sort_by(|a, b| b.parsed_timestamp().cmp(&a.parsed_timestamp()));

        let mut inner = self.lock();
        let present: BTreeSet<MemoryId> = records.iter().map(MemoryRecord::node_id).collect();
        inner.selected.retain(|id| present.contains(id));
        inner.records = records;
        Ok(inner.records.len())
    }

    pub fn records(&self) -> Vec<MemoryRecord> {
        self.lock().records.clone()
    }

    pub fn selected(&self) -> Vec<MemoryId> {
        self.lock().selected.iter().cloned().collect()
    }

    /// Returns whether `id` is selected afterwards.
    pub fn toggle(&self, id: &MemoryId) -> bool {
        let mut inner = self.lock();
        if inner.selected.remove(id) {
            false
        } else {
            inner.selected.insert(id.clone());
            true
        }
    }

    /// Selects every listed record, or clears the selection when all of
    /// them already are.
    pub fn toggle_all(&self) {
        let mut inner = self.lock();
        let all: BTreeSet<MemoryId> = inner.records.iter().map(MemoryRecord::node_id).collect();
        if !all.is_empty() && inner.selected == all {
            inner.selected.clear();
        } else {
            inner.selected = all;
        }
    }

    pub fn clear_selection(&self) {
        self.lock().selected.clear();
    }

    /// Deletes a single record. A missing id surfaces as
    /// [`MemoryApiError::NotFound`] and leaves local state untouched.
    pub async fn delete(&self, id: &MemoryId) -> Result<(), MemoryApiError> {
        self.api.delete(id).await?;
        self.lock().selected.remove(id);
        self.resync().await;
        Ok(())
    }

    /// Deletes every selected id in order. Failed ids stay selected.
    pub async fn delete_selected(&self) -> BulkDeleteReport {
        let ids = self.selected();
        let mut report = BulkDeleteReport::default();
        if ids.is_empty() {
            return report;
        }
        for id in ids {
            match self.api.delete(&id).await {
                Ok(()) => {
                    self.lock().selected.remove(&id);
                    report.deleted.push(id);
                }
                Err(err) => {
                    warn!(%id, error = %err, "failed to delete memory");
                    report.failed.push((id, err));
                }
            }
        }
        info!(
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "bulk delete finished"
        );
        self.resync().await;
        report
    }

    /// Deletes records from the start of `start` through 23:59:59 on `end`.
    pub async fn delete_day_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<(), MemoryApiError> {
        let invalid = || MemoryApiError::InvalidRange {
            start: start.to_string(),
            end: end.to_string(),
        };
        if end < start {
            return Err(invalid());
        }
        let from = start.and_hms_opt(0, 0, 0).ok_or_else(invalid)?.and_utc();
        let until = end.and_hms_opt(23, 59, 59).ok_or_else(invalid)?.and_utc();
        self.api.delete_range(from, until).await?;
        self.resync().await;
        Ok(())
    }

    pub async fn wipe_all(&self) -> Result<(), MemoryApiError> {
        self.api.delete_all().await?;
        self.lock().selected.clear();
        self.resync().await;
        Ok(())
    }

    pub fn graph(&self) -> &GraphState {
        &self.graph
    }

    pub async fn refresh_graph(&self) -> Result<bool, MemoryApiError> {
        self.graph.refresh(self.api.as_ref()).await
    }

    /// Relists and refreshes the graph after a mutation. Failures here are
    /// logged; the mutation itself already succeeded.
    async fn resync(&self) {
        if let Err(err) = self.load().await {
            warn!(error = %err, "failed to relist memories");
        }
        if let Err(err) = self.refresh_graph().await {
            warn!(error = %err, "failed to refresh memory graph");
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests/memory_manager_tests.rs"]
mod tests;
