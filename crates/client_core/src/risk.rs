use std::sync::{Arc, Mutex, PoisonError};

use shared::{
    domain::{Rgb, RiskLevel},
    protocol::{AnalysisResult, Intervention},
};
use tracing::info;

/// Latest risk level reported by the backend. Every analysis overwrites it;
/// there is no ordering check.
#[derive(Debug, Clone, Default)]
pub struct RiskState {
    level: Arc<Mutex<RiskLevel>>,
}

impl RiskState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_analysis_result(&self, result: &AnalysisResult) {
        let mut level = self.level.lock().unwrap_or_else(PoisonError::into_inner);
        if *level != result.risk_level {
            info!(from = %level, to = %result.risk_level, "risk level changed");
        }
        *level = result.risk_level.clone();
    }

    pub fn level(&self) -> RiskLevel {
        self.level
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn color(&self) -> Rgb {
        self.level().color()
    }
}

/// Blocking prompt raised by `intervention` events until dismissed.
#[derive(Debug, Clone, Default)]
pub struct InterventionModal {
    current: Arc<Mutex<Option<Intervention>>>,
}

impl InterventionModal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A newer intervention replaces one that is still open.
    pub fn on_intervention(&self, intervention: &Intervention) {
        info!(summary = %intervention.summary, "intervention opened");
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(intervention.clone());
    }

    pub fn dismiss(&self) -> Option<Intervention> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn is_open(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn current(&self) -> Option<Intervention> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
