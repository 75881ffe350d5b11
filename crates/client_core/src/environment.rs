//! Ambient background parameters. Events move the target instantly; a
//! per-frame tick eases the rendered value toward it.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use shared::{domain::Rgb, protocol::EnvironmentUpdate};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, warn};

pub const DEFAULT_TARGET_COLOR: u32 = 0x06b6d4;
const PHASE_STEP: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentParams {
    pub color: Rgb,
    pub turbulence: f32,
    pub speed: f32,
}

impl EnvironmentParams {
    fn eased_toward(self, target: EnvironmentParams, rate: f32) -> Self {
        Self {
            color: self.color.lerp(target.color, rate),
            turbulence: self.turbulence + (target.turbulence - self.turbulence) * rate,
            speed: self.speed + (target.speed - self.speed) * rate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentFrame {
    pub current: EnvironmentParams,
    pub target: EnvironmentParams,
    /// Animation clock; advances faster as `current.speed` rises.
    pub phase: f32,
}

impl Default for EnvironmentFrame {
    fn default() -> Self {
        Self {
            current: EnvironmentParams {
                color: Rgb::from_rgb24(0x000000),
                turbulence: 0.1,
                speed: 0.2,
            },
            target: EnvironmentParams {
                color: Rgb::from_rgb24(DEFAULT_TARGET_COLOR),
                turbulence: 0.2,
                speed: 0.2,
            },
            phase: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnvironmentField {
    frame: Arc<Mutex<EnvironmentFrame>>,
    rate: f32,
}

impl EnvironmentField {
    /// `rate` is clamped to `0.0..=1.0` so easing never overshoots.
    pub fn new(rate: f32) -> Self {
        let rate = if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 0.0 };
        Self {
            frame: Arc::new(Mutex::new(EnvironmentFrame::default())),
            rate,
        }
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    /// Fields missing from the update, or a color that does not parse,
    /// leave the corresponding target untouched.
    pub fn on_environment_update(&self, update: &EnvironmentUpdate) {
        let mut frame = self.lock();
        if let Some(raw) = update.hex_color.as_deref() {
            match Rgb::from_hex(raw) {
                Some(color) => frame.target.color = color,
                None => warn!(hex = raw, "ignoring unparsable environment color"),
            }
        }
        if let Some(turbulence) = update.turbulence {
            frame.target.turbulence = turbulence;
        }
        if let Some(speed) = update.speed {
            frame.target.speed = speed;
        }
        debug!(
            color = %frame.target.color.to_hex(),
            turbulence = frame.target.turbulence,
            speed = frame.target.speed,
            "environment target updated"
        );
    }

    pub fn tick(&self) -> EnvironmentFrame {
        let mut frame = self.lock();
        frame.phase += PHASE_STEP * (1.0 + frame.current.speed);
        frame.current = frame.current.eased_toward(frame.target, self.rate);
        *frame
    }

    pub fn snapshot(&self) -> EnvironmentFrame {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, EnvironmentFrame> {
        self.frame.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ticks `field` once per `interval` until the returned task is aborted.
pub fn spawn_frame_loop(field: EnvironmentField, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            field.tick();
        }
    })
}
