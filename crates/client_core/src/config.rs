use std::{collections::HashMap, fs, path::Path, time::Duration};

use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "dashboard.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub backend_url: String,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub timeline_capacity: usize,
    pub council_capacity: usize,
    pub chat_capacity: usize,
    pub smoothing_rate: f32,
    pub frame_rate: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8000".into(),
            reconnect_initial_delay_ms: 1_000,
            reconnect_max_delay_ms: 5_000,
            timeline_capacity: 20,
            council_capacity: 50,
            chat_capacity: 200,
            smoothing_rate: 0.02,
            frame_rate: 60,
        }
    }
}

impl Settings {
    pub fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_delay_ms.max(1))
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms.max(self.reconnect_initial_delay_ms))
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.frame_rate.max(1)))
    }

    pub fn backend_url(&self) -> &str {
        self.backend_url.trim_end_matches('/')
    }
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(DEFAULT_CONFIG_FILE))
}

/// Defaults, then the flat `key = "value"` file at `path` if present, then
/// environment variables.
pub fn load_settings_from(path: &Path) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => {
                for (key, value) in file_cfg {
                    let value = match value {
                        toml::Value::String(text) => text,
                        other => other.to_string(),
                    };
                    apply_override(&mut settings, &key, &value);
                }
            }
            Err(err) => warn!(path = %path.display(), %err, "ignoring unreadable config file"),
        }
    }

    for (key, vars) in ENV_OVERRIDES {
        for var in *vars {
            if let Ok(value) = std::env::var(var) {
                apply_override(&mut settings, key, &value);
            }
        }
    }

    settings
}

const ENV_OVERRIDES: &[(&str, &[&str])] = &[
    ("backend_url", &["DASHBOARD_BACKEND_URL", "APP__BACKEND_URL"]),
    (
        "reconnect_initial_delay_ms",
        &["APP__RECONNECT_INITIAL_DELAY_MS"],
    ),
    ("reconnect_max_delay_ms", &["APP__RECONNECT_MAX_DELAY_MS"]),
    ("timeline_capacity", &["APP__TIMELINE_CAPACITY"]),
    ("council_capacity", &["APP__COUNCIL_CAPACITY"]),
    ("chat_capacity", &["APP__CHAT_CAPACITY"]),
    ("smoothing_rate", &["APP__SMOOTHING_RATE"]),
    ("frame_rate", &["APP__FRAME_RATE"]),
];

fn apply_override(settings: &mut Settings, key: &str, value: &str) {
    let value = value.trim();
    let applied = match key {
        "backend_url" => {
            settings.backend_url = value.to_string();
            true
        }
        "reconnect_initial_delay_ms" => set_parsed(&mut settings.reconnect_initial_delay_ms, value),
        "reconnect_max_delay_ms" => set_parsed(&mut settings.reconnect_max_delay_ms, value),
        "timeline_capacity" => set_parsed(&mut settings.timeline_capacity, value),
        "council_capacity" => set_parsed(&mut settings.council_capacity, value),
        "chat_capacity" => set_parsed(&mut settings.chat_capacity, value),
        "smoothing_rate" => set_parsed(&mut settings.smoothing_rate, value),
        "frame_rate" => set_parsed(&mut settings.frame_rate, value),
        _ => {
            warn!(key, "unknown config key");
            return;
        }
    };
    if !applied {
        warn!(key, value, "ignoring unparsable config value");
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, value: &str) -> bool {
    match value.parse() {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
