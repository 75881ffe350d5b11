use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(pub String);

impl MemoryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemoryId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Backend-computed severity. Values outside the known three are kept
/// verbatim so they can be echoed back, and render with the LOW color.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Other(String),
}

impl RiskLevel {
    pub fn as_str(&self) -> &str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Other(raw) => raw,
        }
    }

    /// MEDIUM and HIGH are surfaced to the user as alerts.
    pub fn is_alerting(&self) -> bool {
        matches!(self, RiskLevel::Medium | RiskLevel::High)
    }

    pub fn color(&self) -> Rgb {
        Rgb::from_rgb24(match self {
            RiskLevel::High => palette::RISK_HIGH,
            RiskLevel::Medium => palette::RISK_MEDIUM,
            RiskLevel::Low | RiskLevel::Other(_) => palette::RISK_LOW,
        })
    }
}

impl From<String> for RiskLevel {
    fn from(value: String) -> Self {
        match value.as_str() {
            "LOW" => RiskLevel::Low,
            "MEDIUM" => RiskLevel::Medium,
            "HIGH" => RiskLevel::High,
            _ => RiskLevel::Other(value),
        }
    }
}

impl From<RiskLevel> for String {
    fn from(value: RiskLevel) -> Self {
        match value {
            RiskLevel::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Producer identities shown in the council log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Agent {
    Triage,
    #[serde(rename = "Dr. Nexus")]
    DrNexus,
    Guardian,
    Chair,
    System,
}

impl Agent {
    pub fn display_name(self) -> &'static str {
        match self {
            Agent::Triage => "Triage",
            Agent::DrNexus => "Dr. Nexus",
            Agent::Guardian => "Guardian",
            Agent::Chair => "Chair",
            Agent::System => "System",
        }
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// RGB triple with channels in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Rgb {
    pub fn from_u8(r: u8, g: u8, b: u8) -> Self {
        Self {
            r: f32::from(r) / 255.0,
            g: f32::from(g) / 255.0,
            b: f32::from(b) / 255.0,
        }
    }

    /// Builds a color from a packed `0xRRGGBB` value.
    pub fn from_rgb24(packed: u32) -> Self {
        Self::from_u8(
            ((packed >> 16) & 0xff) as u8,
            ((packed >> 8) & 0xff) as u8,
            (packed & 0xff) as u8,
        )
    }

    /// Parses `#rrggbb`, `rrggbb` or the short `#rgb` form.
    pub fn from_hex(raw: &str) -> Option<Self> {
        let hex = raw.trim().trim_start_matches('#');
        let channel = |s: &str| u8::from_str_radix(s, 16).ok();
        match hex.len() {
            6 if hex.is_ascii() => Some(Self::from_u8(
                channel(&hex[0..2])?,
                channel(&hex[2..4])?,
                channel(&hex[4..6])?,
            )),
            3 if hex.is_ascii() => {
                let expand = |s: &str| channel(&s.repeat(2));
                Some(Self::from_u8(
                    expand(&hex[0..1])?,
                    expand(&hex[1..2])?,
                    expand(&hex[2..3])?,
                ))
            }
            _ => None,
        }
    }

    pub fn to_hex(self) -> String {
        let byte = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", byte(self.r), byte(self.g), byte(self.b))
    }

    /// Moves each channel `alpha` of the way toward `target`.
    pub fn lerp(self, target: Rgb, alpha: f32) -> Self {
        Self {
            r: self.r + (target.r - self.r) * alpha,
            g: self.g + (target.g - self.g) * alpha,
            b: self.b + (target.b - self.b) * alpha,
        }
    }
}

/// Packed `0xRRGGBB` colors used across the dashboard surfaces.
pub mod palette {
    pub const RISK_LOW: u32 = 0x10b981;
    pub const RISK_MEDIUM: u32 = 0xf59e0b;
    pub const RISK_HIGH: u32 = 0xef4444;

    pub const NODE_HIGHLIGHT: u32 = 0xf59e0b;
    pub const NODE_ANXIOUS: u32 = 0xef4444;
    pub const NODE_FLOW: u32 = 0x6366f1;
    pub const NODE_DEFAULT: u32 = 0x22c55e;
}
