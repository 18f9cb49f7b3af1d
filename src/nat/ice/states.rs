// src/nat/ice/states.rs
//! Component state reported to the application

use std::fmt;

use serde::{Deserialize, Serialize};

/// ICE component state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentState {
    /// No activity yet
    Disconnected,
    /// Local candidates are being gathered
    Gathering,
    /// Connectivity checks are running
    Connecting,
    /// At least one pair is valid
    Connected,
    /// A pair has been selected
    Ready,
    /// Every pair failed
    Failed,
}

impl ComponentState {
    pub fn to_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Gathering => "gathering",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    /// Whether connectivity has been established
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Ready)
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_state_display() {
        assert_eq!(ComponentState::Ready.to_string(), "ready");
        assert!(ComponentState::Connected.is_connected());
        assert!(!ComponentState::Failed.is_connected());
    }
}
