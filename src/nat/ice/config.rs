// src/nat/ice/config.rs
//! Agent configuration and compatibility modes

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::nat::error::{NatError, NatResult};
use crate::nat::stun::timer::{
    STUN_TIMER_DEFAULT_MAX_RETRANSMISSIONS, STUN_TIMER_DEFAULT_RELIABLE_TIMEOUT,
    STUN_TIMER_DEFAULT_TIMEOUT,
};
use crate::nat::stun::{StunCompatibility, StunUsageFlags};

use super::check_list::MAX_PAIRS_PER_STREAM;

/// Default pacing timer Ta in milliseconds
pub const DEFAULT_TIMER_TA_MS: u64 = 20;

/// Default keepalive interval Tr in milliseconds
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 25_000;

/// ICE dialect spoken with the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compatibility {
    /// RFC 5245 (also draft 19)
    #[default]
    #[serde(alias = "draft19")]
    Rfc5245,
    /// Google Talk Jingle
    Google,
    /// MSN Messenger
    Msn,
    /// Windows Live Messenger 2009
    Wlm2009,
    /// Office Communicator 2007
    Oc2007,
    /// Office Communicator 2007 R2
    Oc2007R2,
}

impl Compatibility {
    pub const DRAFT19: Self = Self::Rfc5245;

    /// STUN dialect used for connectivity checks
    pub fn stun_compatibility(self) -> StunCompatibility {
        match self {
            Self::Rfc5245 => StunCompatibility::Rfc5389,
            Self::Google | Self::Msn => StunCompatibility::Rfc3489,
            Self::Wlm2009 | Self::Oc2007R2 => StunCompatibility::MsIce2,
            Self::Oc2007 => StunCompatibility::Oc2007,
        }
    }

    /// Usage flags of the connectivity check STUN agent
    pub fn conncheck_usage(self) -> StunUsageFlags {
        use StunUsageFlags as F;
        match self {
            Self::Rfc5245 => F::SHORT_TERM_CREDENTIALS | F::USE_FINGERPRINT | F::NO_INDICATION_AUTH,
            Self::Google => F::SHORT_TERM_CREDENTIALS | F::IGNORE_CREDENTIALS,
            Self::Msn => F::SHORT_TERM_CREDENTIALS | F::FORCE_VALIDATER,
            Self::Wlm2009 | Self::Oc2007R2 => F::SHORT_TERM_CREDENTIALS | F::USE_FINGERPRINT,
            Self::Oc2007 => {
                F::SHORT_TERM_CREDENTIALS | F::FORCE_VALIDATER | F::NO_ALIGNED_ATTRIBUTES
            }
        }
    }

    /// Whether checks carry ICE-CONTROLLING/ICE-CONTROLLED and USE-CANDIDATE
    pub fn supports_nomination(self) -> bool {
        matches!(self, Self::Rfc5245 | Self::Wlm2009 | Self::Oc2007R2)
    }

    /// Whether credentials are carried per candidate rather than per stream
    pub fn per_candidate_credentials(self) -> bool {
        matches!(self, Self::Google | Self::Msn | Self::Oc2007)
    }

    /// Whether passwords travel base64 encoded
    pub fn base64_credentials(self) -> bool {
        matches!(self, Self::Msn | Self::Oc2007)
    }
}

/// TURN dialect used for relayed candidate discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnCompatibility {
    /// draft-ietf-behave-turn-09
    Draft9,
    Rfc5766,
    Google,
    Msn,
    Oc2007,
}

impl TurnCompatibility {
    /// Dialect servers expect from peers speaking `compatibility`
    pub fn for_agent(compatibility: Compatibility) -> Self {
        match compatibility {
            Compatibility::Rfc5245 => Self::Rfc5766,
            Compatibility::Google => Self::Google,
            Compatibility::Msn | Compatibility::Wlm2009 => Self::Msn,
            Compatibility::Oc2007 | Compatibility::Oc2007R2 => Self::Oc2007,
        }
    }

    /// STUN dialect and usage of the allocation agent
    pub fn stun_settings(self) -> (StunCompatibility, StunUsageFlags) {
        use StunUsageFlags as F;
        match self {
            Self::Draft9 | Self::Rfc5766 => (
                StunCompatibility::Rfc5389,
                F::LONG_TERM_CREDENTIALS | F::NO_INDICATION_AUTH,
            ),
            Self::Google => (
                StunCompatibility::Rfc3489,
                F::SHORT_TERM_CREDENTIALS | F::IGNORE_CREDENTIALS,
            ),
            Self::Msn => (
                StunCompatibility::Rfc3489,
                F::SHORT_TERM_CREDENTIALS | F::NO_INDICATION_AUTH,
            ),
            Self::Oc2007 => (
                StunCompatibility::Oc2007,
                F::LONG_TERM_CREDENTIALS | F::NO_INDICATION_AUTH,
            ),
        }
    }
}

/// Nomination procedure used by the controlling agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NominationMode {
    /// Re-check the chosen valid pair with USE-CANDIDATE
    #[default]
    Regular,
    /// Set USE-CANDIDATE on every check
    Aggressive,
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub compatibility: Compatibility,

    /// Streams expect a reliable transport
    pub reliable: bool,

    /// Start in the controlling role
    pub controlling_mode: bool,

    pub nomination_mode: NominationMode,

    /// Pacing timer Ta
    pub timer_ta_ms: u64,

    /// Keepalive interval Tr
    pub keepalive_interval_ms: u64,

    /// Send keepalives as Binding requests instead of indications
    pub keepalive_conncheck: bool,

    /// Check list size limit (RFC 5245 only)
    pub max_conn_checks: usize,

    pub stun_max_retransmissions: u32,
    pub stun_initial_timeout_ms: u32,
    pub stun_reliable_timeout_ms: u32,

    /// STUN server for server reflexive discovery
    pub stun_server: Option<SocketAddr>,

    /// Only pair relayed local candidates
    pub force_relay: bool,

    /// TURN dialect, derived from `compatibility` when unset
    pub turn_compatibility: Option<TurnCompatibility>,

    /// SOFTWARE attribute value
    pub software: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            compatibility: Compatibility::Rfc5245,
            reliable: false,
            controlling_mode: false,
            nomination_mode: NominationMode::Regular,
            timer_ta_ms: DEFAULT_TIMER_TA_MS,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            keepalive_conncheck: false,
            max_conn_checks: MAX_PAIRS_PER_STREAM,
            stun_max_retransmissions: STUN_TIMER_DEFAULT_MAX_RETRANSMISSIONS,
            stun_initial_timeout_ms: STUN_TIMER_DEFAULT_TIMEOUT,
            stun_reliable_timeout_ms: STUN_TIMER_DEFAULT_RELIABLE_TIMEOUT,
            stun_server: None,
            force_relay: false,
            turn_compatibility: None,
            software: None,
        }
    }
}

impl AgentConfig {
    pub fn from_json(json: &str) -> NatResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| NatError::Configuration(format!("Invalid agent config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> NatResult<()> {
        if self.timer_ta_ms == 0 {
            return Err(NatError::Configuration("Ta must be positive".to_string()));
        }

        if self.max_conn_checks == 0 {
            return Err(NatError::Configuration(
                "Check list limit cannot be zero".to_string(),
            ));
        }

        if self.stun_initial_timeout_ms == 0 || self.stun_reliable_timeout_ms == 0 {
            return Err(NatError::Configuration(
                "STUN timeouts must be positive".to_string(),
            ));
        }

        if self.keepalive_interval_ms == 0 {
            return Err(NatError::Configuration(
                "Keepalive interval must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn turn_compatibility(&self) -> TurnCompatibility {
        self.turn_compatibility
            .unwrap_or_else(|| TurnCompatibility::for_agent(self.compatibility))
    }

    /// Usage flags for the connectivity check agent, SOFTWARE included
    pub(crate) fn conncheck_usage(&self) -> StunUsageFlags {
        let mut usage = self.compatibility.conncheck_usage();
        if self.software.is_some() {
            usage |= StunUsageFlags::ADD_SOFTWARE;
        }
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.compatibility, Compatibility::Rfc5245);
        assert_eq!(config.max_conn_checks, 100);
        assert_eq!(config.timer_ta_ms, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json() {
        let config = AgentConfig::from_json(
            r#"{"compatibility": "draft19", "controlling_mode": true, "nomination_mode": "aggressive"}"#,
        )
        .unwrap();
        assert_eq!(config.compatibility, Compatibility::DRAFT19);
        assert!(config.controlling_mode);
        assert_eq!(config.nomination_mode, NominationMode::Aggressive);
        assert_eq!(config.stun_initial_timeout_ms, 200);

        let config = AgentConfig::from_json(r#"{"compatibility": "oc2007r2"}"#).unwrap();
        assert_eq!(config.compatibility, Compatibility::Oc2007R2);
    }

    #[test]
    fn test_invalid_config() {
        assert!(AgentConfig::from_json(r#"{"timer_ta_ms": 0}"#).is_err());
        assert!(AgentConfig::from_json(r#"{"max_conn_checks": 0}"#).is_err());
        assert!(AgentConfig::from_json(r#"{"compatibility": "sip"}"#).is_err());
    }

    #[test]
    fn test_compatibility_mapping() {
        assert_eq!(
            Compatibility::Rfc5245.stun_compatibility(),
            StunCompatibility::Rfc5389
        );
        assert_eq!(Compatibility::Wlm2009.stun_compatibility(), StunCompatibility::WLM2009);
        assert!(Compatibility::Google
            .conncheck_usage()
            .contains(StunUsageFlags::IGNORE_CREDENTIALS));
        assert!(!Compatibility::Msn.supports_nomination());

        let config = AgentConfig {
            software: Some("sharp".into()),
            ..AgentConfig::default()
        };
        assert!(config.conncheck_usage().contains(StunUsageFlags::ADD_SOFTWARE));
    }

    #[test]
    fn test_turn_compatibility() {
        let config = AgentConfig::default();
        assert_eq!(config.turn_compatibility(), TurnCompatibility::Rfc5766);

        let config = AgentConfig::from_json(
            r#"{"compatibility": "wlm2009", "turn_compatibility": "draft9"}"#,
        )
        .unwrap();
        assert_eq!(config.turn_compatibility(), TurnCompatibility::Draft9);
        assert_eq!(
            TurnCompatibility::for_agent(Compatibility::Oc2007R2),
            TurnCompatibility::Oc2007
        );
    }
}
