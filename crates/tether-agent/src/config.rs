//! Agent configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_auth::Algorithm;
use tether_fsm::MachineConfig;
use tether_protocol::DeviceId;
use tether_rpc::ChannelConfig;

/// Configuration for an [`Agent`](crate::Agent).
///
/// Every field has a default, so a config file only needs the fields it
/// changes (usually just `device_id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Hardware identity of this device.
    pub device_id: DeviceId,

    /// Which shared secret the handshake uses.
    pub algorithm: Algorithm,

    /// Where this node can be reached, reported on SignIn and Report.
    pub endpoint: String,

    /// Timeout for every unary call, in milliseconds.
    pub call_timeout_ms: u64,

    /// Period of the lifecycle state machine, in milliseconds.
    pub tick_period_ms: u64,

    /// While servicing, send a Report every this many ticks.
    pub report_every_ticks: u32,

    /// Delay between redial attempts after the connection drops, in
    /// milliseconds.
    pub redial_backoff_ms: u64,

    /// Log every state transition at `info`.
    pub trace_states: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: DeviceId::default(),
            algorithm: Algorithm::Aes,
            endpoint: String::new(),
            call_timeout_ms: 5_000,
            tick_period_ms: 1_000,
            report_every_ticks: 30,
            redial_backoff_ms: 1_000,
            trace_states: false,
        }
    }
}

impl AgentConfig {
    /// Defaults for the given device.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: DeviceId::new(device_id),
            ..Default::default()
        }
    }

    /// Timeout for unary calls.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Tick period of the lifecycle machine.
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub(crate) fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            trace: self.trace_states,
            ..MachineConfig::new(format!("agent:{}", self.device_id), self.tick_period())
        }
    }

    pub(crate) fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            redial_backoff: Duration::from_millis(self.redial_backoff_ms),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"device_id":"dev-1","report_every_ticks":5}"#).unwrap();
        assert_eq!(config.device_id, DeviceId::new("dev-1"));
        assert_eq!(config.report_every_ticks, 5);
        assert_eq!(config.call_timeout(), Duration::from_secs(5));
        assert_eq!(config.algorithm, Algorithm::Aes);
    }

    #[test]
    fn test_machine_config_is_named_after_device() {
        let config = AgentConfig::new("dev-7");
        assert_eq!(config.machine_config().name, "agent:dev-7");
    }
}
