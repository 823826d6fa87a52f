//! Unary procedures and their request/response bodies.
//!
//! The dispatch table is closed: a procedure name either parses into a
//! [`Procedure`] or the call is rejected with `NotFound`. Times are unix
//! seconds except the handshake timestamp, which is nanoseconds because it
//! salts the challenge.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tether_auth::Algorithm;

use crate::ProtocolError;
use crate::types::{ClientId, DeviceId};

/// The unary procedures a server answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Procedure {
    SignUp,
    SignIn,
    SignOut,
    Report,
    Config,
}

impl Procedure {
    /// Every procedure, in handshake order.
    pub const ALL: [Procedure; 5] = [
        Self::SignUp,
        Self::SignIn,
        Self::SignOut,
        Self::Report,
        Self::Config,
    ];

    /// The name used on the wire.
    pub fn name(self) -> &'static str {
        match self {
            Self::SignUp => "SignUp",
            Self::SignIn => "SignIn",
            Self::SignOut => "SignOut",
            Self::Report => "Report",
            Self::Config => "Config",
        }
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Procedure {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| ProtocolError::UnknownProcedure(s.to_string()))
    }
}

// -- SignUp --------------------------------------------------------------

/// Agent → server: provision (or recover) a session identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignUpRequest {
    pub device_id: DeviceId,
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Agent clock at derivation time, nanoseconds since the epoch.
    pub timestamp: u64,
    /// Agent-side challenge derived from `device_id` and `timestamp`.
    #[serde(with = "hex")]
    pub challenge: Vec<u8>,
}

/// Server → agent: the issued identity and its expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignUpResponse {
    pub identity: ClientId,
    /// Unix seconds after which the identity must be renewed.
    pub expire_time: u64,
    /// Server-side response bound to `identity`, the device, the agent's
    /// timestamp and `expire_time`.
    #[serde(with = "hex")]
    pub response: Vec<u8>,
}

// -- SignIn --------------------------------------------------------------

/// Agent → server: bind this connection to the identity in the metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInRequest {
    pub device_id: DeviceId,
    /// Where the node can be reached, if it serves anything itself.
    #[serde(default)]
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInResponse {
    pub identity: ClientId,
    pub expire_time: u64,
    pub server_time: u64,
}

// -- SignOut -------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignOutRequest {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignOutResponse {}

// -- Report --------------------------------------------------------------

/// Periodic liveness report from a servicing agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRequest {
    #[serde(default)]
    pub endpoint: String,
    /// Seconds since the agent process started.
    pub uptime: u64,
    /// Free-form status fields.
    #[serde(default)]
    pub status: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportResponse {
    pub server_time: u64,
}

// -- Config --------------------------------------------------------------

/// Asks for the node configuration, carrying the version already applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRequest {
    pub version: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub version: u64,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_procedure_names_parse_back() {
        for p in Procedure::ALL {
            assert_eq!(p.name().parse::<Procedure>().unwrap(), p);
        }
    }

    #[test]
    fn test_unknown_procedure_name_is_rejected() {
        assert!(matches!(
            "Reboot".parse::<Procedure>(),
            Err(ProtocolError::UnknownProcedure(name)) if name == "Reboot"
        ));
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_signup_request_challenge_is_hex() {
        let req = SignUpRequest {
            device_id: DeviceId::new("dev-1"),
            algorithm: Algorithm::Aes,
            timestamp: 42,
            challenge: vec![0x01, 0xff],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["challenge"], "01ff");
        assert_eq!(json["algorithm"], "aes");
        assert_eq!(json["device_id"], "dev-1");
    }
}
