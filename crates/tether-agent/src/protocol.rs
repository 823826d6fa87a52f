//! Stateless protocol operations the agent's states call.
//!
//! Each operation is one round trip over the [`Channel`]. None of them
//! retries; a failure surfaces as an error and the state machine tries
//! again on its next tick.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tether_auth::{Algorithm, AuthKeys};
use tether_protocol::{
    ClientId, ConfigRequest, ConfigResponse, DeviceId, IDENTITY_KEY, Procedure, ReportRequest,
    ReportResponse, SignInRequest, SignInResponse, SignOutRequest, SignOutResponse,
    SignUpRequest, SignUpResponse, StreamMessage,
};
use tether_rpc::{Channel, StreamReceiver, StreamSender};
use tether_transport::Dialer;
use tracing::{debug, info};

use crate::AgentError;

/// The agent's view of the server's procedures.
pub struct AgentProtocol<D: Dialer> {
    channel: Channel<D>,
    keys: AuthKeys,
    timeout: Duration,
}

impl<D: Dialer> AgentProtocol<D> {
    /// Wraps a connected channel. `timeout` applies to every unary call.
    pub fn new(channel: Channel<D>, keys: AuthKeys, timeout: Duration) -> Self {
        Self {
            channel,
            keys,
            timeout,
        }
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Channel<D> {
        &self.channel
    }

    /// Obtains a session identity for `device`.
    ///
    /// Sends a fresh challenge and checks that the server's response was
    /// derived from the same secret, device, timestamp and the issued
    /// expiry.
    pub async fn sign_up(
        &self,
        device: &DeviceId,
        algorithm: Algorithm,
    ) -> Result<SignUpResponse, AgentError> {
        let timestamp = unix_nanos();
        let challenge = self.keys.challenge(algorithm, device.as_str(), timestamp)?;
        let request = SignUpRequest {
            device_id: device.clone(),
            algorithm,
            timestamp,
            challenge,
        };
        let reply: SignUpResponse = self
            .channel
            .invoke(Procedure::SignUp, &request, self.timeout)
            .await?;
        self.keys.verify_response(
            algorithm,
            reply.identity.as_str(),
            device.as_str(),
            timestamp,
            reply.expire_time,
            &reply.response,
        )?;
        info!(%device, identity = %reply.identity, expires = reply.expire_time, "signed up");
        Ok(reply)
    }

    /// Binds this connection to `identity` on the server.
    ///
    /// The identity travels as call metadata and stays set for every later
    /// call on the channel.
    pub async fn sign_in(
        &self,
        identity: &ClientId,
        device: &DeviceId,
        endpoint: &str,
    ) -> Result<SignInResponse, AgentError> {
        if identity.is_empty() {
            return Err(AgentError::NotProvisioned);
        }
        self.channel.set_metadata(IDENTITY_KEY, identity.as_str());
        let request = SignInRequest {
            device_id: device.clone(),
            endpoint: endpoint.to_string(),
        };
        let reply: SignInResponse = self
            .channel
            .invoke(Procedure::SignIn, &request, self.timeout)
            .await?;
        info!(%identity, "signed in");
        Ok(reply)
    }

    /// Marks this node offline on the server.
    pub async fn sign_out(&self, reason: &str) -> Result<(), AgentError> {
        let request = SignOutRequest {
            reason: reason.to_string(),
        };
        let _: SignOutResponse = self
            .channel
            .invoke(Procedure::SignOut, &request, self.timeout)
            .await?;
        info!(reason, "signed out");
        Ok(())
    }

    /// Sends a liveness report.
    pub async fn report(&self, request: &ReportRequest) -> Result<ReportResponse, AgentError> {
        let reply = self
            .channel
            .invoke(Procedure::Report, request, self.timeout)
            .await?;
        debug!(uptime = request.uptime, "report sent");
        Ok(reply)
    }

    /// Fetches node configuration, announcing the version already applied.
    pub async fn config(&self, version: u64) -> Result<ConfigResponse, AgentError> {
        let reply: ConfigResponse = self
            .channel
            .invoke(Procedure::Config, &ConfigRequest { version }, self.timeout)
            .await?;
        debug!(version = reply.version, settings = reply.settings.len(), "config fetched");
        Ok(reply)
    }

    /// Opens the push stream and attaches it to this node's session.
    pub async fn watch(&self) -> Result<(StreamSender<D::Connection>, StreamReceiver), AgentError> {
        let (tx, rx) = self.channel.open_stream().await?;
        tx.send(StreamMessage::initiate()).await?;
        debug!("push stream initiated");
        Ok((tx, rx))
    }

    /// Closes the channel. Later calls fail.
    pub async fn close(&self) {
        self.channel.close().await;
    }
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
