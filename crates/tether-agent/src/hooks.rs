//! Lifecycle callbacks an application can plug into the agent.

use std::sync::Arc;

use tether_protocol::{ClientId, ConfigResponse, StreamMessage};

use crate::Conf;

/// Callbacks fired by the agent as it moves through its lifecycle.
///
/// Every method has an empty default, so implementors override only what
/// they need. Callbacks run on the agent's tasks and should return quickly.
pub trait AgentHooks: Send + Sync + 'static {
    /// The agent is starting, with the provisioning record it loaded.
    fn on_init(&self, _conf: &Conf) {}

    /// SignIn succeeded.
    fn on_authenticated(&self, _identity: &ClientId) {}

    /// A maintenance cycle fetched and applied configuration.
    fn on_maintained(&self, _config: &ConfigResponse) {}

    /// A message arrived on the push stream.
    fn on_message(&self, _message: StreamMessage) {}

    /// The agent has stopped.
    fn on_stop(&self) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl AgentHooks for NoopHooks {}

impl<T: AgentHooks> AgentHooks for Arc<T> {
    fn on_init(&self, conf: &Conf) {
        (**self).on_init(conf);
    }

    fn on_authenticated(&self, identity: &ClientId) {
        (**self).on_authenticated(identity);
    }

    fn on_maintained(&self, config: &ConfigResponse) {
        (**self).on_maintained(config);
    }

    fn on_message(&self, message: StreamMessage) {
        (**self).on_message(message);
    }

    fn on_stop(&self) {
        (**self).on_stop();
    }
}
