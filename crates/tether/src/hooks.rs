//! Server-side notification hooks.

use std::sync::Arc;

use tether_protocol::{ClientId, StreamMessage};

use crate::Node;

/// Callbacks fired by the server as nodes come and go.
///
/// All methods default to doing nothing. They run on connection tasks, so
/// keep them short.
pub trait ServerHooks: Send + Sync + 'static {
    /// A node signed in.
    fn on_node_join(&self, _node: &Node) {}

    /// A node signed out or its connection ended.
    fn on_node_leave(&self, _node: &Node) {}

    /// A node sent a `Message` on its push stream. A returned payload is
    /// sent back to that node as a `Message`.
    fn on_message(&self, _identity: &ClientId, _message: StreamMessage) -> Option<Vec<u8>> {
        None
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl ServerHooks for NoopHooks {}

impl<T: ServerHooks> ServerHooks for Arc<T> {
    fn on_node_join(&self, node: &Node) {
        (**self).on_node_join(node);
    }

    fn on_node_leave(&self, node: &Node) {
        (**self).on_node_leave(node);
    }

    fn on_message(&self, identity: &ClientId, message: StreamMessage) -> Option<Vec<u8>> {
        (**self).on_message(identity, message)
    }
}
