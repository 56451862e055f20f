//! Connection capability: the message-oriented transport the core speaks
//! over, and a loopback implementation for self-contained testing.
//!
//! Reconnection, TLS, and websocket details belong to the transport; the
//! core only needs non-blocking send/receive and a connectivity flag. A
//! disconnected transport acts as backpressure on the outbox — nothing is
//! dropped, dispatch simply waits.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Text-frame transport consumed by the core. All methods are non-blocking.
pub trait Connection {
    /// Attempts to hand one text frame to the transport. Returning false
    /// leaves the frame with the caller for a later retry.
    fn try_send(&mut self, msg: &str) -> bool;

    /// Takes the next received text frame, if any.
    fn try_recv(&mut self) -> Option<String>;

    fn is_connected(&self) -> bool;

    /// Gives the transport a chance to make progress (pump its socket,
    /// reconnect, ...). Called once per core poll.
    fn poll(&mut self) {}
}

#[derive(Default)]
struct LoopbackInner {
    connected: bool,
    inbox: VecDeque<String>,
}

/// Echo transport: every frame sent while connected is delivered back as a
/// received frame. With the registry's server-mode handlers this lets the
/// library answer its own requests, which is how the end-to-end tests run
/// without a central system.
///
/// Cloning yields a handle onto the same link, so a test can toggle
/// connectivity or inject frames while the context owns its own handle.
#[derive(Clone)]
pub struct LoopbackConnection {
    inner: Rc<RefCell<LoopbackInner>>,
}

impl LoopbackConnection {
    pub fn new() -> LoopbackConnection {
        LoopbackConnection {
            inner: Rc::new(RefCell::new(LoopbackInner {
                connected: true,
                inbox: VecDeque::new(),
            })),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.borrow_mut().connected = connected;
    }

    /// Injects a frame as if the remote side had sent it.
    pub fn inject(&self, frame: impl Into<String>) {
        self.inner.borrow_mut().inbox.push_back(frame.into());
    }
}

impl Default for LoopbackConnection {
    fn default() -> Self {
        LoopbackConnection::new()
    }
}

impl Connection for LoopbackConnection {
    fn try_send(&mut self, msg: &str) -> bool {
        let mut inner = self.inner.borrow_mut();
        if !inner.connected {
            // swallowed, like a socket whose peer is gone
            return true;
        }
        inner.inbox.push_back(msg.to_string());
        true
    }

    fn try_recv(&mut self) -> Option<String> {
        self.inner.borrow_mut().inbox.pop_front()
    }

    fn is_connected(&self) -> bool {
        self.inner.borrow().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_while_connected() {
        let mut conn = LoopbackConnection::new();
        assert!(conn.try_send("[2,\"a\",\"Heartbeat\",{}]"));
        assert_eq!(conn.try_recv().as_deref(), Some("[2,\"a\",\"Heartbeat\",{}]"));
        assert!(conn.try_recv().is_none());
    }

    #[test]
    fn swallows_while_disconnected() {
        let mut conn = LoopbackConnection::new();
        conn.set_connected(false);
        assert!(conn.try_send("frame"));
        assert!(conn.try_recv().is_none());
    }

    #[test]
    fn handles_share_the_link() {
        let mut conn = LoopbackConnection::new();
        let handle = conn.clone();
        handle.inject("from-server");
        assert_eq!(conn.try_recv().as_deref(), Some("from-server"));
    }
}
