//! A named transport: the hub's view of one connected peer. Grounded in
//! the original's `pkg/hub/session.go`.

use std::ops::Deref;

use crate::proto::Transport;

/// A [`Transport`] tagged with the peer name it logged in as.
#[derive(Clone)]
pub struct Session {
    pub transport: Transport,
    pub name: String,
}

impl Session {
    pub fn new(name: String, transport: Transport) -> Self {
        Self { transport, name }
    }
}

impl Deref for Session {
    type Target = Transport;
    fn deref(&self) -> &Transport {
        &self.transport
    }
}
