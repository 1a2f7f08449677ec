//! Per-transport dispatch table, keyed by message key string. A tagged
//! variant `match` over [`crate::model::Payload`] sits behind the same
//! registration call a caller would make against the original's
//! `Dispatcher[T]` — dynamic dispatch stays at the wire/typed boundary only,
//! per DESIGN.md's redesign notes.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{PtunError, Result};

pub type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Handlers registered by message key run concurrently with further reads:
/// `dispatch` spawns the handler rather than awaiting it. Generic over the
/// message envelope type (`Request` on the request channel, `Response` on
/// the response channel), mirroring the original's `Dispatcher[*Request]` /
/// `Dispatcher[*Response]`.
pub struct Dispatcher<T: Send + 'static> {
    handlers: DashMap<&'static str, Handler<T>>,
}

impl<T: Send + 'static> Default for Dispatcher<T> {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }
}

impl<T: Send + 'static> Dispatcher<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, key: &'static str, handler: Handler<T>) {
        self.handlers.insert(key, handler);
    }

    /// Looks up `key` and spawns the handler. Unknown keys return
    /// `NoHandler` and the frame is dropped by the caller.
    pub fn dispatch(&self, key: &'static str, msg: T) -> Result<()> {
        match self.handlers.get(key) {
            Some(handler) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    handler(msg);
                });
                Ok(())
            }
            None => Err(PtunError::NoHandler(key.to_string())),
        }
    }
}
