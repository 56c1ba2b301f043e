//! Topic-based request dispatch
//!
//! Requests that arrive before the owning module reports ready are stalled
//! on a [`WaitQueue`] as continuations and redelivered, in arrival order,
//! when [`HandlerTable::set_ready`] is called.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, error, warn};

use super::Request;
use crate::error::FleetResult;
use crate::waitqueue::{Continuation, Wait, WaitQueue};

/// A request handler
pub type MessageHandler = Rc<dyn Fn(&Request)>;

/// Maps topics to handlers
#[derive(Default)]
pub struct HandlerTable {
    handlers: RefCell<HashMap<String, MessageHandler>>,
    stalled: WaitQueue,
    ready: Cell<bool>,
}

impl HandlerTable {
    /// Create a table that stalls requests until [`HandlerTable::set_ready`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`, replacing any previous one
    pub fn register(&self, topic: impl Into<String>, handler: MessageHandler) {
        self.handlers.borrow_mut().insert(topic.into(), handler);
    }

    /// Remove the handler for `topic`
    pub fn unregister(&self, topic: &str) -> bool {
        self.handlers.borrow_mut().remove(topic).is_some()
    }

    /// True once stalled requests have been released
    pub fn is_ready(&self) -> bool {
        self.ready.get()
    }

    /// Number of requests waiting for the table to become ready
    pub fn stalled_count(&self) -> usize {
        self.stalled.pending_count()
    }

    /// Deliver `req` to its handler, or stall it if not yet ready.
    ///
    /// Unknown topics are answered with `ENOSYS`.
    pub fn dispatch(&self, req: &Request) -> FleetResult<()> {
        let handler = self.handlers.borrow().get(req.topic()).cloned();
        let Some(handler) = handler else {
            warn!(topic = %req.topic(), "no handler for request");
            if let Err(e) = req.respond_error(libc::ENOSYS, Some("unknown topic")) {
                error!(topic = %req.topic(), error = %e, "error responding to request");
            }
            return Ok(());
        };
        if !self.ready.get() {
            let wait = Wait::continuation(Continuation::new(req.topic(), handler, req));
            self.stalled.enqueue(&wait)?;
            debug!(topic = %req.topic(), sender = %req.sender(), "request stalled");
            return Ok(());
        }
        handler(req);
        Ok(())
    }

    /// Mark the table ready and redeliver stalled requests
    pub fn set_ready(&self) -> FleetResult<()> {
        if self.ready.replace(true) {
            return Ok(());
        }
        debug!(count = self.stalled.len(), "handler table ready");
        self.stalled.run_all()
    }

    /// Drop stalled requests from a disconnected client
    pub fn disconnect(&self, sender: &str) -> FleetResult<usize> {
        self.stalled.purge_matching(|req| req.sender() == sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn echo_table() -> HandlerTable {
        let table = HandlerTable::new();
        table.register(
            "test.echo",
            Rc::new(|req: &Request| {
                req.respond(req.payload().clone()).unwrap();
            }),
        );
        table
    }

    #[test]
    fn test_unknown_topic() {
        let table = echo_table();
        table.set_ready().unwrap();
        let (req, mut rx) = Request::new("test.nope", "c1", json!({}));
        table.dispatch(&req).unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap_err().errnum, libc::ENOSYS);
    }

    #[test]
    fn test_stall_until_ready() {
        let table = echo_table();
        let (req, mut rx) = Request::new("test.echo", "c1", json!({"n": 1}));
        table.dispatch(&req).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(table.stalled_count(), 1);

        table.set_ready().unwrap();
        assert_eq!(rx.try_recv().unwrap(), Ok(json!({"n": 1})));
        assert_eq!(table.stalled_count(), 0);

        let (req, mut rx) = Request::new("test.echo", "c1", Value::Null);
        table.dispatch(&req).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Ok(Value::Null));
    }

    #[test]
    fn test_disconnect_purges_stalled() {
        let table = echo_table();
        let (gone, mut gone_rx) = Request::new("test.echo", "c1", json!(1));
        let (kept, mut kept_rx) = Request::new("test.echo", "c2", json!(2));
        table.dispatch(&gone).unwrap();
        table.dispatch(&kept).unwrap();

        assert_eq!(table.disconnect("c1").unwrap(), 1);
        table.set_ready().unwrap();
        assert!(gone_rx.try_recv().is_err());
        assert!(!gone.is_answered());
        assert_eq!(kept_rx.try_recv().unwrap(), Ok(json!(2)));
    }
}
