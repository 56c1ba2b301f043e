//! Request/response plumbing for monitor RPCs
//!
//! A [`Request`] is a reference-counted inbound message: cloning it takes a
//! new reference, so a request captured by a deferred continuation outlives
//! the handler that first saw it. Each request is answered at most once on a
//! one-shot channel, either with a JSON payload or with an [`RpcError`].

pub mod dispatch;

pub use dispatch::{HandlerTable, MessageHandler};

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::error::{FleetError, FleetResult};

/// Error response delivered to a requester
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("errno {errnum}: {}", .errstr.as_deref().unwrap_or("(no message)"))]
pub struct RpcError {
    /// POSIX errno
    pub errnum: i32,
    /// Optional human readable explanation
    pub errstr: Option<String>,
}

/// What a requester receives
pub type Response = Result<Value, RpcError>;

/// Receiving half of a request's response channel
pub type ResponseReceiver = oneshot::Receiver<Response>;

struct RequestInner {
    id: Uuid,
    topic: String,
    sender: String,
    payload: Value,
    reply: RefCell<Option<oneshot::Sender<Response>>>,
}

/// An inbound request message
#[derive(Clone)]
pub struct Request(Rc<RequestInner>);

impl Request {
    /// Create a request and the receiver its response will arrive on.
    ///
    /// `sender` identifies the client connection; it is what disconnect
    /// handling matches on.
    pub fn new(
        topic: impl Into<String>,
        sender: impl Into<String>,
        payload: Value,
    ) -> (Request, ResponseReceiver) {
        let (tx, rx) = oneshot::channel();
        let request = Request(Rc::new(RequestInner {
            id: Uuid::new_v4(),
            topic: topic.into(),
            sender: sender.into(),
            payload,
            reply: RefCell::new(Some(tx)),
        }));
        (request, rx)
    }

    /// Unique id of this request
    pub fn id(&self) -> Uuid {
        self.0.id
    }

    /// Topic string the request was sent to
    pub fn topic(&self) -> &str {
        &self.0.topic
    }

    /// Identity of the requesting connection
    pub fn sender(&self) -> &str {
        &self.0.sender
    }

    /// Raw payload
    pub fn payload(&self) -> &Value {
        &self.0.payload
    }

    /// Decode the payload into `T`
    pub fn unpack<T: DeserializeOwned>(&self) -> FleetResult<T> {
        T::deserialize(&self.0.payload)
            .map_err(|e| FleetError::protocol(format!("{}: {}", self.0.topic, e)))
    }

    /// True once a response has been sent
    pub fn is_answered(&self) -> bool {
        self.0.reply.borrow().is_none()
    }

    /// Number of live references to this request
    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// True if both handles refer to the same request
    pub fn ptr_eq(&self, other: &Request) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn send(&self, response: Response) -> FleetResult<()> {
        let tx = self
            .0
            .reply
            .borrow_mut()
            .take()
            .ok_or_else(|| FleetError::protocol(format!("{}: request already answered", self.0.topic)))?;
        tx.send(response).map_err(|_| FleetError::Protocol {
            errnum: libc::ENOTCONN,
            message: format!("{}: requester {} went away", self.0.topic, self.0.sender),
        })
    }

    /// Answer with a success payload
    pub fn respond(&self, payload: Value) -> FleetResult<()> {
        debug!(topic = %self.0.topic, sender = %self.0.sender, "respond");
        self.send(Ok(payload))
    }

    /// Answer with an error code and optional text
    pub fn respond_error(&self, errnum: i32, errstr: Option<&str>) -> FleetResult<()> {
        debug!(topic = %self.0.topic, sender = %self.0.sender, errnum, "respond error");
        self.send(Err(RpcError {
            errnum,
            errstr: errstr.map(str::to_string),
        }))
    }

    /// Answer with the errno and text of `err`
    pub fn respond_fleet_error(&self, err: &FleetError) -> FleetResult<()> {
        let errstr = match err {
            FleetError::Protocol { message, .. } => message.clone(),
            FleetError::IdSet(e) => e.to_string(),
            other => other.to_string(),
        };
        self.respond_error(err.errnum(), Some(&errstr))
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.0.id)
            .field("topic", &self.0.topic)
            .field("sender", &self.0.sender)
            .field("payload", &self.0.payload)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Up {
        up: i64,
    }

    #[test]
    fn test_unpack() {
        let (req, _rx) = Request::new("monitor.waitup", "client-1", json!({"up": 3}));
        let up: Up = req.unpack().unwrap();
        assert_eq!(up.up, 3);

        let (bad, _rx) = Request::new("monitor.waitup", "client-1", json!({"down": 3}));
        let err = bad.unpack::<Up>().unwrap_err();
        assert_eq!(err.errnum(), libc::EPROTO);
    }

    #[test]
    fn test_respond_once() {
        let (req, mut rx) = Request::new("monitor.waitup", "client-1", json!({}));
        req.respond(Value::Null).unwrap();
        assert!(req.is_answered());
        assert_eq!(rx.try_recv().unwrap(), Ok(Value::Null));
        assert!(req.respond(Value::Null).is_err());
    }

    #[test]
    fn test_respond_error() {
        let (req, mut rx) = Request::new("monitor.force-down", "client-1", json!({}));
        req.respond_error(libc::EPROTO, Some("bad ranks")).unwrap();
        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.errnum, libc::EPROTO);
        assert_eq!(err.errstr.as_deref(), Some("bad ranks"));
    }

    #[test]
    fn test_respond_after_disconnect() {
        let (req, rx) = Request::new("monitor.waitup", "client-1", json!({}));
        drop(rx);
        let err = req.respond(Value::Null).unwrap_err();
        assert_eq!(err.errnum(), libc::ENOTCONN);
    }

    #[test]
    fn test_clone_takes_reference() {
        let (req, _rx) = Request::new("monitor.waitup", "client-1", json!({}));
        let held = req.clone();
        assert_eq!(req.refcount(), 2);
        assert!(held.ptr_eq(&req));
        drop(req);
        assert_eq!(held.refcount(), 1);
    }
}
