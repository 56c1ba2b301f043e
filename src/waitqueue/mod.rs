//! Reference-counted, run-once deferred completions
//!
//! A [`Wait`] wraps one deferred action: either a plain callback or a
//! [`Continuation`] that resumes a blocked request handler. A wait may sit on
//! several [`WaitQueue`]s at once. Each queue holds one reference, counted by
//! the wait's `usecount`, and the action fires only when the last holding
//! queue releases it. Running the other queues first merely drops their
//! references.
//!
//! Everything here is single-threaded: queues and waits use `Rc`, `Cell`
//! and `RefCell`, and all operations run on the reactor thread.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::error::{FleetError, FleetResult};
use crate::rpc::{MessageHandler, Request};

/// Callback invoked synchronously when an error is set on a wait
pub type WaitErrorHandler = Box<dyn FnMut(&Wait, i32)>;

/// A suspended request handler, resumed when its wait fires.
///
/// Holds its own reference to the request so the message stays alive after
/// the handler that stalled it has returned.
pub struct Continuation {
    topic: String,
    handler: Option<MessageHandler>,
    request: Request,
}

impl Continuation {
    /// Capture `request` for later redelivery to `handler`
    pub fn new(topic: impl Into<String>, handler: MessageHandler, request: &Request) -> Self {
        Self {
            topic: topic.into(),
            handler: Some(handler),
            request: request.clone(),
        }
    }

    /// Topic of the handler that will be resumed
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The captured request
    pub fn request(&self) -> &Request {
        &self.request
    }

    fn resume(self) {
        if let Some(handler) = self.handler {
            trace!(topic = %self.topic, "resuming stalled request");
            handler(&self.request);
        }
    }
}

/// The action a wait performs when it fires
pub enum WaitAction {
    /// Plain callback; its argument is whatever the closure captured
    Callback(Box<dyn FnOnce()>),
    /// Resume a blocked message handler
    Continuation(Continuation),
    /// Already fired
    Spent,
}

struct WaitState {
    usecount: Cell<usize>,
    action: RefCell<WaitAction>,
    errnum: Cell<i32>,
    error_handler: RefCell<Option<WaitErrorHandler>>,
}

/// Handle to one deferred action
#[derive(Clone)]
pub struct Wait(Rc<WaitState>);

impl Wait {
    fn with_action(action: WaitAction) -> Self {
        Wait(Rc::new(WaitState {
            usecount: Cell::new(0),
            action: RefCell::new(action),
            errnum: Cell::new(0),
            error_handler: RefCell::new(None),
        }))
    }

    /// Create a detached wait around a callback
    pub fn new(cb: impl FnOnce() + 'static) -> Self {
        Self::with_action(WaitAction::Callback(Box::new(cb)))
    }

    /// Create a detached wait that resumes a stalled request
    pub fn continuation(continuation: Continuation) -> Self {
        Self::with_action(WaitAction::Continuation(continuation))
    }

    /// Number of queues currently holding this wait
    pub fn usecount(&self) -> usize {
        self.0.usecount.get()
    }

    /// True if the action is a request continuation
    pub fn is_continuation(&self) -> bool {
        matches!(*self.0.action.borrow(), WaitAction::Continuation(_))
    }

    /// True once the action has fired
    pub fn is_spent(&self) -> bool {
        matches!(*self.0.action.borrow(), WaitAction::Spent)
    }

    /// The request captured by a continuation, if any
    pub fn request(&self) -> Option<Request> {
        match &*self.0.action.borrow() {
            WaitAction::Continuation(c) => Some(c.request.clone()),
            _ => None,
        }
    }

    /// True if both handles refer to the same wait
    pub fn ptr_eq(&self, other: &Wait) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Record an error code and invoke the error handler, if one is set.
    ///
    /// Independent of queueing: the handler runs now whether or not the
    /// wait has fired or ever will.
    pub fn set_error(&self, errnum: i32) {
        self.0.errnum.set(errnum);
        let handler = self.0.error_handler.borrow_mut().take();
        if let Some(mut handler) = handler {
            handler(self, errnum);
            let mut slot = self.0.error_handler.borrow_mut();
            if slot.is_none() {
                *slot = Some(handler);
            }
        }
    }

    /// Last error code set, 0 if none
    pub fn error(&self) -> i32 {
        self.0.errnum.get()
    }

    /// Install the handler called by [`Wait::set_error`]
    pub fn set_error_handler(&self, handler: impl FnMut(&Wait, i32) + 'static) {
        *self.0.error_handler.borrow_mut() = Some(Box::new(handler));
    }

    fn acquire(&self) {
        self.0.usecount.set(self.0.usecount.get() + 1);
    }

    /// Drop one queue reference. Returns true if it was the last one.
    fn release(&self) -> bool {
        let count = self.0.usecount.get();
        debug_assert!(count > 0, "wait released more times than enqueued");
        if count == 0 {
            return false;
        }
        self.0.usecount.set(count - 1);
        count == 1
    }

    /// Disarm a continuation so it will not resume if still queued elsewhere
    fn disarm(&self) {
        if let WaitAction::Continuation(c) = &mut *self.0.action.borrow_mut() {
            c.handler = None;
        }
    }

    /// Drop the action without running it
    fn retire(&self) {
        let action = std::mem::replace(&mut *self.0.action.borrow_mut(), WaitAction::Spent);
        drop(action);
    }

    /// Release one reference and retire the action if it was the last
    fn release_unfired(&self) {
        if self.release() {
            self.retire();
        }
    }

    fn fire(&self) {
        let action = std::mem::replace(&mut *self.0.action.borrow_mut(), WaitAction::Spent);
        match action {
            WaitAction::Callback(cb) => cb(),
            WaitAction::Continuation(c) => c.resume(),
            WaitAction::Spent => {}
        }
    }

    /// Release one reference and fire if it was the last
    fn run_one(&self) {
        if self.release() {
            self.fire();
        }
    }
}

impl fmt::Debug for Wait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &*self.0.action.borrow() {
            WaitAction::Callback(_) => "callback",
            WaitAction::Continuation(_) => "continuation",
            WaitAction::Spent => "spent",
        };
        f.debug_struct("Wait")
            .field("usecount", &self.usecount())
            .field("action", &kind)
            .field("errnum", &self.error())
            .finish()
    }
}

#[derive(Default)]
struct WaitQueueInner {
    entries: VecDeque<Wait>,
    /// Entries whose action is a continuation
    pending: usize,
}

/// Insertion-ordered queue of waits
#[derive(Default)]
pub struct WaitQueue {
    inner: RefCell<WaitQueueInner>,
}

impl WaitQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `wait` and take a reference on it
    pub fn enqueue(&self, wait: &Wait) -> FleetResult<()> {
        if wait.is_spent() {
            return Err(FleetError::InvariantViolation(
                "cannot enqueue a wait that has already run".to_string(),
            ));
        }
        let mut inner = self.inner.borrow_mut();
        inner.entries.try_reserve(1)?;
        inner.entries.push_back(wait.clone());
        wait.acquire();
        if wait.is_continuation() {
            inner.pending += 1;
        }
        Ok(())
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    /// True if the queue has no entries
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }

    /// Number of entries holding a stalled request
    pub fn pending_count(&self) -> usize {
        self.inner.borrow().pending
    }

    /// Visit entries in insertion order.
    ///
    /// The visitor must not modify this queue.
    pub fn for_each(&self, mut visitor: impl FnMut(&Wait)) {
        for wait in self.inner.borrow().entries.iter() {
            visitor(wait);
        }
    }

    /// Detach every entry, then run each one.
    ///
    /// The whole entry set is moved out before any action fires, so actions
    /// may enqueue onto this queue again. If the snapshot cannot be
    /// allocated the queue is left exactly as it was.
    pub fn run_all(&self) -> FleetResult<()> {
        let detached = {
            let mut inner = self.inner.borrow_mut();
            if inner.entries.is_empty() {
                return Ok(());
            }
            let mut detached: Vec<Wait> = Vec::new();
            detached.try_reserve_exact(inner.entries.len())?;
            detached.extend(inner.entries.drain(..));
            inner.pending = 0;
            detached
        };
        debug!(count = detached.len(), "running wait queue");
        for wait in detached {
            wait.run_one();
        }
        Ok(())
    }

    /// Remove every continuation whose request matches `pred`.
    ///
    /// Removed continuations are disarmed first so a wait also held by
    /// another queue is never resumed. Returns the number of entries
    /// removed. If the removal set cannot be allocated nothing is removed.
    pub fn purge_matching(&self, mut pred: impl FnMut(&Request) -> bool) -> FleetResult<usize> {
        let candidates = {
            let inner = self.inner.borrow();
            let mut candidates: Vec<(Wait, Request)> = Vec::new();
            for wait in inner.entries.iter() {
                if let Some(req) = wait.request() {
                    candidates.try_reserve(1)?;
                    candidates.push((wait.clone(), req));
                }
            }
            candidates
        };
        let mut matched: Vec<Wait> = Vec::new();
        matched.try_reserve(candidates.len())?;
        matched.extend(
            candidates
                .into_iter()
                .filter(|(_, req)| pred(req))
                .map(|(wait, _)| wait),
        );
        if matched.is_empty() {
            return Ok(0);
        }

        let removed = {
            let mut inner = self.inner.borrow_mut();
            let before = inner.entries.len();
            inner
                .entries
                .retain(|w| !matched.iter().any(|m| m.ptr_eq(w)));
            let removed = before - inner.entries.len();
            inner.pending -= removed;
            removed
        };
        for wait in &matched {
            wait.disarm();
        }
        for wait in matched {
            wait.release_unfired();
        }
        debug!(count = removed, "purged stalled requests");
        Ok(removed)
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.pending = 0;
        for wait in inner.entries.drain(..) {
            wait.release_unfired();
        }
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("len", &self.len())
            .field("pending", &self.pending_count())
            .finish()
    }
}
