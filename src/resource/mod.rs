//! Resource module
//!
//! Owns the [`Monitor`], registers its RPC handlers and runs one watcher
//! task per tracked group. Everything here is single threaded: the module
//! must be loaded from inside a [`tokio::task::LocalSet`].

use std::cell::RefCell;
use std::rc::Rc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{AttrStore, MonitorConfig, ATTR_RANK, ATTR_SIZE};
use crate::error::{FleetError, FleetResult};
use crate::eventlog::EventLog;
use crate::groups::GroupHub;
use crate::monitor::{watch_group, Monitor};
use crate::rpc::{HandlerTable, Request};
use crate::types::{Rank, TrackedGroup, TOPIC_FORCE_DOWN, TOPIC_WAITUP};

/// Everything the monitor needs from its host
#[derive(Clone)]
pub struct ResourceContext {
    /// Rank of this process
    pub rank: Rank,
    /// Instance size
    pub size: u32,
    /// Broker attributes
    pub attrs: Rc<dyn AttrStore>,
    /// Resource event log
    pub reslog: Rc<RefCell<dyn EventLog>>,
    /// Broker groups
    pub groups: Rc<GroupHub>,
}

impl ResourceContext {
    /// Build a context, reading rank and size from `attrs`
    pub fn from_attrs(
        attrs: Rc<dyn AttrStore>,
        reslog: Rc<RefCell<dyn EventLog>>,
        groups: Rc<GroupHub>,
    ) -> FleetResult<Self> {
        let rank = parse_attr(attrs.as_ref(), ATTR_RANK)?;
        let size = parse_attr(attrs.as_ref(), ATTR_SIZE)?;
        Ok(Self {
            rank,
            size,
            attrs,
            reslog,
            groups,
        })
    }
}

fn parse_attr(attrs: &dyn AttrStore, key: &str) -> FleetResult<u32> {
    let value = attrs
        .get(key)
        .ok_or_else(|| FleetError::Config(format!("{} attribute is not set", key)))?;
    value
        .parse()
        .map_err(|e| FleetError::Config(format!("{} attribute '{}': {}", key, value, e)))
}

/// A loaded resource module
pub struct ResourceModule {
    ctx: ResourceContext,
    monitor: Rc<RefCell<Monitor>>,
    handlers: Rc<HandlerTable>,
    watchers: Vec<JoinHandle<()>>,
}

impl ResourceModule {
    /// Create the monitor, register handlers and start group watchers.
    ///
    /// Requests are stalled until the first online snapshot has been
    /// processed. When no groups are watched the module is ready at once.
    /// Fails with [`FleetError::UpstreamUnavailable`] if a watched group
    /// cannot be subscribed to.
    pub fn load(
        ctx: ResourceContext,
        inventory_size: u32,
        config: &MonitorConfig,
    ) -> FleetResult<Self> {
        let monitor = Rc::new(RefCell::new(Monitor::create(&ctx, inventory_size, config)?));
        let watched = monitor.borrow().watched_groups().to_vec();
        let mut subscriptions = Vec::with_capacity(watched.len());
        for group in &watched {
            let name = monitor.borrow().group_name(*group);
            let sub = ctx.groups.subscribe(name).inspect_err(|e| {
                error!(group = name, error = %e, "monitor: error subscribing to group");
            })?;
            subscriptions.push((*group, sub));
        }

        let handlers = Rc::new(HandlerTable::new());

        let m = monitor.clone();
        handlers.register(
            TOPIC_WAITUP,
            Rc::new(move |req: &Request| m.borrow_mut().handle_waitup(req)),
        );
        let m = monitor.clone();
        handlers.register(
            TOPIC_FORCE_DOWN,
            Rc::new(move |req: &Request| m.borrow_mut().handle_force_down(req)),
        );

        let mut watchers = Vec::with_capacity(subscriptions.len());
        for (group, sub) in subscriptions {
            let on_first: Option<Box<dyn FnOnce()>> = match group {
                TrackedGroup::Online => {
                    let handlers = handlers.clone();
                    Some(Box::new(move || {
                        if let Err(e) = handlers.set_ready() {
                            error!(error = %e, "error releasing stalled requests");
                        }
                    }))
                }
                TrackedGroup::Torpid => None,
            };
            watchers.push(tokio::task::spawn_local(watch_group(
                monitor.clone(),
                ctx.groups.clone(),
                group,
                sub,
                on_first,
            )));
        }
        if !watched.contains(&TrackedGroup::Online) {
            handlers.set_ready()?;
        }

        info!(
            rank = ctx.rank,
            size = monitor.borrow().size(),
            watchers = watchers.len(),
            "resource module loaded"
        );
        Ok(Self {
            ctx,
            monitor,
            handlers,
            watchers,
        })
    }

    /// Dispatch a request to the monitor
    pub fn handle(&self, req: &Request) {
        if let Err(e) = self.handlers.dispatch(req) {
            error!(topic = %req.topic(), error = %e, "error dispatching request");
            if let Err(e) = req.respond_fleet_error(&e) {
                error!(topic = %req.topic(), error = %e, "error responding to request");
            }
        }
    }

    /// Forget every outstanding request from `sender`
    pub fn disconnect(&self, sender: &str) -> FleetResult<usize> {
        let stalled = self.handlers.disconnect(sender)?;
        let deferred = self.monitor.borrow_mut().disconnect(sender);
        Ok(stalled + deferred)
    }

    /// True once requests are no longer stalled
    pub fn is_ready(&self) -> bool {
        self.handlers.is_ready()
    }

    /// The monitor
    pub fn monitor(&self) -> Rc<RefCell<Monitor>> {
        self.monitor.clone()
    }

    /// The context the module was loaded with
    pub fn context(&self) -> &ResourceContext {
        &self.ctx
    }

    /// Stop watchers, unregister handlers and flush the event log
    pub fn unload(self) -> FleetResult<()> {
        for watcher in &self.watchers {
            watcher.abort();
        }
        self.handlers.unregister(TOPIC_WAITUP);
        self.handlers.unregister(TOPIC_FORCE_DOWN);
        info!(rank = self.ctx.rank, "resource module unloaded");
        self.ctx.reslog.borrow_mut().flush()
    }
}
