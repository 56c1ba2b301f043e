//! Fleet membership monitor
//!
//! Tracks which ranks are up, torpid, down and lost, and posts an event to
//! the resource event log whenever a tracked group changes:
//!
//! - `online` / `offline` when ranks join or leave the online group
//! - `torpid` / `lively` when ranks join or leave the torpid group
//! - `restart` once at startup, with the full rank range, the initial
//!   online set and the host list
//!
//! Only the leader (rank 0) tracks membership. Other ranks build a stub
//! that answers the monitor RPCs with an error.
//!
//! Some synchronization notes:
//! - the initial online set in the restart event is normally empty, since
//!   the first group snapshot cannot arrive until the reactor runs.
//! - "up" means an `online` event has been posted for the rank. A rank can
//!   be in the broker group for a short while before that happens.
//! - `monitor.waitup` lets a caller wait until exactly N ranks are up.

pub mod watch;

pub use watch::watch_group;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::config::{MonitorConfig, ATTR_HOSTLIST, ATTR_RECOVERY_MODE};
use crate::error::{FleetError, FleetResult};
use crate::eventlog::{Durability, EventLog};
use crate::idset::IdSet;
use crate::resource::ResourceContext;
use crate::rpc::Request;
use crate::types::{Rank, TrackedGroup};

#[derive(Deserialize)]
struct WaitUpRequest {
    up: i64,
}

#[derive(Deserialize)]
struct ForceDownRequest {
    ranks: String,
}

struct MembershipState {
    up: IdSet,
    /// Bumped every time `up` is replaced
    up_generation: u64,
    torpid: IdSet,
    /// Ranks that went from up to not up and have not come back
    lost: IdSet,
    /// `down` as of `up_generation`
    down: RefCell<Option<(u64, IdSet)>>,
    waitup_requests: VecDeque<Request>,
}

impl MembershipState {
    fn set(&self, group: TrackedGroup) -> &IdSet {
        match group {
            TrackedGroup::Online => &self.up,
            TrackedGroup::Torpid => &self.torpid,
        }
    }

    /// Answer every pending waitup request whose count now matches
    fn notify_waitup(&mut self) {
        let upcount = self.up.count() as i64;
        self.waitup_requests.retain(|req| {
            let result = match req.unpack::<WaitUpRequest>() {
                Err(e) => req.respond_fleet_error(&e),
                Ok(want) if want.up == upcount => req.respond(Value::Null),
                Ok(_) => return true,
            };
            if let Err(e) = result {
                error!(error = %e, "error responding to monitor.waitup request");
            }
            false
        });
    }
}

/// Membership monitor for one resource module instance
pub struct Monitor {
    rank: Rank,
    size: u32,
    systemd_enable: bool,
    reslog: Rc<RefCell<dyn EventLog>>,
    watched: Vec<TrackedGroup>,
    state: Option<MembershipState>,
}

impl Monitor {
    /// Create the monitor and post the `restart` event.
    ///
    /// The rank count is the larger of the instance size and
    /// `inventory_size`. In recovery mode the instance may be smaller than
    /// the inventory, while with dynamically discovered resources the
    /// inventory is still empty at this point.
    pub fn create(
        ctx: &ResourceContext,
        inventory_size: u32,
        config: &MonitorConfig,
    ) -> FleetResult<Self> {
        let size = ctx.size.max(inventory_size);
        let mut monitor = Monitor {
            rank: ctx.rank,
            size,
            systemd_enable: config.systemd_enable,
            reslog: ctx.reslog.clone(),
            watched: Vec::new(),
            state: None,
        };
        if ctx.rank > 0 {
            debug!(rank = ctx.rank, "monitor: follower stub");
            return Ok(monitor);
        }

        let up = if config.force_up {
            IdSet::full(size)
        } else {
            IdSet::with_capacity(size)
        };
        monitor.state = Some(MembershipState {
            up,
            up_generation: 0,
            torpid: IdSet::with_capacity(size),
            lost: IdSet::with_capacity(size),
            down: RefCell::new(None),
            waitup_requests: VecDeque::new(),
        });
        if config.force_up {
            info!(size, "monitor: all ranks forced up");
        } else if ctx.attrs.get(ATTR_RECOVERY_MODE).is_some() {
            info!("monitor: recovery mode, not watching groups");
        } else {
            monitor.watched = vec![TrackedGroup::Online, TrackedGroup::Torpid];
        }

        let hostlist = ctx
            .attrs
            .get(ATTR_HOSTLIST)
            .ok_or_else(|| FleetError::Config(format!("{} attribute is not set", ATTR_HOSTLIST)))?;
        monitor.post_restart_event(hostlist)?;
        Ok(monitor)
    }

    fn post_restart_event(&self, hostlist: &str) -> FleetResult<()> {
        let online = self.up().map(IdSet::encode).unwrap_or_default();
        let mut context = Map::new();
        context.insert("ranks".to_string(), Value::String(IdSet::full(self.size).encode()));
        context.insert("online".to_string(), Value::String(online));
        context.insert("nodelist".to_string(), Value::String(hostlist.to_string()));
        self.reslog
            .borrow_mut()
            .append("restart", context, Durability::NoCommit)
    }

    /// Rank this monitor runs on
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of ranks tracked
    pub fn size(&self) -> u32 {
        self.size
    }

    /// True if this monitor tracks membership
    pub fn is_leader(&self) -> bool {
        self.state.is_some()
    }

    /// Groups that should be subscribed to
    pub fn watched_groups(&self) -> &[TrackedGroup] {
        &self.watched
    }

    /// Broker group name backing `group`
    pub fn group_name(&self, group: TrackedGroup) -> &'static str {
        group.group_name(self.systemd_enable)
    }

    /// Ranks currently up
    pub fn up(&self) -> Option<&IdSet> {
        self.state.as_ref().map(|s| &s.up)
    }

    /// Ranks currently torpid
    pub fn torpid(&self) -> Option<&IdSet> {
        self.state.as_ref().map(|s| &s.torpid)
    }

    /// Ranks that were up and then went away
    pub fn lost(&self) -> Option<&IdSet> {
        self.state.as_ref().map(|s| &s.lost)
    }

    /// All ranks that are not up
    pub fn down(&self) -> Option<IdSet> {
        let state = self.state.as_ref()?;
        let mut cache = state.down.borrow_mut();
        if let Some((generation, down)) = &*cache {
            if *generation == state.up_generation {
                return Some(down.clone());
            }
        }
        let mut down = IdSet::full(self.size);
        down.subtract(&state.up);
        *cache = Some((state.up_generation, down.clone()));
        Some(down)
    }

    /// Number of waitup requests still deferred
    pub fn pending_waitups(&self) -> usize {
        self.state
            .as_ref()
            .map(|s| s.waitup_requests.len())
            .unwrap_or(0)
    }

    fn leader_state(&mut self) -> FleetResult<&mut MembershipState> {
        self.state
            .as_mut()
            .ok_or_else(|| FleetError::protocol("this RPC only works on rank 0"))
    }

    /// Apply a new full snapshot of `group`.
    ///
    /// Posts join/leave events for the difference from the current set,
    /// then replaces it. If either event cannot be posted the current set
    /// is kept and the error returned.
    pub fn apply_snapshot(&mut self, group: TrackedGroup, members: IdSet) -> FleetResult<()> {
        let rank = self.rank;
        let size = self.size;
        let state = self.state.as_mut().ok_or_else(|| {
            FleetError::InvariantViolation(format!("rank {} does not track membership", rank))
        })?;
        if members.last().is_some_and(|id| id >= size) {
            warn!(%group, members = %members, size, "snapshot names ranks beyond instance size");
        }

        let old = state.set(group);
        let joined = members.difference(old);
        let left = old.difference(&members);
        post_event(&self.reslog, group.join_event(), &joined)?;
        post_event(&self.reslog, group.leave_event(), &left)?;

        // Only the online group feeds the lost set: ranks that were never
        // up are not lost, and torpid ranks are still up.
        if group == TrackedGroup::Online {
            state.lost.add(&left);
            state.lost.subtract(&joined);
        }
        debug!(%group, joined = %joined, left = %left, "membership updated");
        match group {
            TrackedGroup::Online => {
                state.up = members;
                state.up_generation += 1;
                state.notify_waitup();
            }
            TrackedGroup::Torpid => state.torpid = members,
        }
        Ok(())
    }

    /// Remove `ranks` from the up set as if they had gone offline.
    ///
    /// This is bookkeeping only. Connections to the removed ranks are left
    /// alone, so work already running there is not affected.
    pub fn force_down(&mut self, ranks: &str) -> FleetResult<()> {
        let mut up = self.leader_state()?.up.clone();
        up.decode_subtract(ranks)?;
        info!(ranks, "monitor: forcing ranks down");
        self.apply_snapshot(TrackedGroup::Online, up)
    }

    /// Handle `monitor.waitup {up}`
    pub fn handle_waitup(&mut self, req: &Request) {
        if let Err(e) = self.waitup(req) {
            if let Err(e) = req.respond_fleet_error(&e) {
                error!(error = %e, "error responding to monitor.waitup request");
            }
        }
    }

    fn waitup(&mut self, req: &Request) -> FleetResult<()> {
        let WaitUpRequest { up } = req.unpack()?;
        let size = self.size;
        let state = self.leader_state()?;
        if up < 0 || up > i64::from(size) {
            return Err(FleetError::protocol("up value is out of range"));
        }
        if state.up.count() as i64 != up {
            state.waitup_requests.try_reserve(1)?;
            state.waitup_requests.push_back(req.clone());
            debug!(up, sender = %req.sender(), "waitup deferred");
            return Ok(());
        }
        if let Err(e) = req.respond(Value::Null) {
            error!(error = %e, "error responding to monitor.waitup request");
        }
        Ok(())
    }

    /// Handle `monitor.force-down {ranks}`
    pub fn handle_force_down(&mut self, req: &Request) {
        let result = req
            .unpack::<ForceDownRequest>()
            .and_then(|fd| self.force_down(&fd.ranks));
        let sent = match result {
            Ok(()) => req.respond(Value::Null),
            Err(e @ FleetError::EventLog(_)) => {
                warn!(error = %e, "monitor.force-down failed");
                req.respond_error(e.errnum(), Some("monitor: error posting online/offline event"))
            }
            Err(e) => {
                warn!(error = %e, "monitor.force-down failed");
                req.respond_fleet_error(&e)
            }
        };
        if let Err(e) = sent {
            error!(error = %e, "error responding to monitor.force-down request");
        }
    }

    /// Drop deferred waitup requests from a disconnected client
    pub fn disconnect(&mut self, sender: &str) -> usize {
        let Some(state) = self.state.as_mut() else {
            return 0;
        };
        let before = state.waitup_requests.len();
        state.waitup_requests.retain(|req| req.sender() != sender);
        let removed = before - state.waitup_requests.len();
        if removed > 0 {
            debug!(sender, removed, "dropped waitup requests");
        }
        removed
    }
}

/// Post `name` with context `{idset}` unless `ids` is empty
fn post_event(reslog: &RefCell<dyn EventLog>, name: &str, ids: &IdSet) -> FleetResult<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let mut context = Map::new();
    context.insert("idset".to_string(), Value::String(ids.encode()));
    reslog
        .borrow_mut()
        .append(name, context, Durability::NoCommit)
        .inspect_err(|e| error!(event = name, error = %e, "monitor: error posting event"))
}
