//! In-process broker groups
//!
//! A [`GroupHub`] holds the current membership of named groups such as
//! `broker.online`. Subscribers receive full snapshots, never deltas, and
//! at most one update is outstanding per subscription: if membership
//! changes several times between reads, the subscriber sees only the
//! latest set.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{FleetError, FleetResult};
use crate::idset::IdSet;
use crate::types::Rank;

/// Registry of named rank groups
#[derive(Debug, Default)]
pub struct GroupHub {
    groups: RefCell<HashMap<String, watch::Sender<IdSet>>>,
    closed: RefCell<HashSet<String>>,
}

impl GroupHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    fn with_group<R>(&self, name: &str, f: impl FnOnce(&watch::Sender<IdSet>) -> R) -> R {
        self.closed.borrow_mut().remove(name);
        let mut groups = self.groups.borrow_mut();
        let tx = groups
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(IdSet::new()).0);
        f(tx)
    }

    /// Replace the membership of `name`
    pub fn update(&self, name: &str, members: IdSet) {
        debug!(group = name, members = %members, "group update");
        self.with_group(name, |tx| {
            tx.send_replace(members);
        });
    }

    /// Add `rank` to `name`
    pub fn join(&self, name: &str, rank: Rank) {
        self.with_group(name, |tx| {
            tx.send_if_modified(|set| {
                let changed = !set.test(rank);
                set.set(rank);
                changed
            });
        });
    }

    /// Remove `rank` from `name`
    pub fn leave(&self, name: &str, rank: Rank) {
        self.with_group(name, |tx| {
            tx.send_if_modified(|set| {
                let changed = set.test(rank);
                set.clear(rank);
                changed
            });
        });
    }

    /// Current membership of `name`
    pub fn members(&self, name: &str) -> IdSet {
        self.groups
            .borrow()
            .get(name)
            .map(|tx| tx.borrow().clone())
            .unwrap_or_default()
    }

    /// Subscribe to `name`. The first read returns the current membership.
    pub fn subscribe(&self, name: &str) -> FleetResult<GroupSubscription> {
        if self.closed.borrow().contains(name) {
            return Err(FleetError::UpstreamUnavailable(format!(
                "group {} is closed",
                name
            )));
        }
        let rx = self.with_group(name, |tx| tx.subscribe());
        Ok(GroupSubscription {
            name: name.to_string(),
            rx,
            primed: true,
        })
    }

    /// Close `name`. Subscribers fail on their next read and new
    /// subscriptions are refused until the group is updated again.
    pub fn close(&self, name: &str) {
        info!(group = name, "closing group");
        self.groups.borrow_mut().remove(name);
        self.closed.borrow_mut().insert(name.to_string());
    }

    /// Restart the channel behind `name`, keeping its membership.
    ///
    /// Existing subscribers see their stream end and must subscribe again.
    pub fn restart(&self, name: &str) {
        info!(group = name, "restarting group");
        let members = self.members(name);
        self.groups.borrow_mut().remove(name);
        self.update(name, members);
    }
}

/// Stream of full membership snapshots for one group
#[derive(Debug)]
pub struct GroupSubscription {
    name: String,
    rx: watch::Receiver<IdSet>,
    primed: bool,
}

impl GroupSubscription {
    /// Name of the subscribed group
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next snapshot, encoded as an idset string
    pub async fn next(&mut self) -> FleetResult<String> {
        if !std::mem::replace(&mut self.primed, false) {
            self.rx.changed().await.map_err(|_| {
                FleetError::UpstreamUnavailable(format!("{}: subscription ended", self.name))
            })?;
        }
        let members = self.rx.borrow_and_update().encode();
        Ok(members)
    }

    /// Re-arm after a failed update; the next read delivers the next
    /// full snapshot published after this call.
    pub fn reset(&mut self) {
        self.primed = false;
        let _ = self.rx.borrow_and_update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_read_is_current() {
        let hub = GroupHub::new();
        hub.join("broker.online", 0);
        hub.join("broker.online", 1);
        let mut sub = hub.subscribe("broker.online").unwrap();
        assert_eq!(sub.next().await.unwrap(), "0-1");
    }

    #[tokio::test]
    async fn test_updates_coalesce() {
        let hub = GroupHub::new();
        let mut sub = hub.subscribe("broker.online").unwrap();
        assert_eq!(sub.next().await.unwrap(), "");
        hub.join("broker.online", 0);
        hub.join("broker.online", 3);
        assert_eq!(sub.next().await.unwrap(), "0,3");
    }

    #[tokio::test]
    async fn test_close_ends_subscription() {
        let hub = GroupHub::new();
        let mut sub = hub.subscribe("broker.torpid").unwrap();
        sub.next().await.unwrap();
        hub.close("broker.torpid");
        assert!(matches!(
            sub.next().await,
            Err(FleetError::UpstreamUnavailable(_))
        ));
        assert!(hub.subscribe("broker.torpid").is_err());
    }

    #[tokio::test]
    async fn test_restart_keeps_members() {
        let hub = GroupHub::new();
        hub.update("broker.online", IdSet::decode("0-2").unwrap());
        let mut old = hub.subscribe("broker.online").unwrap();
        old.next().await.unwrap();
        hub.restart("broker.online");
        assert!(old.next().await.is_err());
        let mut sub = hub.subscribe("broker.online").unwrap();
        assert_eq!(sub.next().await.unwrap(), "0-2");
    }

    #[test]
    fn test_leave() {
        let hub = GroupHub::new();
        hub.update("g", IdSet::full(3));
        hub.leave("g", 1);
        assert_eq!(hub.members("g").encode(), "0,2");
    }
}
