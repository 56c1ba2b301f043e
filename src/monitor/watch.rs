//! Group subscription driver

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, error, warn};

use super::Monitor;
use crate::error::FleetError;
use crate::groups::{GroupHub, GroupSubscription};
use crate::idset::IdSet;
use crate::types::TrackedGroup;

/// Feed snapshots of `group` from `sub` into `monitor` until the
/// subscription is lost.
///
/// `on_first` runs once, after the first snapshot has been handled
/// (whether or not it applied cleanly), or when the watcher gives up
/// before ever seeing one. A snapshot that fails to decode or apply is
/// logged and the subscription re-armed for the next one. If the stream
/// ends, one immediate resubscription is attempted.
pub async fn watch_group(
    monitor: Rc<RefCell<Monitor>>,
    groups: Rc<GroupHub>,
    group: TrackedGroup,
    sub: GroupSubscription,
    mut on_first: Option<Box<dyn FnOnce()>>,
) {
    run(&monitor, &groups, group, sub, &mut on_first).await;
    if let Some(first) = on_first.take() {
        first();
    }
}

async fn run(
    monitor: &RefCell<Monitor>,
    groups: &GroupHub,
    group: TrackedGroup,
    mut sub: GroupSubscription,
    on_first: &mut Option<Box<dyn FnOnce()>>,
) {
    let name = monitor.borrow().group_name(group);
    debug!(group = name, "monitor: watching group");

    let mut resubscribed = false;
    loop {
        let members = match sub.next().await {
            Ok(members) => {
                resubscribed = false;
                members
            }
            Err(e) if resubscribed => {
                error!(group = name, error = %e, "monitor: giving up on group");
                return;
            }
            Err(e) => {
                warn!(group = name, error = %e, "monitor: group stream ended, resubscribing");
                match groups.subscribe(name) {
                    Ok(new_sub) => {
                        sub = new_sub;
                        resubscribed = true;
                        continue;
                    }
                    Err(e) => {
                        error!(group = name, error = %e, "monitor: error resubscribing to group");
                        return;
                    }
                }
            }
        };

        let result = IdSet::decode(&members)
            .map_err(FleetError::from)
            .and_then(|set| monitor.borrow_mut().apply_snapshot(group, set));
        if let Err(e) = result {
            error!(group = name, members = %members, error = %e, "monitor: error handling group update");
            sub.reset();
        }
        if let Some(first) = on_first.take() {
            first();
        }
    }
}
