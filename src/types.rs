//! Core types shared across the monitor, the event log and the RPC layer

use serde::{Deserialize, Serialize};

/// Identifier of one execution target in the fleet, in `[0, size)`
pub type Rank = u32;

/// Group of ranks that are up
pub const GROUP_BROKER_ONLINE: &str = "broker.online";

/// Online group used when the systemd monitor gates node availability
pub const GROUP_SDMON_ONLINE: &str = "sdmon.online";

/// Group of ranks that are alive but not responding
pub const GROUP_BROKER_TORPID: &str = "broker.torpid";

/// RPC topic: wait until a given number of ranks are up
pub const TOPIC_WAITUP: &str = "monitor.waitup";

/// RPC topic: manually remove ranks from the up set
pub const TOPIC_FORCE_DOWN: &str = "monitor.force-down";

/// The two membership groups the monitor tracks.
///
/// Each group maps to a pair of event names posted when ranks join or
/// leave it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackedGroup {
    /// Reachable ranks
    Online,
    /// Unresponsive-but-alive ranks
    Torpid,
}

impl TrackedGroup {
    /// Event posted for ranks that joined the group
    pub fn join_event(&self) -> &'static str {
        match self {
            TrackedGroup::Online => "online",
            TrackedGroup::Torpid => "torpid",
        }
    }

    /// Event posted for ranks that left the group
    pub fn leave_event(&self) -> &'static str {
        match self {
            TrackedGroup::Online => "offline",
            TrackedGroup::Torpid => "lively",
        }
    }

    /// Name of the broker group backing this tracked group
    pub fn group_name(&self, systemd_enable: bool) -> &'static str {
        match self {
            TrackedGroup::Online if systemd_enable => GROUP_SDMON_ONLINE,
            TrackedGroup::Online => GROUP_BROKER_ONLINE,
            TrackedGroup::Torpid => GROUP_BROKER_TORPID,
        }
    }
}

impl std::fmt::Display for TrackedGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackedGroup::Online => write!(f, "online"),
            TrackedGroup::Torpid => write!(f, "torpid"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(TrackedGroup::Online.join_event(), "online");
        assert_eq!(TrackedGroup::Online.leave_event(), "offline");
        assert_eq!(TrackedGroup::Torpid.join_event(), "torpid");
        assert_eq!(TrackedGroup::Torpid.leave_event(), "lively");
    }

    #[test]
    fn test_group_names() {
        assert_eq!(TrackedGroup::Online.group_name(false), "broker.online");
        assert_eq!(TrackedGroup::Online.group_name(true), "sdmon.online");
        assert_eq!(TrackedGroup::Torpid.group_name(true), "broker.torpid");
    }
}
