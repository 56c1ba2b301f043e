//! Membership scenarios for the fleet monitor
//!
//! Drives the monitor directly with group snapshots and RPCs, and checks
//! the resulting sets, event log and responses.

use std::cell::RefCell;
use std::rc::Rc;

use fleetmon::config::{Attributes, MonitorConfig, ATTR_HOSTLIST};
use fleetmon::eventlog::MemoryEventLog;
use fleetmon::groups::GroupHub;
use fleetmon::idset::IdSet;
use fleetmon::monitor::Monitor;
use fleetmon::resource::ResourceContext;
use fleetmon::rpc::Request;
use fleetmon::types::{TrackedGroup, TOPIC_FORCE_DOWN, TOPIC_WAITUP};
use serde_json::{json, Value};

struct Fixture {
    monitor: Monitor,
    log: Rc<RefCell<MemoryEventLog>>,
}

impl Fixture {
    fn new(size: u32) -> Self {
        let log = Rc::new(RefCell::new(MemoryEventLog::new()));
        let mut attrs = Attributes::new();
        attrs.set(ATTR_HOSTLIST, "node[0-3]");
        let ctx = ResourceContext {
            rank: 0,
            size,
            attrs: Rc::new(attrs),
            reslog: log.clone(),
            groups: Rc::new(GroupHub::new()),
        };
        let monitor = Monitor::create(&ctx, 0, &MonitorConfig::default()).unwrap();
        log.borrow_mut().clear();
        Fixture { monitor, log }
    }

    fn online(&mut self, members: &str) {
        self.monitor
            .apply_snapshot(TrackedGroup::Online, IdSet::decode(members).unwrap())
            .unwrap();
    }

    /// Events posted since the last call, as `name idset`
    fn take_events(&self) -> Vec<String> {
        let mut log = self.log.borrow_mut();
        let events = log
            .events()
            .iter()
            .map(|e| format!("{} {}", e.name, e.context_str("idset").unwrap_or("")))
            .collect();
        log.clear();
        events
    }
}

#[test]
fn test_online_offline_lost_cycle() {
    let mut fx = Fixture::new(4);

    fx.online("0-1");
    assert_eq!(fx.take_events(), vec!["online 0-1"]);
    assert_eq!(fx.monitor.down().unwrap().encode(), "2-3");
    assert!(fx.monitor.lost().unwrap().is_empty());

    fx.online("1");
    assert_eq!(fx.take_events(), vec!["offline 0"]);
    assert_eq!(fx.monitor.lost().unwrap().encode(), "0");
    assert_eq!(fx.monitor.down().unwrap().encode(), "0,2-3");

    fx.online("0-1");
    assert_eq!(fx.take_events(), vec!["online 0"]);
    assert!(fx.monitor.lost().unwrap().is_empty());
    assert_eq!(fx.monitor.down().unwrap().encode(), "2-3");
}

#[test]
fn test_join_and_leave_in_one_snapshot() {
    let mut fx = Fixture::new(4);
    fx.online("0-1");
    fx.take_events();

    fx.online("1-2");
    assert_eq!(fx.take_events(), vec!["online 2", "offline 0"]);
    assert_eq!(fx.monitor.lost().unwrap().encode(), "0");
}

#[test]
fn test_torpid_lively() {
    let mut fx = Fixture::new(4);
    fx.monitor
        .apply_snapshot(TrackedGroup::Torpid, IdSet::decode("3").unwrap())
        .unwrap();
    fx.monitor
        .apply_snapshot(TrackedGroup::Torpid, IdSet::new())
        .unwrap();
    assert_eq!(fx.take_events(), vec!["torpid 3", "lively 3"]);
    assert!(fx.monitor.lost().unwrap().is_empty());
}

#[test]
fn test_waitup_deferred_until_count_matches() {
    let mut fx = Fixture::new(4);
    fx.online("1");

    let (req, mut rx) = Request::new(TOPIC_WAITUP, "client", json!({"up": 2}));
    fx.monitor.handle_waitup(&req);
    assert!(rx.try_recv().is_err());
    assert_eq!(fx.monitor.pending_waitups(), 1);

    fx.online("0-1");
    assert_eq!(rx.try_recv().unwrap(), Ok(Value::Null));
    assert_eq!(fx.monitor.pending_waitups(), 0);
}

#[test]
fn test_waitup_resolves_on_exact_count_only() {
    let mut fx = Fixture::new(4);
    let (req, mut rx) = Request::new(TOPIC_WAITUP, "client", json!({"up": 1}));
    fx.monitor.handle_waitup(&req);

    fx.online("0-2");
    assert!(rx.try_recv().is_err());
    fx.online("2");
    assert_eq!(rx.try_recv().unwrap(), Ok(Value::Null));
}

#[test]
fn test_force_down() {
    let mut fx = Fixture::new(4);
    fx.online("0-1");
    fx.take_events();

    let (req, mut rx) = Request::new(TOPIC_FORCE_DOWN, "admin", json!({"ranks": "1"}));
    fx.monitor.handle_force_down(&req);
    assert_eq!(rx.try_recv().unwrap(), Ok(Value::Null));
    assert_eq!(fx.take_events(), vec!["offline 1"]);
    assert_eq!(fx.monitor.up().unwrap().encode(), "0");
    assert!(fx.monitor.lost().unwrap().test(1));
}

#[test]
fn test_force_down_resolves_waitup() {
    let mut fx = Fixture::new(4);
    fx.online("0-2");
    let (waitup, mut waitup_rx) = Request::new(TOPIC_WAITUP, "client", json!({"up": 1}));
    fx.monitor.handle_waitup(&waitup);

    fx.monitor.force_down("[1-2]").unwrap();
    assert_eq!(waitup_rx.try_recv().unwrap(), Ok(Value::Null));
}

#[test]
fn test_force_down_log_failure_keeps_state() {
    let mut fx = Fixture::new(4);
    fx.online("0-1");
    fx.log.borrow_mut().set_fail_appends(true);

    let (req, mut rx) = Request::new(TOPIC_FORCE_DOWN, "admin", json!({"ranks": "0"}));
    fx.monitor.handle_force_down(&req);
    let err = rx.try_recv().unwrap().unwrap_err();
    assert_eq!(
        err.errstr.as_deref(),
        Some("monitor: error posting online/offline event")
    );
    assert_eq!(fx.monitor.up().unwrap().encode(), "0-1");
}

#[test]
fn test_force_down_huge_range_is_clamped() {
    let mut fx = Fixture::new(4);
    fx.online("0-3");
    fx.take_events();

    let (req, mut rx) =
        Request::new(TOPIC_FORCE_DOWN, "admin", json!({"ranks": "3-400000000,4294967295"}));
    fx.monitor.handle_force_down(&req);
    assert_eq!(rx.try_recv().unwrap(), Ok(Value::Null));
    assert_eq!(fx.take_events(), vec!["offline 3"]);
    assert_eq!(fx.monitor.up().unwrap().encode(), "0-2");
    assert_eq!(fx.monitor.down().unwrap().encode(), "3");
}
