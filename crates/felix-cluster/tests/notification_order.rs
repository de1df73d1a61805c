//! Integration tests for ordered cluster change delivery.
//!
//! # Purpose
//! Exercise the registry's notification path with concurrent producers and
//! listeners that raise further changes from inside their callbacks.
//!
//! # Key invariants
//! - Every listener sees the same total order of changes.
//! - The order respects each producer's own enqueue order.
//! - A change raised from a callback is delivered after the current one, by
//!   the same drain loop.
use felix_cluster::{
    BrokerStatus, ClusterChange, ClusterConfig, ClusterListener, ClusterRegistry,
    ClusteredBroker, RegistryVariant, UserData,
};
use felix_common::BrokerAddress;
use felix_common::ids::SessionId;
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::{Arc, Barrier, Weak};
use std::thread;
use std::time::Duration;

fn initialized_registry(peers: &str) -> Arc<ClusterRegistry> {
    let config = ClusterConfig {
        peers: peers.to_string(),
        ..ClusterConfig::default()
    };
    let registry = Arc::new(ClusterRegistry::new(config, RegistryVariant::StaticConfig));
    registry
        .initialize("a:1000".parse().expect("address"))
        .expect("initialize");
    registry
}

#[derive(Default)]
struct VersionLog {
    seen: Mutex<Vec<(String, u32)>>,
}

impl ClusterListener for VersionLog {
    fn broker_version_changed(&self, name: &str, _old: u32, new: u32) {
        self.seen.lock().push((name.to_string(), new));
    }
}

#[test]
fn concurrent_producers_share_one_total_order() {
    const THREADS: usize = 8;
    const PER_THREAD: u32 = 200;

    let registry = initialized_registry("");
    let first = Arc::new(VersionLog::default());
    let second = Arc::new(VersionLog::default());
    registry.add_listener(first.clone());
    registry.add_listener(second.clone());

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for n in 0..PER_THREAD {
                    registry.broker_changed(ClusterChange::VersionChanged {
                        name: format!("producer-{t}"),
                        old: n,
                        new: n + 1,
                    });
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("producer thread");
    }

    let first = first.seen.lock().clone();
    let second = second.seen.lock().clone();
    assert_eq!(first.len(), THREADS * PER_THREAD as usize);
    assert_eq!(first, second, "listeners observed different orders");

    // Each producer's changes arrive in the order it raised them.
    for t in 0..THREADS {
        let name = format!("producer-{t}");
        let versions: Vec<u32> = first
            .iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, v)| *v)
            .collect();
        let expected: Vec<u32> = (1..=PER_THREAD).collect();
        assert_eq!(versions, expected, "{name}");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Added(String),
    Status(String, BrokerStatus),
}

struct Journal {
    seen: Mutex<Vec<Seen>>,
}

impl Journal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }
}

impl ClusterListener for Journal {
    fn broker_added(&self, broker: &Arc<ClusteredBroker>, _session: Option<SessionId>) {
        self.seen.lock().push(Seen::Added(broker.name().to_string()));
    }

    fn broker_status_changed(
        &self,
        name: &str,
        _old: BrokerStatus,
        new: BrokerStatus,
        _session: Option<SessionId>,
        _user_data: Option<&UserData>,
    ) {
        self.seen.lock().push(Seen::Status(name.to_string(), new));
    }
}

// Raises a status change for every broker it hears about.
struct Escalating {
    registry: Weak<ClusterRegistry>,
    journal: Arc<Journal>,
}

impl ClusterListener for Escalating {
    fn broker_added(&self, broker: &Arc<ClusteredBroker>, session: Option<SessionId>) {
        self.journal.broker_added(broker, session);
        if let Some(registry) = self.registry.upgrade() {
            registry.broker_changed(ClusterChange::StatusChanged {
                name: broker.name().to_string(),
                old: BrokerStatus::UNKNOWN,
                new: BrokerStatus::ACTIVATE_BROKER,
                session,
                user_data: None,
            });
        }
        // Still inside the callback: the escalation must not be visible yet.
        let seen = self.journal.seen.lock();
        assert!(matches!(seen.last(), Some(Seen::Added(_))));
    }
}

#[test]
fn reentrant_change_follows_the_one_that_raised_it() {
    let registry = initialized_registry("b:1001");
    let broker = registry
        .get_known_brokers(false)
        .expect("known")
        .into_iter()
        .find(|b| !b.is_local())
        .expect("peer");

    let inner = Journal::new();
    let observer = Journal::new();
    registry.add_listener(Arc::new(Escalating {
        registry: Arc::downgrade(&registry),
        journal: inner.clone(),
    }));
    registry.add_listener(observer.clone());

    registry.broker_changed(ClusterChange::Added {
        broker: Arc::clone(&broker),
        session: broker.session(),
    });

    let expected = vec![
        Seen::Added(broker.name().to_string()),
        Seen::Status(broker.name().to_string(), BrokerStatus::ACTIVATE_BROKER),
    ];
    assert_eq!(*observer.seen.lock(), expected);
    assert_eq!(inner.seen.lock().len(), 1);
}

#[test]
fn listener_added_before_initialize_sees_membership() {
    let config = ClusterConfig {
        peers: "b:1001,c:1002".to_string(),
        ..ClusterConfig::default()
    };
    let registry = ClusterRegistry::new(config, RegistryVariant::StaticConfig);
    let journal = Journal::new();
    registry.add_listener(journal.clone());

    let local = registry
        .initialize("a:1000".parse().expect("address"))
        .expect("initialize");

    let seen = journal.seen.lock();
    let added: Vec<_> = seen
        .iter()
        .filter_map(|s| match s {
            Seen::Added(name) => Some(name.clone()),
            Seen::Status(..) => None,
        })
        .collect();
    assert_eq!(added.len(), 3);
    assert_eq!(added[0], local);
    assert_eq!(
        seen[1],
        Seen::Status(local.clone(), BrokerStatus::ACTIVATE_BROKER)
    );
}

#[test]
fn removed_listener_stops_receiving() {
    let registry = initialized_registry("");
    let log = Arc::new(VersionLog::default());
    let handle: Arc<dyn ClusterListener> = log.clone();
    registry.add_listener(handle.clone());

    registry.broker_changed(ClusterChange::VersionChanged {
        name: "b".to_string(),
        old: 0,
        new: 1,
    });
    assert!(registry.remove_listener(&handle));
    assert!(!registry.remove_listener(&handle));
    registry.broker_changed(ClusterChange::VersionChanged {
        name: "b".to_string(),
        old: 1,
        new: 2,
    });

    assert_eq!(*log.seen.lock(), vec![("b".to_string(), 1)]);
}

struct FollowsAddress {
    registry: Weak<ClusterRegistry>,
    target: BrokerAddress,
    moves: Mutex<Vec<String>>,
}

impl ClusterListener for FollowsAddress {
    fn broker_address_changed(&self, _name: &str, _old: &BrokerAddress, new: &BrokerAddress) {
        self.moves.lock().push(new.to_string());
        if *new == self.target {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry
                .set_local_address(self.target.clone())
                .expect("move from callback");
        }
    }
}

#[test]
fn local_address_can_move_from_a_listener() {
    let registry = initialized_registry("");
    let listener = Arc::new(FollowsAddress {
        registry: Arc::downgrade(&registry),
        target: "a:3000".parse().expect("address"),
        moves: Mutex::new(Vec::new()),
    });
    registry.add_listener(listener.clone());

    let (done_tx, done_rx) = mpsc::channel();
    let mover = Arc::clone(&registry);
    thread::spawn(move || {
        let result = mover.set_local_address("a:2000".parse().expect("address"));
        let _ = done_tx.send(result.is_ok());
    });
    let finished = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("set_local_address returned");
    assert!(finished);

    assert_eq!(
        registry.local_address().expect("address"),
        "a:3000".parse::<BrokerAddress>().expect("address")
    );
    assert_eq!(
        *listener.moves.lock(),
        vec!["mq://a:2000/".to_string(), "mq://a:3000/".to_string()]
    );
}

struct ReentersOnAdd {
    registry: Weak<ClusterRegistry>,
    names: Mutex<Vec<String>>,
}

impl ClusterListener for ReentersOnAdd {
    fn broker_added(&self, _broker: &Arc<ClusteredBroker>, _session: Option<SessionId>) {
        if let Some(registry) = self.registry.upgrade() {
            let name = registry
                .set_local_address("a:1000".parse().expect("address"))
                .expect("reenter initialize");
            self.names.lock().push(name);
        }
    }
}

#[test]
fn initialize_can_be_reentered_from_added_callback() {
    let config = ClusterConfig {
        peers: "b:1001,c:1002".to_string(),
        ..ClusterConfig::default()
    };
    let registry = Arc::new(ClusterRegistry::new(config, RegistryVariant::StaticConfig));
    let listener = Arc::new(ReentersOnAdd {
        registry: Arc::downgrade(&registry),
        names: Mutex::new(Vec::new()),
    });
    registry.add_listener(listener.clone());

    let (done_tx, done_rx) = mpsc::channel();
    let initializer = Arc::clone(&registry);
    thread::spawn(move || {
        let result = initializer.initialize("a:1000".parse().expect("address"));
        let _ = done_tx.send(result.ok());
    });
    let local = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("initialize returned")
        .expect("initialize succeeded");

    assert_eq!(*listener.names.lock(), vec![local.clone(); 3]);
    assert_eq!(registry.known_broker_count().expect("count"), 3);
}
