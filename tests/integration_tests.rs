//! Integration tests for the race session lifecycle
//!
//! These tests drive the session manager the way the transport does and
//! check what every participant gets to see.

use assert_approx_eq::assert_approx_eq;
use server::broadcast::BroadcastGateway;
use server::manager::{ManagerConfig, SessionManager};
use server::store::{MemoryStore, SessionStore};
use server::text::RandomTextPool;
use server::utils::ManualClock;
use shared::{ConnectionId, Pin, RaceError, RaceStatus, ServerEvent};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

const PASSAGE: &str = "the quick brown fox";
const T0: u64 = 1_700_000_000_000;

struct Harness {
    manager: Arc<SessionManager>,
    clock: Arc<ManualClock>,
    events: mpsc::UnboundedReceiver<(ConnectionId, ServerEvent)>,
}

impl Harness {
    fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), ManagerConfig::default())
    }

    fn with_store(store: Arc<dyn SessionStore>, config: ManagerConfig) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let clock = Arc::new(ManualClock::new(T0));
        let manager = SessionManager::new(
            store,
            Arc::new(BroadcastGateway::new(Arc::new(tx))),
            Arc::new(RandomTextPool::new(vec![PASSAGE.to_string()])),
            clock.clone(),
            config,
        );
        Self {
            manager: Arc::new(manager),
            clock,
            events,
        }
    }

    fn drain(&mut self) -> Vec<(ConnectionId, ServerEvent)> {
        let mut seen = Vec::new();
        while let Ok(delivery) = self.events.try_recv() {
            seen.push(delivery);
        }
        seen
    }

    fn drain_names(&mut self) -> Vec<(ConnectionId, &'static str)> {
        self.drain()
            .into_iter()
            .map(|(connection, event)| (connection, event.name()))
            .collect()
    }

    async fn lobby(&mut self, host: ConnectionId, racers: &[(ConnectionId, &str)]) -> Pin {
        let pin = self.manager.create_race(host).await.unwrap().pin;
        for (id, name) in racers {
            self.manager.join_race(&pin, name, *id).await.unwrap();
        }
        self.drain();
        pin
    }
}

/// LIFECYCLE SCENARIO TESTS
mod scenario_tests {
    use super::*;

    /// A hosts, Bob races, the host joins its own race too so the race is
    /// still open after Bob finishes. The host leaving closes it for Bob.
    #[tokio::test]
    async fn full_race_lifecycle() {
        const A: ConnectionId = 1;
        const B: ConnectionId = 2;
        let mut h = Harness::new();

        let created = h.manager.create_race(A).await.unwrap();
        let pin = created.pin.clone();
        assert_eq!(created.host_id, A);
        assert_eq!(h.drain_names(), vec![(A, "race-created")]);

        let joined = h.manager.join_race(&pin, "Bob", B).await.unwrap();
        assert_eq!(joined.pin, pin);
        assert_eq!(joined.host_id, A);
        assert_eq!(joined.player.id, B);
        assert_eq!(joined.player.name, "Bob");
        assert_approx_eq!(joined.player.progress, 0.0);
        assert_approx_eq!(joined.player.wpm, 0.0);
        assert_approx_eq!(joined.player.accuracy, 100.0);
        assert!(!joined.player.finished);
        assert_eq!(joined.players, vec![joined.player.clone()]);

        let events = h.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], (B, ServerEvent::JoinedRace(joined.clone())));
        match &events[1] {
            (A, ServerEvent::PlayerJoined { players, player, .. }) => {
                assert_eq!(players.len(), 1);
                assert_eq!(player.name, "Bob");
            }
            other => panic!("Unexpected delivery {:?}", other),
        }

        h.manager.join_race(&pin, "Host", A).await.unwrap();
        h.drain();

        let started = h.manager.start_race(&pin, A).await.unwrap();
        assert_eq!(started.text, PASSAGE);
        assert_eq!(started.start_time, T0);
        let events = h.drain();
        assert_eq!(
            events,
            vec![
                (A, ServerEvent::RaceStarted(started.clone())),
                (B, ServerEvent::RaceStarted(started.clone())),
            ]
        );

        h.clock.advance(5_000);
        h.manager.progress_update(&pin, B, 0.5, 40.0, 95.0).await;
        let events = h.drain();
        assert_eq!(events.len(), 2);
        for (_, event) in &events {
            match event {
                ServerEvent::ProgressBroadcast { players, .. } => {
                    let bob = players.iter().find(|p| p.id == B).unwrap();
                    assert_approx_eq!(bob.progress, 0.5);
                    assert_approx_eq!(bob.wpm, 40.0);
                    assert_approx_eq!(bob.accuracy, 95.0);
                }
                other => panic!("Unexpected event {:?}", other),
            }
        }

        h.clock.advance(7_000);
        let board = h.manager.finish_race(&pin, B, 60.0, 98.0).await.unwrap();
        assert_eq!(board.leaderboard.len(), 1);
        assert_eq!(board.leaderboard[0].id, B);
        assert_eq!(board.leaderboard[0].finish_time_ms, Some(12_000));
        assert_approx_eq!(board.leaderboard[0].wpm, 60.0);
        assert_eq!(
            h.drain_names(),
            vec![(A, "leaderboard-update"), (B, "leaderboard-update")]
        );

        h.manager.handle_disconnect(A).await.unwrap();
        let names = h.drain_names();
        assert!(names.contains(&(B, "race-closed")));
        assert!(names.iter().all(|(to, _)| *to == B));

        assert_eq!(h.manager.start_race(&pin, A).await, Err(RaceError::NotFound));
        assert_eq!(
            h.manager.join_race(&pin, "Cid", 3).await,
            Err(RaceError::NotFound)
        );
        assert_eq!(
            h.manager.finish_race(&pin, B, 1.0, 1.0).await,
            Err(RaceError::NotFound)
        );
    }

    /// A host who never joins watches without ever being ranked.
    #[tokio::test]
    async fn host_is_a_spectator_unless_joined() {
        let mut h = Harness::new();
        let pin = h.lobby(1, &[(2, "Bob")]).await;

        h.manager.start_race(&pin, 1).await.unwrap();
        h.manager.progress_update(&pin, 2, 0.3, 20.0, 99.0).await;
        let events = h.drain();
        let progress = events
            .iter()
            .find_map(|(_, e)| match e {
                ServerEvent::ProgressBroadcast { players, .. } => Some(players.clone()),
                _ => None,
            })
            .unwrap();
        assert!(progress.iter().all(|p| p.id != 1));

        // Host progress is dropped silently.
        h.manager.progress_update(&pin, 1, 0.9, 99.0, 99.0).await;
        assert!(h.drain().is_empty());
        assert_eq!(
            h.manager.finish_race(&pin, 1, 99.0, 99.0).await,
            Err(RaceError::NotMember)
        );

        // The only racer finishing completes the race.
        let board = h.manager.finish_race(&pin, 2, 50.0, 97.0).await.unwrap();
        assert_eq!(board.leaderboard.len(), 1);
        assert_eq!(
            h.drain_names(),
            vec![
                (1, "leaderboard-update"),
                (2, "leaderboard-update"),
                (1, "race-finished"),
                (2, "race-finished"),
            ]
        );
        let race = h.manager.race(&pin).await.unwrap().unwrap();
        assert_eq!(race.status, RaceStatus::Finished);
    }
}

/// RACE RULE TESTS
mod rule_tests {
    use super::*;

    #[tokio::test]
    async fn join_rejected_after_start() {
        let mut h = Harness::new();
        let pin = h.lobby(1, &[(2, "Bob")]).await;
        h.manager.start_race(&pin, 1).await.unwrap();

        for id in 3..8 {
            let result = h.manager.join_race(&pin, "Late", id).await;
            assert!(matches!(result, Err(RaceError::InvalidState(_))));
            assert_eq!(h.manager.registry().lookup(id).await, None);
        }
        assert_eq!(h.manager.race(&pin).await.unwrap().unwrap().players.len(), 1);
    }

    #[tokio::test]
    async fn leaderboard_orders_by_time_then_join_order() {
        let mut h = Harness::new();
        let pin = h.lobby(1, &[(2, "Ann"), (3, "Bea"), (4, "Cal"), (5, "Dee")]).await;
        h.manager.start_race(&pin, 1).await.unwrap();

        h.clock.advance(10_000);
        h.manager.finish_race(&pin, 4, 50.0, 95.0).await.unwrap();
        h.clock.advance(2_000);
        // Same instant, finished in reverse join order.
        h.manager.finish_race(&pin, 3, 45.0, 95.0).await.unwrap();
        let board = h.manager.finish_race(&pin, 2, 45.0, 95.0).await.unwrap();

        let order: Vec<ConnectionId> = board.leaderboard.iter().map(|p| p.id).collect();
        assert_eq!(order, vec![4, 2, 3]);
        let times: Vec<u64> = board
            .leaderboard
            .iter()
            .map(|p| p.finish_time_ms.unwrap())
            .collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));

        let err = assert_err!(h.manager.finish_race(&pin, 2, 45.0, 95.0).await);
        assert_eq!(err, RaceError::AlreadyDone);
        assert_eq!(
            h.manager.finish_race(&pin, 99, 45.0, 95.0).await,
            Err(RaceError::NotMember)
        );
    }

    #[tokio::test]
    async fn finish_requires_running_race() {
        let mut h = Harness::new();
        let pin = h.lobby(1, &[(2, "Bob")]).await;

        assert!(matches!(
            h.manager.finish_race(&pin, 2, 10.0, 10.0).await,
            Err(RaceError::InvalidState(_))
        ));
        assert_eq!(
            h.manager
                .finish_race(&"999999".parse().unwrap(), 2, 10.0, 10.0)
                .await,
            Err(RaceError::NotFound)
        );
    }

    #[tokio::test]
    async fn race_completes_when_straggler_leaves() {
        let mut h = Harness::new();
        let pin = h.lobby(1, &[(2, "Bob"), (3, "Cid")]).await;
        h.manager.start_race(&pin, 1).await.unwrap();
        h.drain();

        h.clock.advance(3_000);
        h.manager.finish_race(&pin, 2, 70.0, 99.0).await.unwrap();
        let names = h.drain_names();
        assert!(!names.iter().any(|(_, n)| *n == "race-finished"));

        h.manager.handle_disconnect(3).await.unwrap();
        let events = h.drain();
        let names: Vec<_> = events.iter().map(|(to, e)| (*to, e.name())).collect();
        assert_eq!(
            names,
            vec![
                (1, "player-left"),
                (2, "player-left"),
                (1, "race-finished"),
                (2, "race-finished"),
            ]
        );
        match &events[2].1 {
            ServerEvent::RaceFinished(board) => {
                assert_eq!(board.leaderboard.len(), 1);
                assert_eq!(board.leaderboard[0].id, 2);
            }
            other => panic!("Unexpected event {:?}", other),
        }

        let race = h.manager.race(&pin).await.unwrap().unwrap();
        assert_eq!(race.status, RaceStatus::Finished);
    }

    #[tokio::test]
    async fn host_disconnect_is_terminal() {
        let mut h = Harness::new();
        let pin = h.lobby(1, &[(2, "Bob"), (3, "Cid")]).await;
        h.manager.start_race(&pin, 1).await.unwrap();
        h.drain();

        h.manager.handle_disconnect(1).await.unwrap();
        let closed: Vec<ConnectionId> = h
            .drain()
            .into_iter()
            .filter(|(_, e)| matches!(e, ServerEvent::RaceClosed { .. }))
            .map(|(to, _)| to)
            .collect();
        assert_eq!(closed, vec![2, 3]);

        assert_eq!(h.manager.race(&pin).await.unwrap(), None);
        assert_eq!(h.manager.registry().lookup(2).await, None);
        assert_eq!(h.manager.registry().lookup(3).await, None);
        assert_eq!(h.manager.start_race(&pin, 1).await, Err(RaceError::NotFound));
        assert_eq!(
            h.manager.finish_race(&pin, 2, 1.0, 1.0).await,
            Err(RaceError::NotFound)
        );
        assert_eq!(
            h.manager.join_race(&pin, "Dee", 4).await,
            Err(RaceError::NotFound)
        );

        // Later departures do not close it again.
        h.manager.handle_disconnect(2).await.unwrap();
        h.manager.handle_disconnect(3).await.unwrap();
        assert!(h.drain().is_empty());

        // Former members are free to race elsewhere.
        let other = assert_ok!(h.manager.create_race(2).await);
        assert_eq!(other.host_id, 2);
    }
}

/// CONCURRENCY TESTS
mod concurrency_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_get_distinct_pins() {
        let h = Harness::new();

        let handles: Vec<_> = (1..=200)
            .map(|id| {
                let manager = Arc::clone(&h.manager);
                tokio::spawn(async move { manager.create_race(id).await })
            })
            .collect();

        let mut pins = HashSet::new();
        for handle in handles {
            let created = handle.await.unwrap().unwrap();
            assert!(pins.insert(created.pin));
        }
        assert_eq!(pins.len(), 200);
    }

    /// Pins are claimed in the shared store, so two processes drawing at
    /// once never hand out the same one.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_across_managers_get_distinct_pins() {
        let store = Arc::new(MemoryStore::new());
        let first = Harness::with_store(store.clone(), ManagerConfig::default());
        let second = Harness::with_store(store.clone(), ManagerConfig::default());

        let handles: Vec<_> = (1..=200)
            .map(|id| {
                let manager = if id % 2 == 0 {
                    Arc::clone(&first.manager)
                } else {
                    Arc::clone(&second.manager)
                };
                tokio::spawn(async move { manager.create_race(id).await })
            })
            .collect();

        let mut pins = HashSet::new();
        for handle in handles {
            let created = handle.await.unwrap().unwrap();
            assert!(pins.insert(created.pin));
        }
        assert_eq!(pins.len(), 200);
        assert_eq!(store.len().await, 200);

        for pin in &pins {
            let race = first.manager.race(pin).await.unwrap().unwrap();
            let seen_by_second = second.manager.race(pin).await.unwrap().unwrap();
            assert_eq!(race, seen_by_second);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_joins_are_never_lost() {
        let config = ManagerConfig {
            max_commit_attempts: 256,
            ..ManagerConfig::default()
        };
        let h = Harness::with_store(Arc::new(MemoryStore::new()), config);
        let pin = h.manager.create_race(1).await.unwrap().pin;

        let handles: Vec<_> = (2..52)
            .map(|id| {
                let manager = Arc::clone(&h.manager);
                let pin = pin.clone();
                tokio::spawn(async move { manager.join_race(&pin, "Racer", id).await })
            })
            .collect();
        for handle in handles {
            assert_ok!(handle.await.unwrap());
        }

        let race = h.manager.race(&pin).await.unwrap().unwrap();
        assert_eq!(race.players.len(), 50);
    }

    /// Two server processes sharing one store, modelled as two managers.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn managers_sharing_a_store_serialize_writes() {
        let store = Arc::new(MemoryStore::new());
        let config = ManagerConfig {
            max_commit_attempts: 256,
            ..ManagerConfig::default()
        };
        let mut first = Harness::with_store(store.clone(), config.clone());
        let second = Harness::with_store(store.clone(), config);

        let pin = first.lobby(1, &[]).await;

        let handles: Vec<_> = (2..42)
            .map(|id| {
                let manager = if id % 2 == 0 {
                    Arc::clone(&first.manager)
                } else {
                    Arc::clone(&second.manager)
                };
                let pin = pin.clone();
                tokio::spawn(async move { manager.join_race(&pin, "Racer", id).await })
            })
            .collect();
        for handle in handles {
            assert_ok!(handle.await.unwrap());
        }

        let seen_by_first = first.manager.race(&pin).await.unwrap().unwrap();
        let seen_by_second = second.manager.race(&pin).await.unwrap().unwrap();
        assert_eq!(seen_by_first.players.len(), 40);
        assert_eq!(seen_by_first, seen_by_second);

        // Either manager may start it; only the host is allowed.
        assert_eq!(
            second.manager.start_race(&pin, 2).await,
            Err(RaceError::Unauthorized)
        );
        assert_ok!(second.manager.start_race(&pin, 1).await);
        assert!(matches!(
            first.manager.start_race(&pin, 1).await,
            Err(RaceError::InvalidState(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_finishes_complete_exactly_once() {
        let config = ManagerConfig {
            max_commit_attempts: 256,
            ..ManagerConfig::default()
        };
        let mut h = Harness::with_store(Arc::new(MemoryStore::new()), config);
        let racers: Vec<(ConnectionId, &str)> = (2..22).map(|id| (id, "Racer")).collect();
        let pin = h.lobby(1, &racers).await;
        h.manager.start_race(&pin, 1).await.unwrap();
        h.clock.advance(30_000);
        h.drain();

        let handles: Vec<_> = (2..22)
            .map(|id| {
                let manager = Arc::clone(&h.manager);
                let pin = pin.clone();
                tokio::spawn(async move { manager.finish_race(&pin, id, 40.0, 95.0).await })
            })
            .collect();
        for handle in handles {
            assert_ok!(handle.await.unwrap());
        }

        let finished_to_host = h
            .drain()
            .into_iter()
            .filter(|(to, e)| *to == 1 && matches!(e, ServerEvent::RaceFinished(_)))
            .count();
        assert_eq!(finished_to_host, 1);

        let race = h.manager.race(&pin).await.unwrap().unwrap();
        assert_eq!(race.status, RaceStatus::Finished);
        assert_eq!(race.leaderboard.len(), 20);
    }
}

/// PROTOCOL TESTS
mod protocol_tests {
    use bincode::{deserialize, serialize};
    use shared::{Packet, Request, Response, MAX_PACKET_SIZE};

    #[test]
    fn error_results_survive_the_wire() {
        let packet = Packet::Response {
            request_id: 9,
            result: Err(shared::RaceError::InvalidState(
                "race already started".to_string(),
            )),
        };
        let bytes = serialize(&packet).unwrap();
        match deserialize::<Packet>(&bytes).unwrap() {
            Packet::Response { request_id, result } => {
                assert_eq!(request_id, 9);
                let err: Result<Response, _> = result;
                assert_eq!(
                    err.unwrap_err().to_string(),
                    "invalid state: race already started"
                );
            }
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn malformed_packets_are_rejected() {
        let garbage: Vec<Vec<u8>> = vec![vec![], vec![0xff; 3], vec![42; 16]];
        for data in garbage {
            assert!(deserialize::<Packet>(&data).is_err());
        }
    }

    #[test]
    fn join_request_fits_in_a_datagram() {
        let packet = Packet::Request {
            request_id: u32::MAX,
            request: Request::JoinRace {
                pin: "123456".parse().unwrap(),
                name: "x".repeat(256),
            },
        };
        assert!(serialize(&packet).unwrap().len() < MAX_PACKET_SIZE);
    }
}
