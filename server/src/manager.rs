//! Race lifecycle operations.
//!
//! The session manager is the only component that mutates race records.
//! Every mutation follows the same path:
//!
//! 1. read the record and its version from the store
//! 2. validate and mutate a private copy
//! 3. commit with compare-and-swap against the version read in step 1,
//!    starting over from step 1 on conflict
//! 4. only after the commit, update the registry and broadcast
//!
//! Because the version lives in the store, two managers in different
//! processes sharing one store still serialize their writes per pin.
//! Store calls are bounded by a timeout and retried a few times; after
//! that the caller sees [`RaceError::Internal`].

use crate::broadcast::BroadcastGateway;
use crate::error::StoreError;
use crate::race::Race;
use crate::registry::ConnectionRegistry;
use crate::store::{SessionStore, Swap, Versioned};
use crate::text::TextProvider;
use crate::utils::Clock;
use log::{debug, error, info, warn};
use rand::Rng;
use shared::{
    ConnectionId, JoinedRace, Leaderboard, Pin, Player, RaceCreated, RaceError, RaceStarted,
    RaceStatus, ServerEvent, PIN_MAX, PIN_MIN,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Lifetime of a race record since its last write.
    pub race_ttl: Duration,
    /// Upper bound for a single store call.
    pub store_timeout: Duration,
    /// Extra attempts for a store call that timed out or was unavailable.
    pub store_retries: u32,
    /// Compare-and-swap attempts before giving up on a contended pin.
    pub max_commit_attempts: u32,
    /// Pins drawn before create-race gives up.
    pub max_pin_attempts: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            race_ttl: Duration::from_secs(2 * 60 * 60),
            store_timeout: Duration::from_millis(500),
            store_retries: 2,
            max_commit_attempts: 16,
            max_pin_attempts: 64,
        }
    }
}

/// What to do with the mutated copy of a race.
enum Commit<T> {
    Save(T),
    Delete(T),
    Skip(T),
}

enum Departure {
    Nothing,
    PlayerLeft {
        players: Vec<Player>,
        completed: Option<Vec<Player>>,
    },
    LastPlayerLeft,
    HostLeft {
        removed: bool,
        players: Vec<Player>,
    },
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    gateway: Arc<BroadcastGateway>,
    registry: ConnectionRegistry,
    texts: Arc<dyn TextProvider>,
    clock: Arc<dyn Clock>,
    config: ManagerConfig,
}

fn generate_pin() -> Option<Pin> {
    Pin::from_number(rand::thread_rng().gen_range(PIN_MIN..=PIN_MAX))
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        gateway: Arc<BroadcastGateway>,
        texts: Arc<dyn TextProvider>,
        clock: Arc<dyn Clock>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            registry: ConnectionRegistry::new(),
            texts,
            clock,
            config,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn gateway(&self) -> &BroadcastGateway {
        &self.gateway
    }

    /// Current committed state of a race, if it is live.
    pub async fn race(&self, pin: &Pin) -> Result<Option<Race>, RaceError> {
        let record = self
            .store_call("get", pin, || self.store.get(pin))
            .await
            .map_err(|e| self.internal("get", pin, e))?;
        Ok(record.map(|r| r.value))
    }

    pub async fn create_race(&self, connection: ConnectionId) -> Result<RaceCreated, RaceError> {
        self.leave_previous(connection, None).await?;

        for _ in 0..self.config.max_pin_attempts {
            let Some(pin) = generate_pin() else {
                continue;
            };

            let taken = self
                .store_call("exists", &pin, || self.store.exists(&pin))
                .await
                .map_err(|e| self.internal("exists", &pin, e))?;
            if taken {
                debug!("Pin {} already live, drawing another", pin);
                continue;
            }

            let race = Race::new(pin.clone(), connection);
            let swap = self
                .store_call("compare_and_swap", &pin, || {
                    self.store
                        .compare_and_swap(&pin, None, Some(&race), self.config.race_ttl)
                })
                .await
                .map_err(|e| self.internal("compare_and_swap", &pin, e))?;
            if swap == Swap::Conflict {
                debug!("Pin {} claimed concurrently, drawing another", pin);
                continue;
            }

            self.registry.bind(connection, pin.clone()).await;
            self.gateway.join_channel(&pin, connection).await;

            let created = RaceCreated {
                pin: pin.clone(),
                host_id: connection,
            };
            self.gateway
                .emit_to_connection(connection, &ServerEvent::RaceCreated(created.clone()))
                .await;

            info!("Race {} created by connection {}", pin, connection);
            return Ok(created);
        }

        error!(
            "No free pin after {} attempts",
            self.config.max_pin_attempts
        );
        Err(RaceError::Internal)
    }

    pub async fn join_race(
        &self,
        pin: &Pin,
        name: &str,
        connection: ConnectionId,
    ) -> Result<JoinedRace, RaceError> {
        self.leave_previous(connection, Some(pin)).await?;

        let joined = self
            .mutate(pin, |race| {
                let player = race.add_player(connection, name)?;
                Ok(Commit::Save(JoinedRace {
                    pin: race.pin.clone(),
                    player,
                    players: race.players.clone(),
                    host_id: race.host_id,
                }))
            })
            .await?;

        self.registry.bind(connection, pin.clone()).await;
        self.gateway.join_channel(pin, connection).await;

        self.gateway
            .emit_to_connection(connection, &ServerEvent::JoinedRace(joined.clone()))
            .await;
        self.gateway
            .emit_to_channel(
                pin,
                &ServerEvent::PlayerJoined {
                    pin: pin.clone(),
                    player: joined.player.clone(),
                    players: joined.players.clone(),
                },
                Some(connection),
            )
            .await;

        info!(
            "Connection {} joined race {} as {:?}",
            connection, pin, joined.player.name
        );
        Ok(joined)
    }

    pub async fn start_race(
        &self,
        pin: &Pin,
        connection: ConnectionId,
    ) -> Result<RaceStarted, RaceError> {
        let mut passage: Option<String> = None;

        let started = self
            .mutate(pin, |race| {
                // Checked here too so the provider is only asked for valid starts.
                if !race.is_host(connection) {
                    return Err(RaceError::Unauthorized);
                }
                if race.status != RaceStatus::Lobby {
                    return Err(RaceError::InvalidState("race already started".to_string()));
                }
                let text = passage
                    .get_or_insert_with(|| self.texts.next_passage())
                    .clone();
                let started = race.start(connection, text, self.clock.now_millis())?;
                Ok(Commit::Save(started))
            })
            .await?;

        self.gateway
            .emit_to_channel(pin, &ServerEvent::RaceStarted(started.clone()), None)
            .await;

        info!("Race {} started at {}", pin, started.start_time);
        Ok(started)
    }

    /// Best-effort stats update. Never reports failure to the caller.
    pub async fn progress_update(
        &self,
        pin: &Pin,
        connection: ConnectionId,
        progress: f64,
        wpm: f64,
        accuracy: f64,
    ) {
        let result = self
            .mutate(pin, |race| {
                if race.update_progress(connection, progress, wpm, accuracy) {
                    Ok(Commit::Save(Some(race.players.clone())))
                } else {
                    Ok(Commit::Skip(None))
                }
            })
            .await;

        match result {
            Ok(Some(players)) => {
                self.gateway
                    .emit_to_channel(
                        pin,
                        &ServerEvent::ProgressBroadcast {
                            pin: pin.clone(),
                            players,
                        },
                        None,
                    )
                    .await;
            }
            Ok(None) => {}
            Err(e) => debug!(
                "Dropped progress update from {} on {}: {}",
                connection, pin, e
            ),
        }
    }

    pub async fn finish_race(
        &self,
        pin: &Pin,
        connection: ConnectionId,
        wpm: f64,
        accuracy: f64,
    ) -> Result<Leaderboard, RaceError> {
        let (leaderboard, completed) = self
            .mutate(pin, |race| {
                let completed = race.finish(connection, wpm, accuracy, self.clock.now_millis())?;
                Ok(Commit::Save((race.leaderboard.clone(), completed)))
            })
            .await?;

        let payload = Leaderboard {
            pin: pin.clone(),
            leaderboard,
        };
        self.gateway
            .emit_to_channel(pin, &ServerEvent::LeaderboardUpdate(payload.clone()), None)
            .await;

        if completed {
            info!("Race {} finished", pin);
            self.gateway
                .emit_to_channel(pin, &ServerEvent::RaceFinished(payload.clone()), None)
                .await;
        }

        Ok(payload)
    }

    /// Cleans up after a connection that went away.
    ///
    /// Succeeds when there was nothing left to clean up. On failure the
    /// connection stays bound to its race, so calling again retries the
    /// departure instead of leaving a ghost player behind.
    pub async fn handle_disconnect(&self, connection: ConnectionId) -> Result<(), RaceError> {
        let Some(pin) = self.registry.lookup(connection).await else {
            debug!("Connection {} left without a race", connection);
            return Ok(());
        };
        self.depart(connection, &pin).await
    }

    /// Removes `connection` from the race at `pin`. The binding and channel
    /// membership are only dropped once the store agrees.
    async fn depart(&self, connection: ConnectionId, pin: &Pin) -> Result<(), RaceError> {
        let departure = self
            .mutate(pin, |race| {
                let was_host = race.is_host(connection);
                let removed = race.remove_player(connection);

                if was_host {
                    return Ok(Commit::Delete(Departure::HostLeft {
                        removed,
                        players: race.players.clone(),
                    }));
                }
                if !removed {
                    return Ok(Commit::Skip(Departure::Nothing));
                }
                if race.players.is_empty() && race.status != RaceStatus::Finished {
                    return Ok(Commit::Delete(Departure::LastPlayerLeft));
                }

                let completed = race
                    .complete_if_all_finished()
                    .then(|| race.leaderboard.clone());
                Ok(Commit::Save(Departure::PlayerLeft {
                    players: race.players.clone(),
                    completed,
                }))
            })
            .await;

        let departure = match departure {
            Ok(departure) => departure,
            Err(RaceError::NotFound) => {
                debug!("Race {} already gone when {} left", pin, connection);
                self.forget(connection, pin).await;
                return Ok(());
            }
            Err(e) => {
                error!(
                    "Failed to remove connection {} from race {}: {}",
                    connection, pin, e
                );
                return Err(e);
            }
        };

        self.forget(connection, pin).await;

        match departure {
            Departure::Nothing => {}
            Departure::PlayerLeft { players, completed } => {
                self.emit_player_left(pin, connection, players).await;
                if let Some(leaderboard) = completed {
                    info!("Race {} finished after {} left", pin, connection);
                    self.gateway
                        .emit_to_channel(
                            pin,
                            &ServerEvent::RaceFinished(Leaderboard {
                                pin: pin.clone(),
                                leaderboard,
                            }),
                            None,
                        )
                        .await;
                }
            }
            Departure::LastPlayerLeft => {
                self.emit_player_left(pin, connection, Vec::new()).await;
                info!("Race {} removed after its last player left", pin);
                self.close_race(pin).await;
            }
            Departure::HostLeft { removed, players } => {
                if removed {
                    self.emit_player_left(pin, connection, players).await;
                }
                info!("Race {} closed, host {} left", pin, connection);
                self.close_race(pin).await;
            }
        }
        Ok(())
    }

    async fn forget(&self, connection: ConnectionId, pin: &Pin) {
        self.registry.unbind_if(connection, pin).await;
        self.gateway.leave_channel(pin, connection).await;
    }

    async fn emit_player_left(&self, pin: &Pin, connection: ConnectionId, players: Vec<Player>) {
        self.gateway
            .emit_to_channel(
                pin,
                &ServerEvent::PlayerLeft {
                    pin: pin.clone(),
                    player_id: connection,
                    players,
                },
                None,
            )
            .await;
    }

    /// Tells everyone still listening that the race is gone and forgets
    /// their membership. Called once, by whoever committed the delete.
    ///
    /// Sent when the host leaves, and also when the last player leaves an
    /// unfinished race: the record is deleted either way, and a host left
    /// alone in the channel would otherwise only learn it from a `NotFound`
    /// on its next request.
    async fn close_race(&self, pin: &Pin) {
        self.gateway
            .emit_to_channel(pin, &ServerEvent::RaceClosed { pin: pin.clone() }, None)
            .await;
        for member in self.gateway.close_channel(pin).await {
            self.registry.unbind_if(member, pin).await;
        }
    }

    /// Takes a connection out of any other race it is bound to, exactly as
    /// if it had disconnected from that race, so it can be bound to `target`.
    async fn leave_previous(
        &self,
        connection: ConnectionId,
        target: Option<&Pin>,
    ) -> Result<(), RaceError> {
        let Some(bound) = self.registry.lookup(connection).await else {
            return Ok(());
        };
        if Some(&bound) == target {
            return Ok(());
        }

        debug!("Connection {} moving on from race {}", connection, bound);
        self.depart(connection, &bound).await
    }

    /// Read-validate-commit loop over one race record.
    async fn mutate<T, F>(&self, pin: &Pin, mut apply: F) -> Result<T, RaceError>
    where
        F: FnMut(&mut Race) -> Result<Commit<T>, RaceError>,
    {
        for attempt in 1..=self.config.max_commit_attempts {
            let record = self
                .store_call("get", pin, || self.store.get(pin))
                .await
                .map_err(|e| self.internal("get", pin, e))?;
            let Some(Versioned {
                version,
                value: mut race,
            }) = record
            else {
                return Err(RaceError::NotFound);
            };

            let (next, out) = match apply(&mut race)? {
                Commit::Save(out) => (Some(race), out),
                Commit::Delete(out) => (None, out),
                Commit::Skip(out) => return Ok(out),
            };

            let swap = self
                .store_call("compare_and_swap", pin, || {
                    self.store.compare_and_swap(
                        pin,
                        Some(version),
                        next.as_ref(),
                        self.config.race_ttl,
                    )
                })
                .await
                .map_err(|e| self.internal("compare_and_swap", pin, e))?;

            match swap {
                Swap::Committed(_) => return Ok(out),
                Swap::Conflict => {
                    debug!("Race {} changed underneath us (attempt {})", pin, attempt)
                }
            }
        }

        warn!(
            "Gave up on race {} after {} conflicting commits",
            pin, self.config.max_commit_attempts
        );
        Err(RaceError::Internal)
    }

    /// Runs one store call under the configured timeout, retrying transient
    /// failures.
    async fn store_call<T, F, Fut>(
        &self,
        op: &str,
        pin: &Pin,
        call: F,
    ) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut retries = 0;
        loop {
            let result = match timeout(self.config.store_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout),
            };

            match result {
                Err(e) if e.is_retryable() && retries < self.config.store_retries => {
                    retries += 1;
                    warn!("Store {} on {} failed ({}), retry {}", op, pin, e, retries);
                }
                other => return other,
            }
        }
    }

    fn internal(&self, op: &str, pin: &Pin, e: StoreError) -> RaceError {
        error!("Store {} on {} failed: {}", op, pin, e);
        RaceError::Internal
    }
}
