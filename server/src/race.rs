//! The race record and its state transitions.
//!
//! Everything here is synchronous and operates on a private copy of the
//! record; the session manager decides when a mutated copy gets committed.

use serde::{Deserialize, Serialize};
use shared::{
    ConnectionId, Pin, Player, RaceError, RaceStarted, RaceStatus, MAX_PLAYERS_PER_RACE,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Race {
    pub pin: Pin,
    pub host_id: ConnectionId,
    pub status: RaceStatus,
    pub text: Option<String>,
    pub start_time: Option<u64>,
    /// Racers in join order.
    pub players: Vec<Player>,
    /// Finished racers, fastest first.
    pub leaderboard: Vec<Player>,
}

impl Race {
    pub fn new(pin: Pin, host_id: ConnectionId) -> Self {
        Self {
            pin,
            host_id,
            status: RaceStatus::Lobby,
            text: None,
            start_time: None,
            players: Vec::new(),
            leaderboard: Vec::new(),
        }
    }

    pub fn player(&self, id: ConnectionId) -> Option<&Player> {
        self.players.iter().find(|p| p.id == id)
    }

    fn player_mut(&mut self, id: ConnectionId) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.id == id)
    }

    pub fn is_host(&self, id: ConnectionId) -> bool {
        self.host_id == id
    }

    /// Adds a racer while the race is still in the lobby.
    ///
    /// A connection joining twice gets a fresh entry in its original slot.
    /// New racers are refused with `InvalidState("race is full")` once the
    /// roster holds [`MAX_PLAYERS_PER_RACE`].
    pub fn add_player(&mut self, id: ConnectionId, name: &str) -> Result<Player, RaceError> {
        if self.status != RaceStatus::Lobby {
            return Err(RaceError::InvalidState("race already started".to_string()));
        }

        let player = Player::new(id, name);
        let roster_len = self.players.len();
        match self.player_mut(id) {
            Some(existing) => *existing = player.clone(),
            None if roster_len >= MAX_PLAYERS_PER_RACE => {
                return Err(RaceError::InvalidState("race is full".to_string()));
            }
            None => self.players.push(player.clone()),
        }
        Ok(player)
    }

    /// Removes a racer and drops them from the leaderboard.
    pub fn remove_player(&mut self, id: ConnectionId) -> bool {
        let before = self.players.len();
        self.players.retain(|p| p.id != id);
        let removed = self.players.len() != before;
        if removed {
            self.recompute_leaderboard();
        }
        removed
    }

    pub fn start(
        &mut self,
        by: ConnectionId,
        text: String,
        now: u64,
    ) -> Result<RaceStarted, RaceError> {
        if !self.is_host(by) {
            return Err(RaceError::Unauthorized);
        }
        if !self.status.can_transition_to(RaceStatus::Running) {
            return Err(RaceError::InvalidState("race already started".to_string()));
        }

        self.status = RaceStatus::Running;
        self.text = Some(text.clone());
        self.start_time = Some(now);

        Ok(RaceStarted {
            pin: self.pin.clone(),
            text,
            start_time: now,
        })
    }

    /// Overwrites a racer's self-reported stats. Values are taken as given.
    ///
    /// Returns false when the race is not running or the connection is not
    /// racing in it.
    pub fn update_progress(
        &mut self,
        id: ConnectionId,
        progress: f64,
        wpm: f64,
        accuracy: f64,
    ) -> bool {
        if self.status != RaceStatus::Running {
            return false;
        }
        match self.player_mut(id) {
            Some(player) => {
                player.progress = progress;
                player.wpm = wpm;
                player.accuracy = accuracy;
                true
            }
            None => false,
        }
    }

    /// Marks a racer as finished at `now`.
    ///
    /// Returns true when this finish completed the race.
    pub fn finish(
        &mut self,
        id: ConnectionId,
        wpm: f64,
        accuracy: f64,
        now: u64,
    ) -> Result<bool, RaceError> {
        if self.status != RaceStatus::Running {
            return Err(RaceError::InvalidState("race not running".to_string()));
        }

        let elapsed = now.saturating_sub(self.start_time.unwrap_or(now));
        let player = self.player_mut(id).ok_or(RaceError::NotMember)?;
        if player.finished {
            return Err(RaceError::AlreadyDone);
        }

        player.finished = true;
        player.finish_time_ms = Some(elapsed);
        player.wpm = wpm;
        player.accuracy = accuracy;

        self.recompute_leaderboard();
        Ok(self.complete_if_all_finished())
    }

    pub fn all_finished(&self) -> bool {
        !self.players.is_empty() && self.players.iter().all(|p| p.finished)
    }

    /// Moves a running race to finished once every current racer is done.
    pub fn complete_if_all_finished(&mut self) -> bool {
        if self.status == RaceStatus::Running && self.all_finished() {
            self.status = RaceStatus::Finished;
            true
        } else {
            false
        }
    }

    // The sort is stable and `players` is in join order, so equal times keep
    // join order.
    fn recompute_leaderboard(&mut self) {
        let mut finished: Vec<Player> = self
            .players
            .iter()
            .filter(|p| p.finished && p.finish_time_ms.is_some())
            .cloned()
            .collect();
        finished.sort_by_key(|p| p.finish_time_ms);
        self.leaderboard = finished;
    }
}
