use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const PROTOCOL_VERSION: u32 = 1;
pub const PIN_LENGTH: usize = 6;
pub const PIN_MIN: u32 = 100_000;
pub const PIN_MAX: u32 = 999_999;
pub const DEFAULT_PLAYER_NAME: &str = "Player";
pub const MAX_PACKET_SIZE: usize = 8192;
/// Racers per race. With names capped at [`MAX_NAME_BYTES`], every event
/// carrying a full roster stays well inside [`MAX_PACKET_SIZE`].
pub const MAX_PLAYERS_PER_RACE: usize = 64;
pub const MAX_NAME_BYTES: usize = 32;

/// Stable identifier the transport assigns to each live connection.
pub type ConnectionId = u32;

/// Public 6-digit identifier of a race.
///
/// Decoding off the wire does not validate the digits; an ill-formed pin
/// simply never matches a live race. Use [`Pin::from_number`] or
/// [`str::parse`] to build a checked one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pin(String);

impl Pin {
    pub fn from_number(n: u32) -> Option<Self> {
        if (PIN_MIN..=PIN_MAX).contains(&n) {
            Some(Pin(n.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("pin must be six digits between 100000 and 999999")]
pub struct InvalidPin;

impl FromStr for Pin {
    type Err = InvalidPin;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != PIN_LENGTH || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidPin);
        }
        let n: u32 = s.parse().map_err(|_| InvalidPin)?;
        Pin::from_number(n).ok_or(InvalidPin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaceStatus {
    Lobby,
    Running,
    Finished,
}

impl RaceStatus {
    /// Status only ever moves forward: lobby, running, finished.
    pub fn can_transition_to(self, next: RaceStatus) -> bool {
        matches!(
            (self, next),
            (RaceStatus::Lobby, RaceStatus::Running) | (RaceStatus::Running, RaceStatus::Finished)
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Player {
    pub id: ConnectionId,
    pub name: String,
    pub progress: f64,
    pub wpm: f64,
    pub accuracy: f64,
    pub finished: bool,
    pub finish_time_ms: Option<u64>,
}

fn clip(s: &str, max_bytes: usize) -> &str {
    let mut end = s.len().min(max_bytes);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

impl Player {
    /// Creates a fresh racer. The display name is trimmed, cut to at most
    /// [`MAX_NAME_BYTES`] on a character boundary, and falls back to
    /// [`DEFAULT_PLAYER_NAME`] when blank.
    pub fn new(id: ConnectionId, name: &str) -> Self {
        let trimmed = clip(name.trim(), MAX_NAME_BYTES).trim_end();
        let name = if trimmed.is_empty() {
            DEFAULT_PLAYER_NAME.to_string()
        } else {
            trimmed.to_string()
        };

        Self {
            id,
            name,
            progress: 0.0,
            wpm: 0.0,
            accuracy: 100.0,
            finished: false,
            finish_time_ms: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RaceCreated {
    pub pin: Pin,
    pub host_id: ConnectionId,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct JoinedRace {
    pub pin: Pin,
    pub player: Player,
    pub players: Vec<Player>,
    pub host_id: ConnectionId,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RaceStarted {
    pub pin: Pin,
    pub text: String,
    pub start_time: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Leaderboard {
    pub pin: Pin,
    pub leaderboard: Vec<Player>,
}

/// Failures returned to the caller of a race operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum RaceError {
    #[error("race not found")]
    NotFound,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("only the host can do that")]
    Unauthorized,
    #[error("player not part of race")]
    NotMember,
    #[error("player already finished")]
    AlreadyDone,
    #[error("internal server error")]
    Internal,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Request {
    CreateRace,
    JoinRace {
        pin: Pin,
        name: String,
    },
    StartRace {
        pin: Pin,
    },
    ProgressUpdate {
        pin: Pin,
        progress: f64,
        wpm: f64,
        accuracy: f64,
    },
    FinishRace {
        pin: Pin,
        wpm: f64,
        accuracy: f64,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Response {
    RaceCreated(RaceCreated),
    JoinedRace(JoinedRace),
    RaceStarted(RaceStarted),
    Leaderboard(Leaderboard),
}

/// Named state-change notifications. Every payload is a full snapshot of
/// the entity it describes, so clients converge regardless of arrival order.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum ServerEvent {
    RaceCreated(RaceCreated),
    JoinedRace(JoinedRace),
    PlayerJoined {
        pin: Pin,
        player: Player,
        players: Vec<Player>,
    },
    RaceStarted(RaceStarted),
    ProgressBroadcast {
        pin: Pin,
        players: Vec<Player>,
    },
    LeaderboardUpdate(Leaderboard),
    RaceFinished(Leaderboard),
    PlayerLeft {
        pin: Pin,
        player_id: ConnectionId,
        players: Vec<Player>,
    },
    RaceClosed {
        pin: Pin,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::RaceCreated(_) => "race-created",
            ServerEvent::JoinedRace(_) => "joined-race",
            ServerEvent::PlayerJoined { .. } => "player-joined",
            ServerEvent::RaceStarted(_) => "race-started",
            ServerEvent::ProgressBroadcast { .. } => "progress-broadcast",
            ServerEvent::LeaderboardUpdate(_) => "leaderboard-update",
            ServerEvent::RaceFinished(_) => "race-finished",
            ServerEvent::PlayerLeft { .. } => "player-left",
            ServerEvent::RaceClosed { .. } => "race-closed",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Connect {
        client_version: u32,
    },
    Heartbeat {
        timestamp: u64,
    },
    Request {
        request_id: u32,
        request: Request,
    },
    Disconnect,

    Connected {
        client_id: ConnectionId,
    },
    Response {
        request_id: u32,
        result: Result<Response, RaceError>,
    },
    Event(ServerEvent),
    Disconnected {
        reason: String,
    },
}
