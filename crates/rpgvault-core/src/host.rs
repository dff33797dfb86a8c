//! Boundary types between the host game server and the coordinator.
//!
//! The host owns the tick loop. It feeds [`HostEvent`]s into the coordinator
//! as they happen, calls [`TickHandler::on_tick`] once per tick, and drains
//! [`CoordinatorEvent`]s afterwards to react on the tick thread.

use core::fmt;

use rpgvault_types::{PlayerId, PlayerRecord, SessionId};

/// Why a player left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// Normal disconnect.
    Quit,
    /// Removed by an operator or moderation.
    Kicked,
    /// The connection timed out.
    TimedOut,
    /// The connection dropped with an error.
    ConnectionLost,
}

impl fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Quit => "quit",
            Self::Kicked => "kicked",
            Self::TimedOut => "timed_out",
            Self::ConnectionLost => "connection_lost",
        })
    }
}

/// Lifecycle notifications from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A player connected.
    Join {
        /// Stable player identity.
        player_id: PlayerId,
        /// Token of this connection.
        session: SessionId,
        /// Current display name.
        name: String,
    },
    /// A player disconnected.
    Leave {
        /// Stable player identity.
        player_id: PlayerId,
        /// Why the player left.
        reason: LeaveReason,
    },
    /// The server is stopping; flush everything.
    Shutdown,
}

/// Per-tick callback the host registers.
pub trait TickHandler {
    /// Called once per tick on the tick thread. Must not block.
    fn on_tick(&mut self, tick: u64);
}

/// A tick handler that does nothing, for hosts under test.
pub struct NoOpTickHandler;

impl TickHandler for NoOpTickHandler {
    fn on_tick(&mut self, _tick: u64) {}
}

/// What gameplay code sees when it asks for a player's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerDataView<'a> {
    /// The record is loaded and may be read and mutated.
    Ready(&'a PlayerRecord),
    /// The player is online but the record is still loading.
    NotReady,
    /// The player is not online.
    Offline,
}

impl<'a> PlayerDataView<'a> {
    /// The record, when ready.
    pub const fn ready(self) -> Option<&'a PlayerRecord> {
        match self {
            Self::Ready(record) => Some(record),
            Self::NotReady | Self::Offline => None,
        }
    }
}

/// Outcome of the bounded shutdown flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions whose data was durably written (or had nothing to write).
    pub saved: usize,
    /// Sessions whose final write failed.
    pub failed: usize,
    /// Sessions still waiting on storage when the timeout expired.
    pub unfinished: usize,
}

impl ShutdownReport {
    /// Whether every session was flushed.
    pub const fn is_clean(&self) -> bool {
        self.failed == 0 && self.unfinished == 0
    }
}

/// Notifications the coordinator raises for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// The player's record is loaded and gameplay may use it.
    PlayerReady {
        /// The player.
        player_id: PlayerId,
        /// The session the record was loaded for.
        session: SessionId,
        /// Whether a new default record was created.
        created: bool,
    },
    /// Loading failed; the player has a temporary record that is never saved.
    LoadFailed {
        /// The player.
        player_id: PlayerId,
        /// The session affected.
        session: SessionId,
        /// Description of the final error.
        error: String,
    },
    /// The player's cache entry is gone.
    SessionEnded {
        /// The player.
        player_id: PlayerId,
        /// Whether the final state was durably written.
        clean: bool,
    },
    /// The player gained one level.
    LevelUp {
        /// The player.
        player_id: PlayerId,
        /// Level before.
        from: u32,
        /// Level after.
        to: u32,
    },
    /// The shutdown flush finished.
    ShutdownComplete(ShutdownReport),
}
