/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Server lifecycle state and its legal transitions.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::watch;

/// Lifecycle state of a managed analysis server.
///
/// Exactly one instance exists per managed server session; only the
/// controller mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Never started, or reset back to the initial state.
    NotStarted,
    /// Process launched, handshake in flight.
    Starting,
    /// Handshake confirmed; requests are accepted.
    Running,
    /// Shutdown in progress; pending requests are being cancelled.
    Stopping,
    /// Cleanly stopped.
    Stopped,
    /// Structural failure; requires an explicit start to recover.
    Error,
}

impl ServerState {
    /// Create from atomic u8 value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotStarted,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Error,
        }
    }

    /// Convert to atomic u8 value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Stopping => 3,
            Self::Stopped => 4,
            Self::Error => 5,
        }
    }

    /// Whether the transition `self -> next` is legal.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Starting)
                | (Self::Starting, Self::Running | Self::Stopping | Self::Error)
                | (Self::Running, Self::Stopping | Self::Error)
                | (Self::Stopping, Self::Stopped | Self::Error)
                | (Self::Stopped, Self::Starting | Self::NotStarted)
                | (Self::Error, Self::Stopped)
        )
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Atomic holder for the server state with a broadcast stream of changes.
///
/// Transitions are applied by compare-and-swap so concurrent `start()` and
/// `stop()` callers race for exactly one winner; losers see a rejection, not
/// a torn state.
#[derive(Debug)]
pub struct StateCell {
    value: AtomicU8,
    tx: watch::Sender<ServerState>,
}

impl StateCell {
    /// Create a cell in [`ServerState::NotStarted`].
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ServerState::NotStarted);
        Self {
            value: AtomicU8::new(ServerState::NotStarted.as_u8()),
            tx,
        }
    }

    /// Current state.
    #[must_use]
    pub fn get(&self) -> ServerState {
        ServerState::from_u8(self.value.load(Ordering::SeqCst))
    }

    /// Stream of state changes. The receiver yields the current value first.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.tx.subscribe()
    }

    /// Atomically move `from -> to`. Returns false if the current state is
    /// not `from` or the transition is illegal.
    pub fn transition(&self, from: ServerState, to: ServerState) -> bool {
        if !from.can_transition_to(to) {
            return false;
        }
        let swapped = self
            .value
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if swapped {
            // send_replace never fails even with no subscribers.
            self.tx.send_replace(to);
        }
        swapped
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
