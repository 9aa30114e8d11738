// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

/// Framed message channel over the server's stdio streams.
pub mod channel;
/// Lifecycle controller facade over all sub-components.
pub mod controller;
/// Event fan-out to subscribers by event name.
pub mod dispatch;
/// OS process launch, exit monitoring, and termination.
pub mod process;
/// Wire protocol: message envelopes and Content-Length framing.
pub mod protocol;
/// Circuit breaker and retry policy around sends.
pub mod resilience;
/// Lifecycle state machine.
pub mod state;
/// Pending-request correlation and timeouts.
pub mod tracker;

pub use controller::AnalyzerController;
pub use dispatch::{EventDispatcher, SubscriptionId};
pub use protocol::{Event, Message, Request, Response};
pub use resilience::CircuitState;
pub use state::ServerState;
pub use tracker::RequestTracker;
