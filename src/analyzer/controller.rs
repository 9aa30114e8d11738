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

//! The lifecycle controller: facade over process, channel, tracker,
//! dispatcher, and resilience layer.
//!
//! Ownership is one-directional. The controller owns every sub-component and
//! wires them together with queues; sub-components never reach back into the
//! controller. State transitions go through a compare-and-swap cell, so a
//! racing `start()` and `stop()` produce one winner and one clean rejection.

use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::channel::{ChannelEvent, FramedChannel, StdioChannel};
use super::dispatch::{EventDispatcher, SubscriptionId};
use super::process::{self, ProcessHandle};
use super::protocol::{self, Event, Message, Request, Response};
use super::resilience::{CircuitState, ResilienceLayer};
use super::state::{ServerState, StateCell};
use super::tracker::RequestTracker;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::session::{EventBroadcaster, EventKind};

/// Queue depth between the reader task and response/event routing.
const ROUTER_QUEUE_CAPACITY: usize = 256;

/// Queue depth between the router and the subscriber delivery worker.
const EVENT_QUEUE_CAPACITY: usize = 256;

/// Cadence of the pending-request sweep safety net.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Everything tied to one live server process. Replaced wholesale on
/// restart; dropped on teardown.
struct ActiveServer {
    channel: Arc<StdioChannel>,
    process: ProcessHandle,
    router: JoinHandle<()>,
    delivery: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

/// Manages one out-of-process analysis server: launch, handshake, typed
/// request/response traffic, event fan-out, crash recovery, shutdown.
///
/// Cheap to clone; all clones drive the same server session.
#[derive(Clone)]
pub struct AnalyzerController {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    state: StateCell,
    seq: AtomicU64,
    tracker: Arc<RequestTracker>,
    dispatcher: Arc<EventDispatcher>,
    resilience: ResilienceLayer,
    broadcaster: EventBroadcaster,
    restart_attempts: AtomicU32,
    active: Mutex<Option<ActiveServer>>,
}

impl AnalyzerController {
    /// Build a controller for one server session. The configuration is
    /// captured here and never re-read from anywhere global.
    #[must_use]
    pub fn new(config: ServerConfig, broadcaster: EventBroadcaster) -> Self {
        let tracker = Arc::new(RequestTracker::new(
            config.max_pending_requests,
            config.request_timeout(),
        ));
        let resilience = ResilienceLayer::new(&config.breaker, &config.retry);
        Self {
            inner: Arc::new(Inner {
                config,
                state: StateCell::new(),
                seq: AtomicU64::new(0),
                tracker,
                dispatcher: Arc::new(EventDispatcher::new()),
                resilience,
                broadcaster,
                restart_attempts: AtomicU32::new(0),
                active: Mutex::new(None),
            }),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn current_state(&self) -> ServerState {
        self.inner.state.get()
    }

    /// Stream of lifecycle state changes.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ServerState> {
        self.inner.state.subscribe()
    }

    /// Breaker state, for observability.
    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.inner.resilience.circuit_state()
    }

    /// Number of requests currently awaiting a response.
    pub async fn pending_requests(&self) -> usize {
        self.inner.tracker.pending_count().await
    }

    /// Register a callback for server events with the given name.
    pub fn subscribe<F>(&self, event: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.dispatcher.subscribe(event, callback)
    }

    /// Remove one subscription. Returns whether it was still registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.dispatcher.unsubscribe(id)
    }

    /// Launch the server and confirm readiness with the handshake request.
    ///
    /// # Errors
    ///
    /// [`Error::Startup`] when the executable or working directory is
    /// invalid, the spawn fails, or the handshake times out;
    /// [`Error::InvalidState`] when called outside `NotStarted`/`Stopped`.
    pub async fn start(&self) -> Result<()> {
        self.inner.restart_attempts.store(0, Ordering::SeqCst);
        self.inner.start_internal().await
    }

    /// Stop the server: cancel pending requests, offer the shutdown command,
    /// then signal and (if needed) kill the process.
    ///
    /// Calling `stop()` when already stopped is a no-op success.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] unless the server is running, errored, or
    /// already stopped.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        match inner.state.get() {
            ServerState::Stopped => Ok(()),
            ServerState::Error => {
                inner
                    .teardown(false, &Error::Cancelled("server stopped".to_string()))
                    .await;
                let _ = inner.set_state(ServerState::Error, ServerState::Stopped);
                inner.restart_attempts.store(0, Ordering::SeqCst);
                Ok(())
            }
            ServerState::Running => {
                if !inner.set_state(ServerState::Running, ServerState::Stopping) {
                    // Lost the race against a crash or a concurrent stop.
                    return Err(Error::InvalidState {
                        operation: "stop",
                        state: inner.state.get(),
                    });
                }
                let cancelled = inner
                    .tracker
                    .cancel_all(&Error::Cancelled("server stopping".to_string()))
                    .await;
                if cancelled > 0 {
                    debug!("cancelled {cancelled} pending requests on stop");
                }
                inner.offer_shutdown_command().await;
                inner
                    .teardown(true, &Error::Cancelled("server stopping".to_string()))
                    .await;
                let _ = inner.set_state(ServerState::Stopping, ServerState::Stopped);
                inner.restart_attempts.store(0, Ordering::SeqCst);
                Ok(())
            }
            state => Err(Error::InvalidState {
                operation: "stop",
                state,
            }),
        }
    }

    /// `stop()` then `start()`. A failure at either step surfaces to the
    /// caller with the state left at `Error`.
    ///
    /// # Errors
    ///
    /// Propagates the failing step's error.
    pub async fn restart(&self) -> Result<()> {
        if matches!(
            self.current_state(),
            ServerState::Running | ServerState::Error
        ) {
            self.stop().await?;
        }
        self.start().await
    }

    /// Send a command and await its correlated response.
    ///
    /// The returned [`Response`] may still carry `success == false`;
    /// server-side command failures are data, not transport errors.
    ///
    /// # Errors
    ///
    /// [`Error::Communication`] immediately when the server is not running
    /// (no I/O is attempted); [`Error::CircuitOpen`] while the breaker is
    /// open; [`Error::Timeout`] / [`Error::Communication`] /
    /// [`Error::Cancelled`] for the in-flight failure modes.
    pub async fn send_request(
        &self,
        command: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let state = self.current_state();
        if state != ServerState::Running {
            return Err(Error::Communication(format!(
                "server is not running (state: {state})"
            )));
        }
        self.inner
            .send_with_resilience(command, arguments, timeout)
            .await
    }
}

impl Inner {
    /// Apply a transition and record it when it wins.
    fn set_state(&self, from: ServerState, to: ServerState) -> bool {
        if self.state.transition(from, to) {
            info!("server state: {from} -> {to}");
            self.broadcaster.send(EventKind::StateChange {
                from: from.to_string(),
                to: to.to_string(),
            });
            true
        } else {
            false
        }
    }

    /// Start without touching the restart budget (shared by explicit start
    /// and automatic restart).
    async fn start_internal(self: &Arc<Self>) -> Result<()> {
        // Validation failures are reported before any state moves.
        let executable = process::validate(
            &self.config.command,
            self.config.working_dir.as_deref(),
        )?;

        let from = self.state.get();
        let entered = matches!(from, ServerState::NotStarted | ServerState::Stopped)
            && self.set_state(from, ServerState::Starting);
        if !entered {
            return Err(Error::InvalidState {
                operation: "start",
                state: self.state.get(),
            });
        }

        match self.launch(&executable).await {
            Ok(()) => {
                if self.set_state(ServerState::Starting, ServerState::Running) {
                    Ok(())
                } else {
                    // Someone tore the startup down from under us.
                    self.teardown(false, &Error::Cancelled("startup interrupted".to_string()))
                        .await;
                    Err(Error::Startup("startup interrupted".to_string()))
                }
            }
            Err(e) => {
                let error = match e {
                    Error::Startup(_) => e,
                    other => Error::Startup(other.to_string()),
                };
                self.teardown(false, &error).await;
                let _ = self.set_state(ServerState::Starting, ServerState::Error);
                Err(error)
            }
        }
    }

    /// Spawn the process, attach the channel, wire the queues, handshake.
    async fn launch(self: &Arc<Self>, executable: &Path) -> Result<()> {
        let (exit_tx, mut exit_rx) = mpsc::channel(1);
        let spawned = process::spawn(
            executable,
            &self.config.args,
            self.config.working_dir.as_deref(),
            self.config.stop_grace(),
            exit_tx,
        )?;
        info!(pid = spawned.handle.pid(), "analysis server launched");

        let (channel_tx, mut channel_rx) = mpsc::channel(ROUTER_QUEUE_CAPACITY);
        let channel = Arc::new(FramedChannel::attach(
            spawned.stdin,
            spawned.stdout,
            channel_tx,
        ));

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let delivery = self.dispatcher.spawn_worker(event_rx);

        // Router: responses to the tracker, events to the delivery queue.
        // Holds only a weak handle back so a forgotten controller can drop.
        let router = {
            let tracker = Arc::clone(&self.tracker);
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                while let Some(message) = channel_rx.recv().await {
                    match message {
                        ChannelEvent::Message(Message::Response(response)) => {
                            tracker.complete(response).await;
                        }
                        ChannelEvent::Message(Message::Event(event)) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        ChannelEvent::Message(Message::Request(request)) => {
                            warn!(
                                "ignoring unexpected request from server: {}",
                                request.command
                            );
                        }
                        ChannelEvent::Closed { error } => {
                            if let Some(e) = error
                                && let Some(inner) = weak.upgrade()
                            {
                                inner.handle_channel_broken(e);
                            }
                            break;
                        }
                    }
                }
            })
        };

        let sweeper = self.tracker.spawn_sweeper(SWEEP_INTERVAL);

        // One notice per process; the watcher finishes with it.
        {
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                if let Some(notice) = exit_rx.recv().await
                    && let Some(inner) = weak.upgrade()
                {
                    inner.handle_unexpected_exit(notice.code).await;
                }
            });
        }

        *self.active.lock().await = Some(ActiveServer {
            channel,
            process: spawned.handle,
            router,
            delivery,
            sweeper,
        });

        // Handshake goes through the normal request path, with the dedicated
        // startup deadline.
        let started = Instant::now();
        let response = self
            .send_with_resilience(
                &self.config.handshake_command,
                json!({}),
                Some(self.config.startup_timeout()),
            )
            .await?;
        if !response.success {
            return Err(Error::Startup(format!(
                "handshake rejected: {}",
                response.message.unwrap_or_else(|| "no reason given".to_string())
            )));
        }
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.broadcaster.send(EventKind::Handshake { elapsed_ms });
        Ok(())
    }

    async fn send_with_resilience(
        &self,
        command: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        self.resilience
            .execute(move |_attempt| self.send_once(command, arguments.clone(), timeout))
            .await
    }

    /// One tracked send over the channel.
    async fn send_once(
        &self,
        command: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let channel = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.channel))
            .ok_or_else(|| Error::Communication("no active channel".to_string()))?;

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let deadline = timeout.unwrap_or_else(|| self.tracker.default_timeout());
        let handle = self.tracker.track(seq, command, Some(deadline)).await?;

        let request = Request::new(seq, command.to_string(), arguments);
        let frame = protocol::encode(&Message::Request(request))?;
        if let Err(e) = channel.send(&frame).await {
            // The entry must not outlive the failed write.
            self.tracker.fail(seq, e.clone()).await;
            return Err(e);
        }

        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Communication(
                "result handle dropped before completion".to_string(),
            )),
            Err(_) => {
                let timeout_error = Error::Timeout {
                    command: command.to_string(),
                    timeout: deadline,
                };
                self.tracker.fail(seq, timeout_error.clone()).await;
                Err(timeout_error)
            }
        }
    }

    /// Fire the protocol-level shutdown command without tracking a response.
    async fn offer_shutdown_command(&self) {
        let Some(channel) = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.channel))
        else {
            return;
        };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let request = Request::new(seq, self.config.shutdown_command.clone(), json!({}));
        match protocol::encode(&Message::Request(request)) {
            Ok(frame) => {
                if let Err(e) = channel.send(&frame).await {
                    debug!("shutdown command not delivered: {e}");
                }
            }
            Err(e) => debug!("shutdown command not encoded: {e}"),
        }
    }

    /// Release everything tied to the current process. Safe to call twice;
    /// the second call finds nothing.
    async fn teardown(&self, graceful: bool, cause: &Error) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };
        self.tracker.cancel_all(cause).await;
        active.channel.close();
        active.router.abort();
        active.sweeper.abort();
        active.process.stop(graceful).await;
        active.delivery.abort();
    }

    /// Crash path: invoked by the exit watcher when the process dies without
    /// anyone asking it to.
    async fn handle_unexpected_exit(self: &Arc<Self>, code: Option<i32>) {
        // If the notice lands while the handshake is still settling, wait for
        // the startup path to pick a state before deciding whose crash it is.
        let mut states = self.state.subscribe();
        while self.state.get() == ServerState::Starting {
            if states.changed().await.is_err() {
                return;
            }
        }
        if !self.set_state(ServerState::Running, ServerState::Error) {
            // Stopping, stopped, or already handled: not our crash to manage.
            debug!("exit notice ignored in state {}", self.state.get());
            return;
        }
        warn!("analysis server exited unexpectedly (code {code:?})");
        self.broadcaster.send(EventKind::ProcessExit { code });
        self.teardown(false, &Error::Crash { code }).await;
        self.schedule_restarts();
    }

    /// Structural channel failure with the process still alive.
    ///
    /// Runs on the router task, which teardown aborts; the cleanup must
    /// therefore happen on its own task or it would cancel itself halfway.
    fn handle_channel_broken(self: &Arc<Self>, error: Error) {
        if !self.set_state(ServerState::Running, ServerState::Error) {
            return;
        }
        warn!("channel to analysis server broke: {error}");
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.teardown(false, &error).await;
        });
    }

    /// Drive bounded, delayed restart attempts until one sticks or the
    /// budget runs out. The budget resets only on explicit start/stop.
    fn schedule_restarts(self: &Arc<Self>) {
        if !self.config.auto_restart {
            info!("auto-restart disabled; staying in error state");
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let attempt = inner.restart_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt > inner.config.max_restart_attempts {
                    warn!(
                        "restart budget exhausted after {} attempts; staying in error state",
                        inner.config.max_restart_attempts
                    );
                    return;
                }

                let exponent = attempt.saturating_sub(1).min(16);
                let delay = inner
                    .config
                    .restart_delay()
                    .checked_mul(2u32.pow(exponent))
                    .unwrap_or(Duration::MAX);
                info!("scheduling restart attempt {attempt} in {delay:?}");
                inner.broadcaster.send(EventKind::RestartScheduled {
                    attempt,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                });

                // The state stays Error for the whole delay, so an explicit
                // stop() wins the CAS below and the restart is abandoned.
                tokio::time::sleep(delay).await;
                if !inner.set_state(ServerState::Error, ServerState::Stopped) {
                    return;
                }
                match inner.start_internal().await {
                    Ok(()) => return,
                    Err(e) => {
                        warn!("restart attempt {attempt} failed: {e}");
                        // start_internal left the state at Error; loop for
                        // the next attempt.
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use anyhow::Result;

    fn controller_with(config: ServerConfig) -> Result<AnalyzerController> {
        Ok(AnalyzerController::new(config, EventBroadcaster::noop()?))
    }

    #[tokio::test]
    async fn test_send_request_rejected_before_start() -> Result<()> {
        let controller = controller_with(ServerConfig::default())?;
        let started = Instant::now();
        let result = controller.send_request("/ping", json!({}), None).await;

        assert!(matches!(result, Err(Error::Communication(_))));
        // Rejected synchronously, without touching any process.
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(controller.current_state(), ServerState::NotStarted);
        Ok(())
    }

    #[tokio::test]
    async fn test_start_with_bad_executable_fails_validation() -> Result<()> {
        let config = ServerConfig {
            command: "definitely-not-a-real-binary-4c1b".to_string(),
            ..ServerConfig::default()
        };
        let controller = controller_with(config)?;
        let result = controller.start().await;

        assert!(matches!(result, Err(Error::Startup(_))));
        // Validation failed before any transition.
        assert_eq!(controller.current_state(), ServerState::NotStarted);
        Ok(())
    }

    #[tokio::test]
    async fn test_start_with_bad_working_dir_fails_validation() -> Result<()> {
        let config = ServerConfig {
            command: "sh".to_string(),
            working_dir: Some("/definitely/not/a/dir/4c1b".into()),
            ..ServerConfig::default()
        };
        let controller = controller_with(config)?;
        assert!(matches!(controller.start().await, Err(Error::Startup(_))));
        assert_eq!(controller.current_state(), ServerState::NotStarted);
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_rejected_before_start() -> Result<()> {
        let controller = controller_with(ServerConfig::default())?;
        let result = controller.stop().await;
        assert!(matches!(result, Err(Error::InvalidState { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_handshake_failure_moves_to_error() -> Result<()> {
        // A shell that reads stdin but never answers: handshake times out.
        let config = ServerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "cat > /dev/null".to_string()],
            startup_timeout_ms: 150,
            retry: crate::config::RetryConfig {
                max_attempts: 1,
                base_delay_ms: 1,
                max_delay_ms: 1,
            },
            auto_restart: false,
            ..ServerConfig::default()
        };
        let controller = controller_with(config)?;

        let result = controller.start().await;
        assert!(matches!(result, Err(Error::Startup(_))));
        assert_eq!(controller.current_state(), ServerState::Error);

        // Explicit stop recovers to Stopped, and stopping again is a no-op.
        controller.stop().await?;
        assert_eq!(controller.current_state(), ServerState::Stopped);
        controller.stop().await?;
        assert_eq!(controller.current_state(), ServerState::Stopped);
        Ok(())
    }

    #[tokio::test]
    async fn test_subscriptions_survive_without_server() -> Result<()> {
        let controller = controller_with(ServerConfig::default())?;
        let id = controller.subscribe("telemetry", |_| {});
        assert!(controller.unsubscribe(id));
        assert!(!controller.unsubscribe(id));
        Ok(())
    }

    #[tokio::test]
    async fn test_state_changes_stream_tracks_transitions() -> Result<()> {
        let config = ServerConfig {
            command: "definitely-not-a-real-binary-4c1b".to_string(),
            ..ServerConfig::default()
        };
        let controller = controller_with(config)?;
        let rx = controller.state_changes();
        assert_eq!(*rx.borrow(), ServerState::NotStarted);

        let _ = controller.start().await;
        // Validation failure: no transition ever happened.
        assert_eq!(*rx.borrow(), ServerState::NotStarted);
        Ok(())
    }
}
