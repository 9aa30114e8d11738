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

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from file/environment and injected into
/// the controller at construction. Nothing reads it from global state after
/// that point.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// The managed analysis server.
    #[serde(default)]
    pub server: ServerConfig,
}

/// Launch parameters and policies for one managed analysis server.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// The executable to launch (e.g., "analysis-server"). Resolved via PATH
    /// unless it is an absolute or relative path.
    #[serde(default)]
    pub command: String,

    /// Arguments to pass to the executable.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the spawned process (defaults to the current one).
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Command sent as the readiness handshake after launch.
    #[serde(default = "default_handshake_command")]
    pub handshake_command: String,

    /// Command sent as a courtesy before the process is signalled on stop.
    #[serde(default = "default_shutdown_command")]
    pub shutdown_command: String,

    /// Deadline for spawn-plus-handshake in milliseconds.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Per-request deadline in milliseconds unless overridden at the call site.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Grace period between the termination signal and a forced kill.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Restart automatically after an unexpected exit.
    #[serde(default = "default_true")]
    pub auto_restart: bool,

    /// Restart budget before the controller gives up and stays in error.
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,

    /// Base delay before the first automatic restart; doubles per attempt.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Upper bound on concurrently pending requests. Requests beyond it fail
    /// immediately instead of queuing.
    #[serde(default = "default_max_pending_requests")]
    pub max_pending_requests: usize,

    /// Circuit breaker thresholds for outbound sends.
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Retry policy for transient send failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Circuit breaker thresholds.
#[derive(Debug, Deserialize, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time the breaker stays open before allowing a half-open trial.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

/// Retry policy for transient send failures.
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Total attempts per logical request (1 = no retries).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles per attempt.
    #[serde(default = "default_retry_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on the computed backoff delay.
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_handshake_command() -> String {
    "ping".to_string()
}

fn default_shutdown_command() -> String {
    "shutdown".to_string()
}

const fn default_startup_timeout_ms() -> u64 {
    10_000
}

const fn default_request_timeout_ms() -> u64 {
    30_000
}

const fn default_stop_grace_ms() -> u64 {
    2_000
}

const fn default_true() -> bool {
    true
}

const fn default_max_restart_attempts() -> u32 {
    3
}

const fn default_restart_delay_ms() -> u64 {
    500
}

const fn default_max_pending_requests() -> usize {
    256
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_reset_timeout_ms() -> u64 {
    30_000
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_retry_delay_ms() -> u64 {
    50
}

const fn default_retry_max_delay_ms() -> u64 {
    2_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            working_dir: None,
            handshake_command: default_handshake_command(),
            shutdown_command: default_shutdown_command(),
            startup_timeout_ms: default_startup_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            auto_restart: default_true(),
            max_restart_attempts: default_max_restart_attempts(),
            restart_delay_ms: default_restart_delay_ms(),
            max_pending_requests: default_max_pending_requests(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_retry_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl ServerConfig {
    /// Deadline for spawn-plus-handshake.
    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Default per-request deadline.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Grace period before a forced kill on stop.
    #[must_use]
    pub const fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Base delay before the first automatic restart.
    #[must_use]
    pub const fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl Config {
    /// Load configuration from standard paths or a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or does not deserialize
    /// into [`Config`].
    pub fn load(explicit_file: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // 1. Load from user config directory (~/.config/tether/config.toml)
        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("tether").join("config.toml");
            if config_path.exists() {
                builder = builder.add_source(config::File::from(config_path));
            }
        }

        // 2. Load from explicit file if provided
        if let Some(path) = explicit_file {
            builder = builder.add_source(config::File::from(path));
        }

        // 3. Load from environment variables (TETHER_*, e.g. TETHER_SERVER)
        builder = builder.add_source(config::Environment::with_prefix("TETHER"));

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}
