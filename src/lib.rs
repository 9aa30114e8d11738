// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Tether supervises an out-of-process language-analysis server and exchanges
//! typed, asynchronous messages with it over stdin/stdout using
//! Content-Length framed JSON.
//!
//! The [`analyzer::AnalyzerController`] facade owns the process, the framed
//! channel, request correlation, event fan-out, and the resilience layer;
//! editor-feature consumers talk to it through `send_request` and event
//! subscriptions and observe lifecycle changes through its state stream.

/// Lifecycle controller and its sub-components.
pub mod analyzer;
/// Command-line interface definitions and utilities.
pub mod cli;
/// Configuration for the managed server and its policies.
pub mod config;
/// Typed failure taxonomy.
pub mod error;
/// Session records and event broadcasting.
pub mod session;
