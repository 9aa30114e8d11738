// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! A configurable mock analysis server for testing.
//!
//! Speaks the tether wire protocol over stdin/stdout using Content-Length
//! framed JSON. CLI flags control timing, failure modes, and event emission.
//! No tokio — uses `std::thread` for the heartbeat emitter.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::Parser;
use serde::Deserialize;
use serde_json::{Value, json};

/// Mock analysis server for integration testing.
#[derive(Parser, Debug)]
#[command(name = "mockas")]
struct Args {
    /// Accepted for launch-configuration realism; stdio is the only mode.
    #[arg(long)]
    #[allow(dead_code, reason = "flag exists to be accepted, not consulted")]
    stdio: bool,

    /// Sleep before every response (milliseconds).
    #[arg(long, default_value_t = 0)]
    response_delay: u64,

    /// Never respond to this command (repeatable).
    #[arg(long)]
    hang_on: Vec<String>,

    /// Respond with success=false for this command (repeatable).
    #[arg(long)]
    fail_on: Vec<String>,

    /// Exit after sending this many responses (simulate crash).
    #[arg(long)]
    exit_after: Option<u64>,

    /// Exit code used with --exit-after.
    #[arg(long, default_value_t = 1)]
    exit_code: i32,

    /// Emit a "heartbeat" event at this interval (milliseconds, 0 = off).
    #[arg(long, default_value_t = 0)]
    heartbeat_interval: u64,
}

/// An incoming request envelope.
#[derive(Debug, Deserialize)]
struct Request {
    #[serde(rename = "type")]
    kind: String,
    seq: u64,
    command: String,
    #[serde(default)]
    arguments: Value,
}

/// Thread-safe writer handle. Wraps `std::io::Stdout` for production,
/// or a shared `Vec<u8>` for tests.
type Writer = Arc<Mutex<Box<dyn Write + Send>>>;

/// Create a writer that forwards to stdout.
fn stdout_writer() -> Writer {
    Arc::new(Mutex::new(Box::new(std::io::stdout())))
}

#[cfg(test)]
fn buffer_writer() -> (Writer, Arc<Mutex<Vec<u8>>>) {
    let buf = Arc::new(Mutex::new(Vec::<u8>::new()));
    let writer: Box<dyn Write + Send> = Box::new(SharedVecWriter(buf.clone()));
    (Arc::new(Mutex::new(writer)), buf)
}

/// Write adapter for `Arc<Mutex<Vec<u8>>>` used in tests.
#[cfg(test)]
struct SharedVecWriter(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl Write for SharedVecWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .map_err(|e| std::io::Error::other(e.to_string()))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Shared state for the mock server.
struct MockServer {
    args: Args,
    response_count: u64,
    next_seq: u64,
    started: Instant,
    writer: Writer,
}

impl MockServer {
    fn new(args: Args, writer: Writer) -> Self {
        Self {
            args,
            response_count: 0,
            next_seq: 1,
            started: Instant::now(),
            writer,
        }
    }

    /// Run the server, reading from the given reader.
    fn run(&mut self, reader: &mut dyn Read) {
        let mut buffer = Vec::new();
        let mut temp = [0u8; 4096];

        loop {
            match reader.read(&mut temp) {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.extend_from_slice(&temp[..n]),
            }

            while let Some((message, consumed)) = try_parse_message(&buffer) {
                buffer.drain(..consumed);

                let Ok(request) = serde_json::from_str::<Request>(&message) else {
                    continue;
                };
                if request.kind != "request" {
                    continue;
                }

                self.handle_request(&request);
            }
        }
    }

    fn handle_request(&mut self, request: &Request) {
        let command = request.command.as_str();

        // Check hang_on — never respond
        if self.args.hang_on.iter().any(|c| c == command) {
            return;
        }

        if self.args.response_delay > 0 {
            std::thread::sleep(Duration::from_millis(self.args.response_delay));
        }

        // Check fail_on — respond unsuccessfully
        if self.args.fail_on.iter().any(|c| c == command) {
            self.send_response(
                request,
                false,
                Some(format!("mockas: configured to fail on {command}")),
                None,
            );
            return;
        }

        match command {
            "ping" | "/ping" => {
                self.send_response(request, true, None, Some(json!({"message": "pong"})));
            }
            "echo" => {
                self.send_response(request, true, None, Some(request.arguments.clone()));
            }
            "status" => {
                let body = json!({
                    "uptimeMs": u64::try_from(self.started.elapsed().as_millis()).unwrap_or(0),
                    "responses": self.response_count,
                });
                self.send_response(request, true, None, Some(body));
            }
            "emit" => {
                // Deterministic event trigger for dispatcher tests.
                let name = request
                    .arguments
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unnamed")
                    .to_string();
                let body = request.arguments.get("body").cloned();
                self.send_event(&name, body);
                self.send_response(request, true, None, None);
            }
            "shutdown" => {
                self.send_response(request, true, None, None);
                std::process::exit(0);
            }
            other => {
                self.send_response(
                    request,
                    false,
                    Some(format!("unknown command: {other}")),
                    None,
                );
            }
        }
    }

    fn send_response(
        &mut self,
        request: &Request,
        success: bool,
        message: Option<String>,
        body: Option<Value>,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let mut response = json!({
            "type": "response",
            "seq": seq,
            "command": request.command,
            "request_seq": request.seq,
            "running": true,
            "success": success,
        });
        if let (Some(message), Some(map)) = (message, response.as_object_mut()) {
            map.insert("message".to_string(), Value::String(message));
        }
        if let (Some(body), Some(map)) = (body, response.as_object_mut()) {
            map.insert("body".to_string(), body);
        }

        write_frame(&self.writer, &response);
        self.response_count += 1;

        if let Some(limit) = self.args.exit_after
            && self.response_count >= limit
        {
            std::process::exit(self.args.exit_code);
        }
    }

    fn send_event(&mut self, name: &str, body: Option<Value>) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let mut event = json!({
            "type": "event",
            "seq": seq,
            "event": name,
        });
        if let (Some(body), Some(map)) = (body, event.as_object_mut()) {
            map.insert("body".to_string(), body);
        }
        write_frame(&self.writer, &event);
    }
}

/// Serialize and frame a message onto the shared writer.
fn write_frame(writer: &Writer, message: &Value) {
    let Ok(body) = serde_json::to_string(message) else {
        return;
    };
    let Ok(mut writer) = writer.lock() else {
        return;
    };
    let _ = write!(writer, "Content-Length: {}\r\n\r\n{body}", body.len());
    let _ = writer.flush();
}

/// Parse one `Content-Length` framed message from the buffer.
/// Returns the body and the number of bytes consumed.
fn try_parse_message(buffer: &[u8]) -> Option<(String, usize)> {
    let header_end = buffer.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let headers = std::str::from_utf8(&buffer[..header_end - 4]).ok()?;

    let mut content_length = None;
    for line in headers.lines() {
        let lower = line.to_ascii_lowercase();
        if let Some(value) = lower.strip_prefix("content-length:") {
            content_length = value.trim().parse::<usize>().ok();
        }
    }

    let content_length = content_length?;
    let total = header_end + content_length;
    if buffer.len() < total {
        return None;
    }

    let body = String::from_utf8(buffer[header_end..total].to_vec()).ok()?;
    Some((body, total))
}

fn main() {
    let args = Args::parse();
    let writer = stdout_writer();

    if args.heartbeat_interval > 0 {
        let interval = Duration::from_millis(args.heartbeat_interval);
        let writer = writer.clone();
        std::thread::spawn(move || {
            let mut count: u64 = 0;
            loop {
                std::thread::sleep(interval);
                count += 1;
                write_frame(
                    &writer,
                    &json!({
                        "type": "event",
                        "event": "heartbeat",
                        "body": {"count": count},
                    }),
                );
            }
        });
    }

    let mut server = MockServer::new(args, writer);
    server.run(&mut std::io::stdin());
}
