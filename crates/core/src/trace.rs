//! Optional call tracing.
//!
//! When `REVPIPE_TRACE` names a writable path, every top-level runner entry
//! point appends one JSON line describing the call, its arguments, and its
//! outcome. The trace is a diagnostic side channel: a failure to write it
//! never fails the traced operation.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::{json, Value};

use crate::error::EngineResult;

/// Environment variable naming the trace output file.
pub const TRACE_ENV: &str = "REVPIPE_TRACE";

pub struct Tracer {
    file: Mutex<File>,
    sequence: AtomicU64,
}

impl Tracer {
    /// Open the tracer configured by `REVPIPE_TRACE`, if any. An unopenable
    /// path disables tracing rather than failing the session.
    pub fn from_env() -> Option<Self> {
        let path = std::env::var_os(TRACE_ENV)?;
        let file = OpenOptions::new().create(true).append(true).open(path).ok()?;
        Some(Self { file: Mutex::new(file), sequence: AtomicU64::new(0) })
    }

    /// Append one trace record. Write errors are swallowed.
    pub fn record<T>(&self, call: &str, arguments: Value, result: &EngineResult<T>) {
        let record = json!({
            "seq": self.sequence.fetch_add(1, Ordering::SeqCst),
            "time": chrono::Utc::now().to_rfc3339(),
            "call": call,
            "arguments": arguments,
            "outcome": match result {
                Ok(_) => json!({ "status": "ok" }),
                Err(error) => json!({ "status": "error", "message": error.to_string() }),
            },
        });
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{record}");
        }
    }
}
