//! Append-only JSONL trace of pipeline activity.
//!
//! Every LLM call, router decision, and cache lookup lands here as one
//! JSON object per line. The cost aggregator is an offline pass over this
//! file. Writes that fail are dropped; tracing must never break the run.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// OpenAI-style token usage as reported by the endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Extra context attached to an `llm_call` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub string_ids: Vec<String>,
    #[serde(default)]
    pub is_batch: bool,
}

/// One trace record. Serialized with a `type` discriminator so readers can
/// filter without knowing every variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    LlmCall {
        step: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        model: String,
        selected_model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        router_default_model: Option<String>,
        fallback_used: bool,
        attempt_no: u32,
        latency_ms: u64,
        req_chars: usize,
        resp_chars: usize,
        usage_present: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
        meta: CallMeta,
    },
    LlmError {
        step: String,
        kind: String,
        msg: String,
        selected_model: String,
        attempt_no: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        http_status: Option<u16>,
    },
    RouterDecision {
        step: String,
        chain: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        config_hash: Option<String>,
    },
    CacheHit {
        step: String,
        string_id: String,
        model: String,
    },
    CacheMiss {
        step: String,
        string_id: String,
        model: String,
    },
    StepStart {
        step: String,
        total_rows: usize,
    },
    BatchStart {
        step: String,
        batch_id: String,
        size: usize,
        model: String,
    },
    BatchComplete {
        step: String,
        batch_id: String,
        ok_rows: usize,
        failed_rows: usize,
    },
    StepComplete {
        step: String,
        ok_rows: usize,
        failed_rows: usize,
    },
}

impl TraceEvent {
    /// Event type string as written to the `type` field.
    pub fn type_name(&self) -> &'static str {
        match self {
            TraceEvent::LlmCall { .. } => "llm_call",
            TraceEvent::LlmError { .. } => "llm_error",
            TraceEvent::RouterDecision { .. } => "router_decision",
            TraceEvent::CacheHit { .. } => "cache_hit",
            TraceEvent::CacheMiss { .. } => "cache_miss",
            TraceEvent::StepStart { .. } => "step_start",
            TraceEvent::BatchStart { .. } => "batch_start",
            TraceEvent::BatchComplete { .. } => "batch_complete",
            TraceEvent::StepComplete { .. } => "step_complete",
        }
    }
}

/// Shared sink that appends events as newline-delimited JSON.
///
/// A sink without a path swallows everything, which keeps call sites free
/// of `if trace_enabled` checks.
pub struct TraceSink {
    path: Option<PathBuf>,
    file: Mutex<Option<std::fs::File>>,
}

impl TraceSink {
    /// Open (or create) a sink at the given path. Parent directories are
    /// created on demand.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            path: Some(path),
            file: Mutex::new(None),
        }
    }

    /// A sink that drops every event.
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
        }
    }

    /// Resolve the sink path from `LLM_TRACE_PATH`, defaulting to
    /// `data/llm_trace.jsonl`. An empty value disables tracing.
    pub fn from_env() -> Self {
        match std::env::var("LLM_TRACE_PATH") {
            Ok(p) if p.trim().is_empty() => Self::disabled(),
            Ok(p) => Self::new(p.trim()),
            Err(_) => Self::new("data/llm_trace.jsonl"),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one event, stamping it with the current RFC3339 timestamp.
    /// Any failure is logged and dropped.
    pub fn emit(&self, event: &TraceEvent) {
        let Some(path) = &self.path else {
            return;
        };
        let mut value = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "trace event serialization failed");
                return;
            }
        };
        if let Value::Object(map) = &mut value {
            map.insert(
                "timestamp".to_string(),
                Value::String(chrono::Utc::now().to_rfc3339()),
            );
        }

        let mut guard = match self.file.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if guard.is_none() {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => *guard = Some(f),
                Err(e) => {
                    tracing::debug!(error = %e, "trace file open failed");
                    return;
                }
            }
        }
        if let Some(file) = guard.as_mut() {
            let line = value.to_string();
            if writeln!(file, "{}", line).is_err() {
                // Drop the handle so the next emit retries the open.
                *guard = None;
            }
        }
    }
}

/// Read raw trace events from a JSONL file.
///
/// Unparseable lines (including a truncated final line from a crashed
/// writer) are skipped.
pub fn read_events(path: impl AsRef<Path>) -> std::io::Result<Vec<Value>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(v) = serde_json::from_str::<Value>(line) {
            out.push(v);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn call_event() -> TraceEvent {
        TraceEvent::LlmCall {
            step: "translate".to_string(),
            request_id: Some("req-1".to_string()),
            model: "model-a".to_string(),
            selected_model: "model-a".to_string(),
            router_default_model: Some("model-a".to_string()),
            fallback_used: false,
            attempt_no: 0,
            latency_ms: 120,
            req_chars: 400,
            resp_chars: 200,
            usage_present: true,
            usage: Some(TokenUsage::new(100, 50)),
            meta: CallMeta {
                batch_id: Some("b0".to_string()),
                string_ids: vec!["A".to_string()],
                is_batch: true,
            },
        }
    }

    #[test]
    fn test_emit_and_read_back() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("trace.jsonl");
        let sink = TraceSink::new(&path);

        sink.emit(&call_event());
        sink.emit(&TraceEvent::CacheHit {
            step: "translate".to_string(),
            string_id: "A".to_string(),
            model: "model-a".to_string(),
        });

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "llm_call");
        assert_eq!(events[1]["type"], "cache_hit");
        assert!(events[0]["timestamp"].is_string());
    }

    #[test]
    fn test_usage_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("trace.jsonl");
        let sink = TraceSink::new(&path);
        sink.emit(&call_event());

        let events = read_events(&path).unwrap();
        assert_eq!(events[0]["usage"]["prompt_tokens"], 100);
        assert_eq!(events[0]["usage"]["completion_tokens"], 50);
        assert_eq!(events[0]["usage"]["total_tokens"], 150);
        assert_eq!(events[0]["usage_present"], true);
    }

    #[test]
    fn test_disabled_sink_is_silent() {
        let sink = TraceSink::disabled();
        sink.emit(&call_event());
        assert!(sink.path().is_none());
    }

    #[test]
    fn test_truncated_final_line_tolerated() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("trace.jsonl");
        let sink = TraceSink::new(&path);
        sink.emit(&call_event());

        // Simulate a crash mid-write.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            write!(f, "{{\"type\":\"llm_call\",\"step\":").unwrap();
        }

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_read_missing_file_is_empty() {
        let events = read_events("/nonexistent/trace.jsonl").unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_type_names() {
        assert_eq!(call_event().type_name(), "llm_call");
        let e = TraceEvent::StepComplete {
            step: "qa".to_string(),
            ok_rows: 1,
            failed_rows: 0,
        };
        assert_eq!(e.type_name(), "step_complete");
    }

    #[test]
    fn test_creates_parent_directories() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/dir/trace.jsonl");
        let sink = TraceSink::new(&path);
        sink.emit(&call_event());
        assert!(path.exists());
    }

    #[test]
    fn test_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TraceSink>();
    }
}
