//! Tracer port for observability.
//!
//! The executor receives a tracer handle at construction (no process-wide
//! provider). `LogTracer` forwards spans to `tracing`; `NoopTracer` is
//! silent and is the default for tests.

use std::time::Instant;

use tracing::{info, warn};
use uuid::Uuid;

/// A scoped handle for a unit of work.
///
/// Attributes can be added while the span is open; implementations decide
/// what happens when the guard is dropped.
pub trait SpanGuard: Send {
    /// Sets an attribute on this span.
    fn set_attribute(&mut self, key: &str, value: String);

    /// Records an error on this span.
    fn record_error(&mut self, error: &str);

    /// The trace id for correlating results with traces, if any.
    fn trace_id(&self) -> Option<String>;
}

/// Port for tracing. Safe to no-op.
pub trait Tracer: Send + Sync {
    /// Opens a span for a unit of work.
    fn span(&self, name: &str, attributes: &[(&str, String)]) -> Box<dyn SpanGuard>;
}

/// Silent tracer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

struct NoopSpan;

impl SpanGuard for NoopSpan {
    fn set_attribute(&mut self, _key: &str, _value: String) {}

    fn record_error(&mut self, _error: &str) {}

    fn trace_id(&self) -> Option<String> {
        None
    }
}

impl Tracer for NoopTracer {
    fn span(&self, _name: &str, _attributes: &[(&str, String)]) -> Box<dyn SpanGuard> {
        Box::new(NoopSpan)
    }
}

/// Tracer that emits `tracing` events with span durations.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracer;

struct LogSpan {
    name: String,
    trace_id: String,
    attributes: Vec<(String, String)>,
    started: Instant,
}

impl SpanGuard for LogSpan {
    fn set_attribute(&mut self, key: &str, value: String) {
        self.attributes.push((key.to_string(), value));
    }

    fn record_error(&mut self, error: &str) {
        warn!(span = %self.name, trace_id = %self.trace_id, error = %error, "span error");
        self.attributes.push(("error".to_string(), error.to_string()));
    }

    fn trace_id(&self) -> Option<String> {
        Some(self.trace_id.clone())
    }
}

impl Drop for LogSpan {
    fn drop(&mut self) {
        let attrs = self
            .attributes
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        info!(
            span = %self.name,
            trace_id = %self.trace_id,
            duration_ms = self.started.elapsed().as_millis() as u64,
            attributes = %attrs,
            "span closed"
        );
    }
}

impl Tracer for LogTracer {
    fn span(&self, name: &str, attributes: &[(&str, String)]) -> Box<dyn SpanGuard> {
        let trace_id = Uuid::new_v4().to_string();
        info!(span = %name, trace_id = %trace_id, "span opened");
        Box::new(LogSpan {
            name: name.to_string(),
            trace_id,
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            started: Instant::now(),
        })
    }
}
