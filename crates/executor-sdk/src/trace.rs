/// Sink for process lifecycle messages (spawn, signals, exit).
///
/// Production code routes these to `tracing`; tests drop them.
pub trait TraceWriter: Send + Sync {
    fn info(&self, message: &str);

    fn verbose(&self, message: &str);
}

/// Forwards to `tracing`, tagging each event with a `component` field.
#[derive(Debug, Clone)]
pub struct TracingTraceWriter {
    component: &'static str,
}

impl TracingTraceWriter {
    pub fn new(component: &'static str) -> Self {
        Self { component }
    }
}

impl Default for TracingTraceWriter {
    fn default() -> Self {
        Self::new("executor::process")
    }
}

impl TraceWriter for TracingTraceWriter {
    fn info(&self, message: &str) {
        tracing::info!(component = self.component, "{message}");
    }

    fn verbose(&self, message: &str) {
        tracing::debug!(component = self.component, "{message}");
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullTraceWriter;

impl TraceWriter for NullTraceWriter {
    fn info(&self, _message: &str) {}

    fn verbose(&self, _message: &str) {}
}
