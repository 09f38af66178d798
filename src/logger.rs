//! Logger port.
//!
//! The core never talks to a logging backend directly; it calls this trait,
//! which the embedder provides. [`TracingLogger`] is the default
//! implementation, forwarding to the `tracing` macros.

use std::error::Error;

use crate::flow::Flow;

/// Capability handed to the proxy by the embedder for all diagnostics.
pub trait ProxyLogger: Send + Sync {
    fn log_info(&self, message: &str);

    fn log_warn(&self, message: &str);

    fn log_error(&self, error: &dyn Error, message: &str);

    /// Called once per completed or failed flow when flow logging is enabled.
    fn log_flow(&self, flow: &Flow);
}

/// Default logger backed by the `tracing` macros.
pub struct TracingLogger;

impl ProxyLogger for TracingLogger {
    fn log_info(&self, message: &str) {
        tracing::info!("{message}");
    }

    fn log_warn(&self, message: &str) {
        tracing::warn!("{message}");
    }

    fn log_error(&self, error: &dyn Error, message: &str) {
        tracing::error!(error = %error, "{message}");
    }

    fn log_flow(&self, flow: &Flow) {
        tracing::info!(
            id = %flow.id,
            client = %flow.client_addr,
            method = %flow.request.method,
            url = %flow.request.target,
            status = ?flow.status,
            duration_ms = flow.duration.as_millis() as u64,
            "flow"
        );
    }
}

/// Logger that discards everything. Useful for embedders that only consume
/// flow events.
pub struct NullLogger;

impl ProxyLogger for NullLogger {
    fn log_info(&self, _message: &str) {}
    fn log_warn(&self, _message: &str) {}
    fn log_error(&self, _error: &dyn Error, _message: &str) {}
    fn log_flow(&self, _flow: &Flow) {}
}
