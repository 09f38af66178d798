//! Interceptor pipeline.
//!
//! Embedders register request and response interceptors before the server
//! starts; the pipeline is handed to the server by value, so the list cannot
//! change while traffic is flowing. Interceptors run in ascending priority
//! order (ties resolved by registration order) and may mutate the message in
//! place. A failing interceptor is logged and skipped: the message reverts
//! to its state from before that interceptor ran and the pipeline continues.

use std::sync::Arc;

use crate::flow::FlowContext;
use crate::http_message::{HttpRequest, HttpResponse};
use crate::logger::ProxyLogger;

/// Default priority for interceptors that do not care about ordering.
pub const DEFAULT_PRIORITY: i32 = 50;

pub trait RequestInterceptor: Send + Sync {
    /// Name used in diagnostics when this interceptor fails.
    fn name(&self) -> &str;

    /// Lower priorities run earlier.
    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    /// Inspect and mutate an outgoing request. Returning an error skips this
    /// interceptor's changes; it never aborts the flow.
    fn intercept(&self, request: &mut HttpRequest, ctx: &FlowContext) -> anyhow::Result<()>;
}

pub trait ResponseInterceptor: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    fn intercept(&self, response: &mut HttpResponse, ctx: &FlowContext) -> anyhow::Result<()>;
}

/// Ordered interceptor chains, fixed at server construction.
#[derive(Default)]
pub struct InterceptorPipeline {
    request: Vec<Arc<dyn RequestInterceptor>>,
    response: Vec<Arc<dyn ResponseInterceptor>>,
}

impl InterceptorPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_request(&mut self, interceptor: Arc<dyn RequestInterceptor>) {
        self.request.push(interceptor);
        // Stable sort keeps registration order within equal priorities.
        self.request.sort_by_key(|i| i.priority());
    }

    pub fn register_response(&mut self, interceptor: Arc<dyn ResponseInterceptor>) {
        self.response.push(interceptor);
        self.response.sort_by_key(|i| i.priority());
    }

    pub fn request_count(&self) -> usize {
        self.request.len()
    }

    pub fn response_count(&self) -> usize {
        self.response.len()
    }

    /// Run the request chain. Failures are isolated per interceptor.
    pub fn apply_request(
        &self,
        mut request: HttpRequest,
        ctx: &FlowContext,
        logger: &dyn ProxyLogger,
    ) -> HttpRequest {
        for interceptor in &self.request {
            let snapshot = request.clone();
            if let Err(err) = interceptor.intercept(&mut request, ctx) {
                logger.log_error(
                    err.as_ref(),
                    &format!(
                        "request interceptor {:?} failed; skipping it",
                        interceptor.name()
                    ),
                );
                request = snapshot;
            }
        }
        request
    }

    /// Run the response chain. Failures are isolated per interceptor.
    pub fn apply_response(
        &self,
        mut response: HttpResponse,
        ctx: &FlowContext,
        logger: &dyn ProxyLogger,
    ) -> HttpResponse {
        for interceptor in &self.response {
            let snapshot = response.clone();
            if let Err(err) = interceptor.intercept(&mut response, ctx) {
                logger.log_error(
                    err.as_ref(),
                    &format!(
                        "response interceptor {:?} failed; skipping it",
                        interceptor.name()
                    ),
                );
                response = snapshot;
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_message::{Headers, RequestTarget, Version};
    use bytes::Bytes;
    use std::sync::Mutex;

    struct TagHeader {
        name: String,
        priority: i32,
        value: &'static str,
    }

    impl RequestInterceptor for TagHeader {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn intercept(&self, request: &mut HttpRequest, _ctx: &FlowContext) -> anyhow::Result<()> {
            // Append so tests can observe execution order.
            request.headers.push("X-Order", self.value);
            Ok(())
        }
    }

    struct Faulty;

    impl RequestInterceptor for Faulty {
        fn name(&self) -> &str {
            "faulty"
        }

        fn priority(&self) -> i32 {
            10
        }

        fn intercept(&self, request: &mut HttpRequest, _ctx: &FlowContext) -> anyhow::Result<()> {
            // Mutate, then fail: the mutation must not survive.
            request.headers.push("X-Should-Not-Exist", "1");
            anyhow::bail!("interceptor exploded")
        }
    }

    struct CollectingLogger {
        errors: Mutex<Vec<String>>,
    }

    impl ProxyLogger for CollectingLogger {
        fn log_info(&self, _message: &str) {}
        fn log_warn(&self, _message: &str) {}
        fn log_error(&self, _error: &dyn std::error::Error, message: &str) {
            self.errors.lock().unwrap().push(message.to_string());
        }
        fn log_flow(&self, _flow: &crate::flow::Flow) {}
    }

    fn request() -> HttpRequest {
        HttpRequest {
            method: "GET".to_string(),
            target: RequestTarget::Origin {
                path_and_query: "/".to_string(),
            },
            version: Version::Http11,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    fn ctx() -> FlowContext {
        FlowContext::new("127.0.0.1:1".to_string())
    }

    #[test]
    fn priority_order_with_registration_tiebreak() {
        let mut pipeline = InterceptorPipeline::new();
        pipeline.register_request(Arc::new(TagHeader {
            name: "late".into(),
            priority: 90,
            value: "late",
        }));
        pipeline.register_request(Arc::new(TagHeader {
            name: "early".into(),
            priority: 10,
            value: "early",
        }));
        pipeline.register_request(Arc::new(TagHeader {
            name: "tie-a".into(),
            priority: 50,
            value: "tie-a",
        }));
        pipeline.register_request(Arc::new(TagHeader {
            name: "tie-b".into(),
            priority: 50,
            value: "tie-b",
        }));

        let logger = CollectingLogger {
            errors: Mutex::new(Vec::new()),
        };
        let out = pipeline.apply_request(request(), &ctx(), &logger);
        let order: Vec<&str> = out.headers.get_all("X-Order").collect();
        assert_eq!(order, vec!["early", "tie-a", "tie-b", "late"]);
    }

    #[test]
    fn faulty_interceptor_is_isolated() {
        let mut pipeline = InterceptorPipeline::new();
        pipeline.register_request(Arc::new(Faulty));
        pipeline.register_request(Arc::new(TagHeader {
            name: "tagger".into(),
            priority: 50,
            value: "ran",
        }));

        let logger = CollectingLogger {
            errors: Mutex::new(Vec::new()),
        };
        let out = pipeline.apply_request(request(), &ctx(), &logger);

        // The faulty interceptor's partial mutation was rolled back, and the
        // next interceptor still ran.
        assert!(out.headers.get("X-Should-Not-Exist").is_none());
        assert_eq!(out.headers.get("X-Order"), Some("ran"));

        let errors = logger.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("faulty"));
    }

    #[test]
    fn response_chain_is_symmetric() {
        struct SetServer;
        impl ResponseInterceptor for SetServer {
            fn name(&self) -> &str {
                "set-server"
            }
            fn intercept(
                &self,
                response: &mut HttpResponse,
                _ctx: &FlowContext,
            ) -> anyhow::Result<()> {
                response.headers.set("Server", "snitcher");
                Ok(())
            }
        }

        let mut pipeline = InterceptorPipeline::new();
        pipeline.register_response(Arc::new(SetServer));
        let logger = CollectingLogger {
            errors: Mutex::new(Vec::new()),
        };
        let resp = HttpResponse::synthetic(200, "OK", "");
        let out = pipeline.apply_response(resp, &ctx(), &logger);
        assert_eq!(out.headers.get("Server"), Some("snitcher"));
    }
}
