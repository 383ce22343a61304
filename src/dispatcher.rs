//! Request dispatcher ("bouncer")
//!
//! Runs an ordered list of handlers against one request and assembles one
//! response. Handlers run strictly one after the other because later
//! handlers may depend on headers or cookies written by earlier ones.

use crate::error::{BouncerError, Result};
use crate::handler::Handler;
use crate::metrics::BouncerMetrics;
use crate::models::{BouncerRequest, FinalResponse, ResponseAccumulator};
use futures::future::{join_all, try_join_all};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Ordered pipeline of handlers, ready to serve requests
///
/// A dispatcher can only be obtained through [`RequestDispatcher::start`],
/// which resolves after every handler has been set up.
pub struct RequestDispatcher {
    handlers: Vec<Arc<dyn Handler>>,
    metrics: Option<Arc<BouncerMetrics>>,
}

impl RequestDispatcher {
    /// Set up all handlers concurrently and return a ready dispatcher
    ///
    /// # Returns
    /// * `Ok(RequestDispatcher)` once every `setup` succeeded
    /// * `Err(BouncerError::SetupFailure)` naming the first handler that failed
    pub async fn start(handlers: Vec<Arc<dyn Handler>>) -> Result<Self> {
        info!("Setting up {} handlers", handlers.len());

        try_join_all(handlers.iter().map(|handler| async move {
            handler.setup().await.map_err(|e| match e {
                BouncerError::SetupFailure { .. } => e,
                other => BouncerError::setup_failure(handler.name(), other),
            })
        }))
        .await
        .map_err(|e| {
            error!("Pipeline setup failed: {}", e);
            e
        })?;

        info!("All handlers ready");
        Ok(RequestDispatcher {
            handlers,
            metrics: None,
        })
    }

    /// Enable Prometheus metrics
    pub fn with_metrics(mut self, metrics: Arc<BouncerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn handlers(&self) -> &[Arc<dyn Handler>] {
        &self.handlers
    }

    /// Run the pipeline for one request
    ///
    /// # Returns
    /// * `Ok(FinalResponse)` with the concatenated body of all handlers
    /// * `Err(BouncerError::HandlerFailure)` if a handler failed; the
    ///   remaining handlers are skipped
    pub async fn run(&self, request: &BouncerRequest) -> Result<FinalResponse> {
        let mut response = ResponseAccumulator::new();

        for handler in &self.handlers {
            let chunk = handler
                .handle(request, &mut response)
                .await
                .map_err(|e| match e {
                    BouncerError::HandlerFailure { .. } => e,
                    other => BouncerError::handler_failure(handler.name(), other),
                })?;
            response.push_chunk(chunk);
        }

        Ok(response.finish())
    }

    /// Run the pipeline, turning a handler failure into a generic 500
    pub async fn dispatch(&self, request: &BouncerRequest) -> FinalResponse {
        let response = match self.run(request).await {
            Ok(response) => response,
            Err(e) => {
                let handler = match &e {
                    BouncerError::HandlerFailure { handler, .. } => handler.clone(),
                    _ => "unknown".to_string(),
                };
                error!(
                    "Request {} {} failed in handler '{}': {}",
                    request.method, request.path, handler, e
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_handler_failure(&handler);
                }
                FinalResponse::server_error()
            }
        };

        debug!(
            "{} {} -> {}",
            request.method,
            request.path_and_query(),
            response.status
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_request(response.status);
        }
        response
    }

    /// Tear down every handler
    ///
    /// All teardowns are awaited even if some fail; the first failure is
    /// returned.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Tearing down {} handlers", self.handlers.len());
        let results = join_all(self.handlers.iter().map(|handler| async move {
            handler.teardown().await.map_err(|e| {
                error!("Teardown of handler '{}' failed: {}", handler.name(), e);
                e
            })
        }))
        .await;

        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }
}
