//! HTTP PURGE handler for bulk cache invalidation
//!
//! A `PURGE` request bumps the namespace counter of every caching device
//! handler, which makes all of their cached classifications unreachable at
//! once.
//!
//! - `PURGE /` - invalidate with a delta of 1
//! - `PURGE /` with `X-Purge-Delta: <n>` - invalidate with a delta of n

use crate::device_handler::CachingDeviceHandler;
use crate::error::{BouncerError, Result};
use crate::metrics::BouncerMetrics;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// PURGE request handler
pub struct PurgeHandler {
    handlers: Vec<Arc<CachingDeviceHandler>>,
    /// Optional auth token
    auth_token: Option<String>,
    /// Prometheus metrics (optional)
    metrics: Option<Arc<BouncerMetrics>>,
}

/// PURGE response body
#[derive(Debug, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub success: bool,
    /// New namespace per handler name
    pub namespaces: BTreeMap<String, String>,
    pub message: String,
}

impl PurgeHandler {
    /// Create a new PURGE handler
    pub fn new(handlers: Vec<Arc<CachingDeviceHandler>>) -> Self {
        Self {
            handlers,
            auth_token: None,
            metrics: None,
        }
    }

    /// Require this token on every purge request
    pub fn with_auth(mut self, auth_token: String) -> Self {
        self.auth_token = Some(auth_token);
        self
    }

    /// Enable Prometheus metrics
    pub fn with_metrics(mut self, metrics: Arc<BouncerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Handle HTTP PURGE request
    pub async fn handle_purge<B>(&self, req: &Request<B>) -> Result<Response<Full<Bytes>>> {
        if req.method().as_str() != "PURGE" {
            return self.error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "Only PURGE method is allowed",
            );
        }

        if let Err(e) = self.check_auth(req) {
            self.record("unauthorized");
            return self.error_response(StatusCode::UNAUTHORIZED, &e.to_string());
        }

        let delta = match Self::purge_delta(req) {
            Ok(delta) => delta,
            Err(e) => {
                self.record("failure");
                return self.error_response(StatusCode::BAD_REQUEST, &e.to_string());
            }
        };

        let mut namespaces = BTreeMap::new();
        for handler in &self.handlers {
            let name = handler.config().name.clone();
            match handler.invalidate(delta).await {
                Ok(namespace) => {
                    info!("Purged handler '{}', namespace now {}", name, namespace);
                    namespaces.insert(name, namespace);
                }
                Err(e) => {
                    warn!("Failed to purge handler '{}': {}", name, e);
                    self.record("failure");
                    return self.error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &format!("Failed to purge handler '{}': {}", name, e),
                    );
                }
            }
        }

        self.record("success");
        let response = PurgeResponse {
            success: true,
            message: format!("Invalidated {} handler namespaces", namespaces.len()),
            namespaces,
        };
        self.json_response(StatusCode::OK, &response)
    }

    /// Check authentication
    fn check_auth<B>(&self, req: &Request<B>) -> Result<()> {
        let Some(expected_token) = &self.auth_token else {
            return Ok(());
        };

        // Support both "Bearer <token>" and direct token
        let bearer = req
            .headers()
            .get("authorization")
            .and_then(|h| h.to_str().ok())
            .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth));
        let header_token = req
            .headers()
            .get("x-purge-token")
            .and_then(|h| h.to_str().ok());

        if bearer == Some(expected_token.as_str()) || header_token == Some(expected_token.as_str()) {
            Ok(())
        } else {
            Err(BouncerError::Unauthorized(
                "Invalid or missing authentication token".to_string(),
            ))
        }
    }

    fn purge_delta<B>(req: &Request<B>) -> Result<u64> {
        match req.headers().get("x-purge-delta") {
            None => Ok(1),
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|delta| *delta > 0)
                .ok_or_else(|| {
                    BouncerError::HttpError("X-Purge-Delta must be a positive integer".to_string())
                }),
        }
    }

    fn record(&self, result: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_purge(result);
        }
    }

    /// Build JSON response
    fn json_response(
        &self,
        status: StatusCode,
        body: &PurgeResponse,
    ) -> Result<Response<Full<Bytes>>> {
        let json = serde_json::to_string(body)?;

        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .header("cache-control", "no-cache, no-store, must-revalidate")
            .body(Full::new(Bytes::from(json)))
            .map_err(|e| BouncerError::HttpError(format!("Failed to build response: {}", e)))
    }

    /// Build error response
    fn error_response(&self, status: StatusCode, message: &str) -> Result<Response<Full<Bytes>>> {
        let response = PurgeResponse {
            success: false,
            namespaces: BTreeMap::new(),
            message: message.to_string(),
        };

        self.json_response(status, &response)
    }
}
