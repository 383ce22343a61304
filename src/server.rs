//! HTTP front end
//!
//! Routes incoming requests to the admin endpoints or through the handler
//! pipeline, and runs the hyper accept loop.
//!
//! | Request          | Served by                      |
//! |------------------|--------------------------------|
//! | `PURGE *`        | [`PurgeHandler`] (if enabled)  |
//! | `GET /metrics`   | Prometheus text exposition     |
//! | `GET /health`    | `200 OK`                       |
//! | anything else    | [`RequestDispatcher`]          |

use crate::classifier::{Classifier, RuleClassifier};
use crate::config::{BouncerConfig, HandlerConfig};
use crate::device_handler::CachingDeviceHandler;
use crate::dispatcher::RequestDispatcher;
use crate::error::{BouncerError, Result};
use crate::handler::{Handler, StaticHandler};
use crate::metrics::BouncerMetrics;
use crate::models::BouncerRequest;
use crate::purge_handler::PurgeHandler;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// The assembled service: pipeline plus admin endpoints
pub struct BouncerServer {
    dispatcher: Arc<RequestDispatcher>,
    purge: Option<Arc<PurgeHandler>>,
    metrics: Option<Arc<BouncerMetrics>>,
}

impl BouncerServer {
    pub fn new(dispatcher: Arc<RequestDispatcher>) -> Self {
        BouncerServer {
            dispatcher,
            purge: None,
            metrics: None,
        }
    }

    /// Accept PURGE requests
    pub fn with_purge(mut self, purge: Arc<PurgeHandler>) -> Self {
        self.purge = Some(purge);
        self
    }

    /// Serve `/metrics` from this collector
    pub fn with_metrics(mut self, metrics: Arc<BouncerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build and set up the whole service from configuration
    ///
    /// # Returns
    /// * `Ok(BouncerServer)` once every handler's setup has completed
    /// * `Err(BouncerError::SetupFailure)` if any handler failed to set up
    pub async fn from_config(config: &BouncerConfig) -> Result<Self> {
        let metrics = if config.metrics_enabled {
            let metrics = BouncerMetrics::new().map_err(|e| {
                BouncerError::InternalError(format!("Failed to register metrics: {}", e))
            })?;
            Some(Arc::new(metrics))
        } else {
            None
        };

        let classifier: Arc<dyn Classifier> =
            Arc::new(RuleClassifier::new(config.classifier.effective_rules()));

        let mut handlers: Vec<Arc<dyn Handler>> = Vec::with_capacity(config.handlers.len());
        let mut device_handlers = Vec::new();
        for handler_config in &config.handlers {
            match handler_config {
                HandlerConfig::Device(device_config) => {
                    let mut handler = CachingDeviceHandler::from_config(
                        device_config.clone(),
                        Arc::clone(&classifier),
                    );
                    if let Some(metrics) = &metrics {
                        handler = handler.with_metrics(Arc::clone(metrics));
                    }
                    let handler = Arc::new(handler);
                    device_handlers.push(Arc::clone(&handler));
                    handlers.push(handler);
                }
                HandlerConfig::Static(static_config) => {
                    handlers.push(Arc::new(StaticHandler::from_config(static_config)));
                }
            }
        }

        let mut dispatcher = RequestDispatcher::start(handlers).await?;
        if let Some(metrics) = &metrics {
            dispatcher = dispatcher.with_metrics(Arc::clone(metrics));
        }

        let mut server = BouncerServer::new(Arc::new(dispatcher));
        if config.admin.enabled {
            let mut purge = PurgeHandler::new(device_handlers);
            if let Some(token) = &config.admin.auth_token {
                purge = purge.with_auth(token.clone());
            }
            if let Some(metrics) = &metrics {
                purge = purge.with_metrics(Arc::clone(metrics));
            }
            server = server.with_purge(Arc::new(purge));
        }
        if let Some(metrics) = metrics {
            server = server.with_metrics(metrics);
        }

        Ok(server)
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    /// Produce the response for one request
    ///
    /// Never fails: errors are turned into plain-text error responses.
    pub async fn route<B>(&self, req: Request<B>) -> Response<Full<Bytes>> {
        // Only the head is used; the body is never read
        let (parts, _body) = req.into_parts();
        let req = Request::from_parts(parts, ());

        if req.method().as_str() == "PURGE" {
            return match &self.purge {
                Some(purge) => purge
                    .handle_purge(&req)
                    .await
                    .unwrap_or_else(|e| {
                        let status = StatusCode::from_u16(e.to_http_status())
                            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                        error_response(status, &e.to_string())
                    }),
                None => error_response(StatusCode::METHOD_NOT_ALLOWED, "PURGE is disabled"),
            };
        }

        if req.method() == Method::GET {
            match req.uri().path() {
                "/health" => return text_response(StatusCode::OK, "text/plain", "OK".into()),
                "/metrics" => return self.metrics_response(),
                _ => {}
            }
        }

        let request = BouncerRequest::from_http(&req);
        match self.dispatcher.dispatch(&request).await.into_http() {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to build response for {}: {}", request.path, e);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }

    fn metrics_response(&self) -> Response<Full<Bytes>> {
        let Some(metrics) = &self.metrics else {
            return error_response(StatusCode::NOT_FOUND, "Not Found");
        };
        match metrics.encode() {
            Ok((content_type, body)) => text_response(StatusCode::OK, &content_type, body.into()),
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }

    /// Accept connections until `shutdown` resolves
    ///
    /// Connections already being served are left to finish on their own.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        info!("UA bouncer listening on http://{}", addr);

        tokio::pin!(shutdown);
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = &mut shutdown => {
                    info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
            };
            debug!("Accepted connection from {}", peer);

            let io = TokioIo::new(stream);
            let server = Arc::clone(&self);
            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { Ok::<_, hyper::Error>(server.route(req).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection: {:?}", err);
                }
            });
        }

        Ok(())
    }

    /// Tear down every pipeline handler
    pub async fn shutdown(&self) -> Result<()> {
        self.dispatcher.shutdown().await
    }
}

fn text_response(status: StatusCode, content_type: &str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    if let Ok(value) = http::HeaderValue::from_str(content_type) {
        response.headers_mut().insert(http::header::CONTENT_TYPE, value);
    }
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    text_response(status, "text/plain", Bytes::from(message.to_string()))
}
