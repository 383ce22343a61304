//! Pipeline handler contract
//!
//! Every participant of the request pipeline implements [`Handler`]:
//! an async `setup` run once before the service accepts requests, a
//! per-request `handle` that writes into the shared response accumulator and
//! returns a body chunk, and an async `teardown` run at shutdown.

use crate::config::StaticHandlerConfig;
use crate::error::Result;
use crate::models::{BouncerRequest, ResponseAccumulator};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// A pluggable unit of request processing
#[async_trait]
pub trait Handler: Send + Sync {
    /// Name used in logs and error reports
    fn name(&self) -> &str;

    /// Acquire resources; a failure aborts service startup
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Contribute to the response and return a body chunk
    async fn handle(
        &self,
        request: &BouncerRequest,
        response: &mut ResponseAccumulator,
    ) -> Result<String>;

    /// Release resources acquired in `setup`
    async fn teardown(&self) -> Result<()> {
        Ok(())
    }
}

/// Handler that contributes a fixed set of headers, cookies and body
#[derive(Debug, Clone, Default)]
pub struct StaticHandler {
    name: String,
    headers: BTreeMap<String, String>,
    cookies: Vec<(String, String)>,
    body: String,
}

impl StaticHandler {
    pub fn new(name: impl Into<String>) -> Self {
        StaticHandler {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Build a handler from its configuration block
    pub fn from_config(config: &StaticHandlerConfig) -> Self {
        StaticHandler {
            name: config.name.clone(),
            headers: config.headers.clone(),
            cookies: config
                .cookies
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            body: config.body.clone(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }
}

#[async_trait]
impl Handler for StaticHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        _request: &BouncerRequest,
        response: &mut ResponseAccumulator,
    ) -> Result<String> {
        for (name, value) in &self.headers {
            response.set_header(name, value);
        }
        for (name, value) in &self.cookies {
            response.add_cookie(name, value);
        }
        Ok(self.body.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_handler_contribution() {
        let handler = StaticHandler::new("static")
            .with_header("X-UA-Type", "small")
            .with_cookie("UA-Foo", "bar")
            .with_body("foo");

        let mut response = ResponseAccumulator::new();
        let body = handler
            .handle(&BouncerRequest::new("/"), &mut response)
            .await
            .unwrap();

        assert_eq!(body, "foo");
        assert_eq!(response.header("x-ua-type"), Some("small"));
        assert_eq!(response.cookies(), ["UA-Foo=bar"]);
        assert!(handler.setup().await.is_ok());
        assert!(handler.teardown().await.is_ok());
    }
}
