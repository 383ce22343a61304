//! Core data models for the request pipeline
//!
//! A [`BouncerRequest`] is the read-only view every handler receives, and a
//! [`ResponseAccumulator`] is the single mutable response that all handlers
//! of one request write into. Once the pipeline has run, the accumulator is
//! frozen into a [`FinalResponse`] and converted to an `http::Response`.

use crate::error::{BouncerError, Result};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, COOKIE, LOCATION, SET_COOKIE, USER_AGENT};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use std::collections::BTreeMap;

/// Incoming request as seen by pipeline handlers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BouncerRequest {
    /// HTTP method (e.g., "GET")
    pub method: String,
    /// Request path without the query string
    pub path: String,
    /// Raw query string, if any
    pub query: Option<String>,
    /// Header values by lower-cased header name, in arrival order
    pub headers: BTreeMap<String, Vec<String>>,
    /// Cookie pairs sent by the client
    pub cookies: Vec<(String, String)>,
    /// User-Agent header value, empty when absent
    ///
    /// Decoded lossily when the header is not valid UTF-8; use
    /// `user_agent_raw` wherever distinct user-agents must stay distinct.
    pub user_agent: String,
    /// User-Agent header exactly as received
    pub user_agent_raw: Bytes,
}

impl BouncerRequest {
    /// Create a GET request for a path (which may carry a query string)
    pub fn new(path_and_query: &str) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (path_and_query.to_string(), None),
        };
        BouncerRequest {
            method: "GET".to_string(),
            path,
            query,
            ..Default::default()
        }
    }

    /// Add a header value, keeping earlier values for the same name
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name == USER_AGENT.as_str() && self.user_agent_raw.is_empty() {
            self.user_agent = value.to_string();
            self.user_agent_raw = Bytes::copy_from_slice(value.as_bytes());
        }
        if name == COOKIE.as_str() {
            self.cookies.extend(parse_cookie_header(value));
        }
        self.headers.entry(name).or_default().push(value.to_string());
        self
    }

    /// Set the User-Agent header
    pub fn with_user_agent(self, user_agent: &str) -> Self {
        self.with_header(USER_AGENT.as_str(), user_agent)
    }

    /// Add a client cookie
    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.push((name.to_string(), value.to_string()));
        self
    }

    /// Build a pipeline request from an `http::Request`
    ///
    /// Header values that are not valid UTF-8 are decoded lossily; the body
    /// is never read.
    pub fn from_http<B>(req: &Request<B>) -> Self {
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in req.headers() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let cookies = headers
            .get(COOKIE.as_str())
            .map(|values| values.iter().flat_map(|v| parse_cookie_header(v)).collect())
            .unwrap_or_default();

        let user_agent_raw = req
            .headers()
            .get(USER_AGENT)
            .map(|value| Bytes::copy_from_slice(value.as_bytes()))
            .unwrap_or_default();
        let user_agent = String::from_utf8_lossy(&user_agent_raw).into_owned();

        BouncerRequest {
            method: req.method().as_str().to_string(),
            path: req.uri().path().to_string(),
            query: req.uri().query().map(str::to_string),
            headers,
            cookies,
            user_agent,
            user_agent_raw,
        }
    }

    /// First value of a header, looked up case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Value of a client cookie
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Path plus query string, as the client requested it
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

/// Parse a `Cookie` header into name/value pairs
fn parse_cookie_header(value: &str) -> Vec<(String, String)> {
    value
        .split(';')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            match pair.split_once('=') {
                Some((name, value)) => Some((name.trim().to_string(), value.trim().to_string())),
                None => Some((pair.to_string(), String::new())),
            }
        })
        .collect()
}

/// Mutable response shared by every handler of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseAccumulator {
    status: u16,
    headers: BTreeMap<String, String>,
    cookies: Vec<String>,
    body: Vec<String>,
}

impl Default for ResponseAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        ResponseAccumulator {
            status: 200,
            headers: BTreeMap::new(),
            cookies: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Set a header, replacing any earlier value for the same name
    ///
    /// Names are stored lower-cased since HTTP header names are
    /// case-insensitive.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Append a `Set-Cookie` directive (`name=value`)
    pub fn add_cookie(&mut self, name: &str, value: &str) {
        self.cookies.push(format!("{}={}", name, value));
    }

    /// Append a raw `Set-Cookie` directive as-is
    pub fn push_cookie(&mut self, directive: String) {
        self.cookies.push(directive);
    }

    pub fn cookies(&self) -> &[String] {
        &self.cookies
    }

    /// Whether any `Set-Cookie` directive sets the named cookie
    pub fn sets_cookie(&self, name: &str) -> bool {
        self.cookies.iter().any(|directive| {
            directive
                .split(';')
                .next()
                .and_then(|pair| pair.split_once('='))
                .map(|(n, _)| n.trim() == name)
                .unwrap_or(false)
        })
    }

    /// Append a body chunk
    pub fn push_chunk(&mut self, chunk: String) {
        self.body.push(chunk);
    }

    /// Turn the response into a 302 redirect
    pub fn redirect(&mut self, location: &str) {
        self.status = StatusCode::FOUND.as_u16();
        self.set_header(LOCATION.as_str(), location);
    }

    /// Freeze the accumulated state once the pipeline has finished
    pub fn finish(self) -> FinalResponse {
        FinalResponse {
            status: self.status,
            headers: self.headers,
            cookies: self.cookies,
            body: Bytes::from(self.body.concat()),
        }
    }
}

/// Fully assembled response, ready to be written to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub cookies: Vec<String>,
    pub body: Bytes,
}

impl FinalResponse {
    /// Generic server error returned when a handler fails
    pub fn server_error() -> Self {
        FinalResponse {
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            headers: BTreeMap::new(),
            cookies: Vec::new(),
            body: Bytes::from_static(b"Internal Server Error"),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Convert into an `http::Response`
    ///
    /// Each cookie becomes its own `Set-Cookie` header. Header values are
    /// passed through as raw bytes so non-ASCII values survive.
    pub fn into_http(self) -> Result<Response<Full<Bytes>>> {
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| BouncerError::HttpError(format!("Invalid status {}: {}", self.status, e)))?;

        let mut response = Response::builder().status(status);
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| BouncerError::HttpError(format!("Invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_bytes(value.as_bytes())
                .map_err(|e| BouncerError::HttpError(format!("Invalid header value: {}", e)))?;
            response = response.header(name, value);
        }
        for cookie in &self.cookies {
            let value = HeaderValue::from_bytes(cookie.as_bytes())
                .map_err(|e| BouncerError::HttpError(format!("Invalid cookie '{}': {}", cookie, e)))?;
            response = response.header(SET_COOKIE, value);
        }

        response
            .body(Full::new(self.body))
            .map_err(|e| BouncerError::HttpError(format!("Failed to build response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_http() {
        let req = Request::builder()
            .uri("/some/random/path?true=1")
            .header("User-Agent", "Nokia3100/1.0")
            .header("Cookie", "X-UA-map=medium; other=1")
            .body(())
            .unwrap();

        let request = BouncerRequest::from_http(&req);
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/some/random/path");
        assert_eq!(request.query.as_deref(), Some("true=1"));
        assert_eq!(request.user_agent, "Nokia3100/1.0");
        assert_eq!(request.cookie("X-UA-map"), Some("medium"));
        assert_eq!(request.cookie("other"), Some("1"));
        assert_eq!(request.path_and_query(), "/some/random/path?true=1");
    }

    #[test]
    fn test_non_utf8_user_agents_stay_distinct() {
        let request = |ua: &'static [u8]| {
            let req = Request::builder()
                .uri("/")
                .header(USER_AGENT, HeaderValue::from_bytes(ua).unwrap())
                .body(())
                .unwrap();
            BouncerRequest::from_http(&req)
        };

        let e_acute = request(b"Nokia\xe9");
        let e_grave = request(b"Nokia\xe8");
        assert_eq!(&e_acute.user_agent_raw[..], b"Nokia\xe9");
        assert_eq!(&e_grave.user_agent_raw[..], b"Nokia\xe8");
        assert_ne!(e_acute.user_agent_raw, e_grave.user_agent_raw);
        assert!(e_acute.user_agent.starts_with("Nokia"));
    }

    #[test]
    fn test_missing_user_agent_is_empty() {
        let req = Request::builder().uri("/").body(()).unwrap();
        let request = BouncerRequest::from_http(&req);
        assert_eq!(request.user_agent, "");
        assert!(request.user_agent_raw.is_empty());
    }

    #[test]
    fn test_headers_last_writer_wins() {
        let mut response = ResponseAccumulator::new();
        response.set_header("X-UA-Type", "small");
        response.set_header("x-ua-type", "large");
        assert_eq!(response.header("X-UA-Type"), Some("large"));
        assert_eq!(response.headers().len(), 1);
    }

    #[test]
    fn test_cookies_are_not_deduplicated() {
        let mut response = ResponseAccumulator::new();
        response.add_cookie("UA-Foo", "bar");
        response.add_cookie("UA-Foo", "bar");
        assert_eq!(response.cookies().len(), 2);
        assert!(response.sets_cookie("UA-Foo"));
        assert!(!response.sets_cookie("UA"));
    }

    #[test]
    fn test_finish_concatenates_chunks() {
        let mut response = ResponseAccumulator::new();
        response.push_chunk("foo".to_string());
        response.push_chunk(String::new());
        response.push_chunk("bar".to_string());
        let finished = response.finish();
        assert_eq!(finished.status, 200);
        assert_eq!(finished.body, Bytes::from("foobar"));
    }

    #[test]
    fn test_into_http_emits_one_set_cookie_per_entry() {
        let mut response = ResponseAccumulator::new();
        response.set_header("X-UA-Category", "mobi");
        response.add_cookie("a", "1");
        response.add_cookie("b", "2");

        let http = response.finish().into_http().unwrap();
        let cookies: Vec<_> = http
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(cookies, vec!["a=1".to_string(), "b=2".to_string()]);
        assert_eq!(http.headers().get("x-ua-category").unwrap(), "mobi");
    }

    #[test]
    fn test_into_http_keeps_non_ascii_values() {
        let mut response = ResponseAccumulator::new();
        response.set_header("X-UA-Model", "Gerät");
        let http = response.finish().into_http().unwrap();
        assert_eq!(
            http.headers().get("x-ua-model").unwrap().as_bytes(),
            "Gerät".as_bytes()
        );
    }

    #[test]
    fn test_redirect() {
        let mut response = ResponseAccumulator::new();
        response.redirect("/path?x=1");
        assert_eq!(response.status(), 302);
        assert_eq!(response.header("Location"), Some("/path?x=1"));
    }
}
