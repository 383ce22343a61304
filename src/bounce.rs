//! Redirect-to-self after the identification cookie is first set
//!
//! A client that arrives without the identification cookie gets it set and
//! is bounced back (302) to the same path and query, so the cookie is sent
//! with the very next request. The debug path is always served directly.

use crate::models::{BouncerRequest, ResponseAccumulator};
use tracing::debug;

/// Outcome of the bounce check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BounceDecision {
    /// Serve the assembled response as-is
    Serve,
    /// Answer with a 302 to this location
    Redirect(String),
}

/// Decides between serving directly and bouncing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BouncePolicy {
    cookie_name: String,
    debug_path: Option<String>,
}

impl BouncePolicy {
    pub fn new(cookie_name: impl Into<String>, debug_path: Option<String>) -> Self {
        BouncePolicy {
            cookie_name: cookie_name.into(),
            debug_path,
        }
    }

    pub fn is_debug_path(&self, path: &str) -> bool {
        self.debug_path.as_deref() == Some(path)
    }

    /// Decide what to do with a request once the response carries its cookies
    pub fn decide(&self, request: &BouncerRequest, response: &ResponseAccumulator) -> BounceDecision {
        if self.is_debug_path(&request.path) {
            debug!("Debug path {} served directly", request.path);
            return BounceDecision::Serve;
        }

        let client_has_cookie = request.cookie(&self.cookie_name).is_some();
        if !client_has_cookie && response.sets_cookie(&self.cookie_name) {
            return BounceDecision::Redirect(request.path_and_query());
        }

        BounceDecision::Serve
    }

    /// Apply the decision to the response
    pub fn apply(&self, request: &BouncerRequest, response: &mut ResponseAccumulator) -> BounceDecision {
        let decision = self.decide(request, response);
        if let BounceDecision::Redirect(location) = &decision {
            debug!("Bouncing {} to set cookie {}", location, self.cookie_name);
            response.redirect(location);
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BouncePolicy {
        BouncePolicy::new("X-UA-header", Some("/_debug".to_string()))
    }

    fn cookied_response() -> ResponseAccumulator {
        let mut response = ResponseAccumulator::new();
        response.add_cookie("X-UA-header", "high");
        response
    }

    #[test]
    fn test_first_visit_is_bounced_to_same_path() {
        let request = BouncerRequest::new("/some/random/path?true=1");
        let mut response = cookied_response();

        let decision = policy().apply(&request, &mut response);
        assert_eq!(
            decision,
            BounceDecision::Redirect("/some/random/path?true=1".to_string())
        );
        assert_eq!(response.status(), 302);
        assert_eq!(response.header("location"), Some("/some/random/path?true=1"));
    }

    #[test]
    fn test_debug_path_is_served() {
        let request = BouncerRequest::new("/_debug");
        let mut response = cookied_response();
        assert_eq!(policy().apply(&request, &mut response), BounceDecision::Serve);
        assert_eq!(response.status(), 200);
    }

    #[test]
    fn test_cookied_client_is_served() {
        let request = BouncerRequest::new("/page").with_cookie("X-UA-header", "high");
        assert_eq!(policy().decide(&request, &cookied_response()), BounceDecision::Serve);
    }

    #[test]
    fn test_no_bounce_without_identification_cookie_in_response() {
        let request = BouncerRequest::new("/page");
        let response = ResponseAccumulator::new();
        assert_eq!(policy().decide(&request, &response), BounceDecision::Serve);
    }
}
