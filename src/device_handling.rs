//! Device-specific response handling
//!
//! Given the descriptor of a classified device, a [`DeviceHandling`]
//! variant mutates the live response and returns a body chunk. The caching
//! machinery is the same for every variant; only this step differs.

use crate::classifier::DeviceDescriptor;
use crate::error::{BouncerError, Result};
use crate::models::{BouncerRequest, ResponseAccumulator};

/// Capability supplied by concrete device handlers
pub trait DeviceHandling: Send + Sync {
    fn apply_device(
        &self,
        request: &BouncerRequest,
        response: &mut ResponseAccumulator,
        device: &DeviceDescriptor,
    ) -> Result<String>;
}

/// Sets a single classification cookie, `<cookie_name>=<attribute value>`
#[derive(Debug, Clone)]
pub struct CookieHandling {
    cookie_name: String,
    attribute: String,
}

impl CookieHandling {
    pub fn new(cookie_name: impl Into<String>, attribute: impl Into<String>) -> Self {
        CookieHandling {
            cookie_name: cookie_name.into(),
            attribute: attribute.into(),
        }
    }
}

impl DeviceHandling for CookieHandling {
    fn apply_device(
        &self,
        _request: &BouncerRequest,
        response: &mut ResponseAccumulator,
        device: &DeviceDescriptor,
    ) -> Result<String> {
        let value = device.attribute(&self.attribute).ok_or_else(|| {
            BouncerError::ClassificationError(format!(
                "device {} has no attribute '{}'",
                device.id, self.attribute
            ))
        })?;
        response.add_cookie(&self.cookie_name, value);
        Ok(String::new())
    }
}

/// Exposes the descriptor as `X-UA-*` response headers
#[derive(Debug, Clone, Default)]
pub struct HeaderHandling;

impl DeviceHandling for HeaderHandling {
    fn apply_device(
        &self,
        _request: &BouncerRequest,
        response: &mut ResponseAccumulator,
        device: &DeviceDescriptor,
    ) -> Result<String> {
        response.set_header("X-UA-Device", &device.id);
        for (name, value) in &device.attributes {
            response.set_header(&format!("X-UA-{}", header_case(name)), value);
        }
        Ok(String::new())
    }
}

/// `screen_width` -> `Screen-Width`
fn header_case(attribute: &str) -> String {
    attribute
        .split(|c| c == '_' || c == '-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Renders a body fragment from a template
///
/// `{{id}}` is replaced by the device id and `{{name}}` by the attribute
/// `name`; placeholders for unknown attributes render empty.
#[derive(Debug, Clone)]
pub struct TemplateHandling {
    template: String,
}

impl TemplateHandling {
    pub fn new(template: impl Into<String>) -> Self {
        TemplateHandling {
            template: template.into(),
        }
    }

    fn render(&self, device: &DeviceDescriptor) -> String {
        let mut output = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();

        while let Some(start) = rest.find("{{") {
            output.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let name = after[..end].trim();
                    if name == "id" {
                        output.push_str(&device.id);
                    } else if let Some(value) = device.attribute(name) {
                        output.push_str(value);
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    output.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        output.push_str(rest);
        output
    }
}

impl DeviceHandling for TemplateHandling {
    fn apply_device(
        &self,
        _request: &BouncerRequest,
        _response: &mut ResponseAccumulator,
        device: &DeviceDescriptor,
    ) -> Result<String> {
        Ok(self.render(device))
    }
}
