//! Response rendering.
//!
//! Turns a selected [`ResponsePayload`] into a status, headers and body:
//! inline expressions in string data are substituted, then the data is
//! either rendered through a named template or serialized as JSON.

use crate::config::ResponsePayload;
use crate::expression::{has_marker, ExpressionEvaluator};
use crate::request::{Headers, RequestSnapshot};
use crate::template::{TemplateError, TemplateRenderer};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Rendering failures surfaced to the client as 500 responses.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("failed to serialize response data: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RenderError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::Template(TemplateError::NotFound { .. }) => "template_not_found",
            RenderError::Template(TemplateError::RenderFailed { .. }) => "template_render_failed",
            RenderError::Serialization(_) => "serialization_failed",
        }
    }
}

/// A fully rendered response, ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct MockResponse {
    pub status: u16,
    /// Always carries a `Content-Type`
    pub headers: Headers,
    pub body: String,
}

impl MockResponse {
    /// JSON response with the given status.
    pub fn json(status: u16, body: &Value) -> Self {
        let mut headers = Headers::new();
        headers.insert("Content-Type", JSON_CONTENT_TYPE);
        Self {
            status,
            headers,
            body: body.to_string(),
        }
    }

    /// `{"error": message}` with the given status.
    pub fn error(status: u16, message: &str) -> Self {
        Self::json(status, &serde_json::json!({ "error": message }))
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }
}

/// Response renderer with injected expression and template collaborators.
pub struct ResponseRenderer {
    expressions: Arc<dyn ExpressionEvaluator>,
    templates: Arc<dyn TemplateRenderer>,
}

impl ResponseRenderer {
    pub fn new(
        expressions: Arc<dyn ExpressionEvaluator>,
        templates: Arc<dyn TemplateRenderer>,
    ) -> Self {
        Self {
            expressions,
            templates,
        }
    }

    /// Render `payload`. A template named by the payload takes priority
    /// over `endpoint_template`.
    pub fn render(
        &self,
        payload: &ResponsePayload,
        endpoint_template: Option<&str>,
        snapshot: &RequestSnapshot,
    ) -> Result<MockResponse, RenderError> {
        let data = self.render_data(&payload.data, snapshot);

        let template = payload.template.as_deref().or(endpoint_template);
        let (body, default_type) = match template {
            Some(name) => {
                let mut context = data;
                for (key, value) in snapshot.route_params() {
                    context.insert(key.clone(), Value::String(value.clone()));
                }
                let body = self.templates.render(name, &Value::Object(context))?;
                (body, HTML_CONTENT_TYPE)
            }
            None => (serde_json::to_string(&data)?, JSON_CONTENT_TYPE),
        };

        let mut headers = Headers::new();
        headers.insert("Content-Type", default_type);
        for (name, value) in &payload.headers {
            headers.insert(name.as_str(), value.as_str());
        }

        Ok(MockResponse {
            status: payload.status,
            headers,
            body,
        })
    }

    /// Substitute inline expressions in every string of `data`, at any
    /// depth. Data without markers comes back unchanged.
    pub fn render_data(
        &self,
        data: &Map<String, Value>,
        snapshot: &RequestSnapshot,
    ) -> Map<String, Value> {
        data.iter()
            .map(|(key, value)| (key.clone(), self.render_value(value, snapshot)))
            .collect()
    }

    fn render_value(&self, value: &Value, snapshot: &RequestSnapshot) -> Value {
        match value {
            Value::String(text) => self.render_string(text, snapshot),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.render_value(item, snapshot))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(self.render_data(map, snapshot)),
            other => other.clone(),
        }
    }

    fn render_string(&self, text: &str, snapshot: &RequestSnapshot) -> Value {
        if !has_marker(text) {
            return Value::String(text.to_string());
        }

        let rendered = match self.expressions.render(text, snapshot) {
            Ok(rendered) => rendered,
            Err(e) => {
                debug!(error = %e, "Expression failed, keeping literal value");
                return Value::String(text.to_string());
            }
        };

        // A rendered list literal becomes a real list
        if rendered.starts_with('[') && rendered.ends_with(']') {
            if let Ok(list @ Value::Array(_)) = serde_json::from_str(&rendered) {
                return list;
            }
        }
        Value::String(rendered)
    }
}
