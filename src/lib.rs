//! Rulemock
//!
//! A configuration-driven HTTP mock server. Each endpoint holds an ordered
//! list of rules; the first rule whose conditions all hold for a request
//! decides the response.
//!
//! # Features
//!
//! - **Conditions**: Test the body, query, headers, cookies, method, path or
//!   route parameters with `equals`, `regex`, `regex_ci`, `null`,
//!   `empty_array`, `array_includes` and `valid_json_schema`
//! - **Scenarios**: Named rules for richer endpoint configs
//! - **Inline Expressions**: `{{ ... }}` in response data, with random, fake
//!   data, hashing and encoding helpers
//! - **Templates**: Render named Handlebars templates with response data
//! - **Response Cache**: Optional TTL cache keyed by path and query
//!
//! # Example Configuration
//!
//! ```yaml
//! endpoints:
//!   - path: /hello
//!     method: POST
//!     rules:
//!       - conditions:
//!           - target: body
//!             property: $.name
//!             operator: equals
//!             value: John
//!         response:
//!           status: 200
//!           data:
//!             greeting: "Hello John!"
//!       - conditions: []
//!         response:
//!           status: 400
//!           data:
//!             error: "Not John"
//! ```

pub mod cache;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod expression;
pub mod extract;
pub mod matcher;
pub mod operator;
pub mod patterns;
pub mod render;
pub mod request;
pub mod server;
pub mod template;

pub use config::{ConfigError, MockConfig};
pub use engine::MockEngine;
pub use render::{MockResponse, RenderError};
pub use request::RequestSnapshot;
