//! Mock engine.
//!
//! Routes a request to its endpoint, selects the first matching rule and
//! renders its response. Built once at startup and shared by every request.

use crate::cache::{cache_key, InMemoryResponseCache, ResponseCache};
use crate::config::{ConfigError, GlobalSettings, MockConfig};
use crate::endpoint::{EndpointRegistry, RouteMatch};
use crate::expression::RhaiExpressions;
use crate::matcher::Matcher;
use crate::patterns::CompiledPatterns;
use crate::render::{MockResponse, RenderError, ResponseRenderer};
use crate::request::RequestSnapshot;
use crate::template::TemplateEngine;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Request handling core.
pub struct MockEngine {
    registry: EndpointRegistry,
    matcher: Matcher,
    renderer: ResponseRenderer,
    settings: GlobalSettings,
    cache: Option<(Arc<dyn ResponseCache>, Duration)>,
    /// Total requests processed.
    requests_total: AtomicU64,
    /// Requests answered by a matching rule.
    requests_matched: AtomicU64,
    /// Requests with no route or no matching rule.
    requests_unmatched: AtomicU64,
}

impl MockEngine {
    pub fn new(
        registry: EndpointRegistry,
        matcher: Matcher,
        renderer: ResponseRenderer,
        settings: GlobalSettings,
    ) -> Self {
        Self {
            registry,
            matcher,
            renderer,
            settings,
            cache: None,
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
        }
    }

    /// Cache rendered responses for `ttl`.
    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>, ttl: Duration) -> Self {
        self.cache = Some((cache, ttl));
        self
    }

    /// Build the engine and register every configured endpoint.
    pub fn from_config(config: &MockConfig) -> Result<Self, ConfigError> {
        let registry = EndpointRegistry::from_definitions(&config.endpoints)?;
        let capacity = config.settings.pattern_cache_size;

        let renderer = ResponseRenderer::new(
            Arc::new(RhaiExpressions::new(capacity)),
            Arc::new(TemplateEngine::new(&config.templates_dir)),
        );
        let mut engine = Self::new(
            registry,
            Matcher::new(CompiledPatterns::new(capacity)),
            renderer,
            config.settings.clone(),
        );

        if config.cache.enabled {
            engine = engine.with_cache(
                Arc::new(InMemoryResponseCache::new(config.cache.max_entries)),
                Duration::from_secs(config.cache.ttl_seconds),
            );
        }

        info!(
            endpoints = engine.registry.len(),
            cache = config.cache.enabled,
            "Mock engine initialized"
        );
        Ok(engine)
    }

    /// Build from a YAML string. Environment overrides and endpoint
    /// directories are not applied.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config = MockConfig::parse(yaml, Path::new("<inline>"))?;
        config.validate()?;
        Self::from_config(&config)
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    /// Get total requests processed.
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    /// Get total requests matched.
    pub fn total_matched(&self) -> u64 {
        self.requests_matched.load(Ordering::Relaxed)
    }

    /// Get total requests unmatched.
    pub fn total_unmatched(&self) -> u64 {
        self.requests_unmatched.load(Ordering::Relaxed)
    }

    /// Produce the response for one request.
    ///
    /// "No route" and "no matching rule" are ordinary 404/405 responses;
    /// only rendering failures are errors.
    pub fn handle(&self, snapshot: RequestSnapshot) -> Result<MockResponse, RenderError> {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let (endpoint, params) = match self.registry.route(snapshot.method(), snapshot.path()) {
            RouteMatch::Found { endpoint, params } => (endpoint, params),
            RouteMatch::MethodNotAllowed { allowed } => {
                self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
                let mut response = MockResponse::error(405, "Method Not Allowed");
                response.headers.insert("Allow", allowed.join(", "));
                return Ok(response);
            }
            RouteMatch::NotFound => {
                self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
                if self.settings.log_unmatched {
                    warn!(
                        method = snapshot.method(),
                        path = snapshot.path(),
                        "No endpoint for request"
                    );
                }
                return Ok(MockResponse::error(404, "Not Found"));
            }
        };
        let snapshot = snapshot.with_route_params(params);

        let cache_slot = self
            .cache
            .as_ref()
            .filter(|_| matches!(snapshot.method(), "GET" | "HEAD"))
            .map(|(cache, ttl)| (cache, *ttl, cache_key(&snapshot)));
        if let Some((cache, _, key)) = &cache_slot {
            if let Some(hit) = cache.get(key) {
                debug!(key = %key, "Serving cached response");
                self.requests_matched.fetch_add(1, Ordering::Relaxed);
                return Ok(hit);
            }
        }

        let template = endpoint.template.as_deref();
        let response = match self.matcher.select(&endpoint.rules, &snapshot) {
            Some(rule) => {
                self.requests_matched.fetch_add(1, Ordering::Relaxed);
                if self.settings.log_matches {
                    info!(
                        method = snapshot.method(),
                        path = snapshot.path(),
                        rule = rule.name.as_deref().unwrap_or("-"),
                        status = rule.response.status,
                        "Request matched rule"
                    );
                }
                self.renderer.render(&rule.response, template, &snapshot)?
            }
            None => {
                self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
                if self.settings.log_unmatched {
                    warn!(
                        method = snapshot.method(),
                        path = snapshot.path(),
                        endpoint = endpoint.route.as_str(),
                        "No matching rule"
                    );
                }
                match &endpoint.default_response {
                    Some(default) => self.renderer.render(default, template, &snapshot)?,
                    None => return Ok(MockResponse::error(404, endpoint.no_match_message())),
                }
            }
        };

        if let Some((cache, ttl, key)) = cache_slot {
            cache.set(&key, response.clone(), ttl);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    const CONFIG: &str = r#"
settings:
  log_matches: true
  log_unmatched: true
endpoints:
  - path: /hello
    method: POST
    scenarios:
      - scenario_name: name is John
        rules_data:
          - { target: body, prop: $.name, op: equals, value: John }
        response:
          status: 200
          data: { greeting: "Hello John!" }
      - scenario_name: anyone else
        rules_data: []
        response:
          status: 400
          data: { error: "Not John" }

  - path: /empty
    method: GET
    rules: []

  - path: "/users/{id}"
    method: GET
    rules:
      - conditions:
          - { target: route_params, property: id, operator: regex, value: "^[0-9]+$" }
        response:
          status: 200
          headers: { X-Mock: "yes" }
          data:
            id: "{{ request.route_params.id }}"
            token: "{{ uuid4() }}"
    default_response:
      status: 422
      data: { error: "bad id" }

  - path: /search
    method: GET
    scenarios:
      - name: needs q
        conditions:
          - { target: params, property: q, operator: empty_array, invert: true }
        response: { data: { found: true } }
"#;

    fn engine() -> MockEngine {
        MockEngine::from_yaml(CONFIG).unwrap()
    }

    fn body(response: &MockResponse) -> Value {
        serde_json::from_str(&response.body).unwrap()
    }

    fn post_json(path: &str, value: Value) -> RequestSnapshot {
        RequestSnapshot::builder("POST", path).json_body(value).build()
    }

    #[test]
    fn test_engine_creation() {
        let engine = engine();
        assert_eq!(engine.registry().len(), 4);
        assert_eq!(engine.total_requests(), 0);
    }

    #[test]
    fn test_bundled_config_loads() {
        let engine = MockEngine::from_yaml(include_str!("../config/default-config.yaml")).unwrap();
        assert_eq!(engine.registry().len(), 4);

        let order = RequestSnapshot::builder("POST", "/orders")
            .json_body(json!({"item": "book", "quantity": 2}))
            .build();
        let response = engine.handle(order).unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(body(&response)["order_id"].as_str().unwrap().len(), 10);

        let invalid = post_json("/orders", json!({"item": "book", "quantity": 0}));
        assert_eq!(engine.handle(invalid).unwrap().status, 422);

        let user = engine
            .handle(RequestSnapshot::builder("GET", "/users/3").build())
            .unwrap();
        let data = body(&user);
        assert_eq!(data["id"], "3");
        assert!(data["email"].as_str().unwrap().contains('@'));
        assert_eq!(data["lucky_numbers"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_bundled_config_renders_profile_template() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default-config.yaml");
        let config = MockConfig::from_file(&path).unwrap();
        let engine = MockEngine::from_config(&config).unwrap();

        let response = engine
            .handle(RequestSnapshot::builder("GET", "/profile/ada").build())
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type(), Some(crate::render::HTML_CONTENT_TYPE));
        assert!(response.body.contains("<h1>Profile: ada</h1>"));
    }

    #[test]
    fn test_first_matching_scenario_wins() {
        let engine = engine();

        let john = engine.handle(post_json("/hello", json!({"name": "John"}))).unwrap();
        assert_eq!(john.status, 200);
        assert_eq!(body(&john), json!({"greeting": "Hello John!"}));

        let other = engine.handle(post_json("/hello", json!({"name": "Anyone"}))).unwrap();
        assert_eq!(other.status, 400);
        assert_eq!(body(&other), json!({"error": "Not John"}));
    }

    #[test]
    fn test_empty_rules_fall_back_to_404() {
        let response = engine()
            .handle(RequestSnapshot::builder("GET", "/empty").build())
            .unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(body(&response), json!({"error": "No matching rule"}));
    }

    #[test]
    fn test_no_matching_scenario_message() {
        let response = engine()
            .handle(RequestSnapshot::builder("GET", "/search").build())
            .unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(body(&response), json!({"error": "No matching scenario"}));

        let found = engine()
            .handle(RequestSnapshot::builder("GET", "/search").query_string("q=rust").build())
            .unwrap();
        assert_eq!(body(&found), json!({"found": true}));
    }

    #[test]
    fn test_route_params_and_expressions() {
        let response = engine()
            .handle(RequestSnapshot::builder("GET", "/users/42").build())
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("X-Mock"), Some("yes"));
        let data = body(&response);
        assert_eq!(data["id"], "42");
        assert_eq!(data["token"].as_str().unwrap().len(), 36);
    }

    #[test]
    fn test_default_response_when_nothing_matches() {
        let response = engine()
            .handle(RequestSnapshot::builder("GET", "/users/abc").build())
            .unwrap();
        assert_eq!(response.status, 422);
        assert_eq!(body(&response), json!({"error": "bad id"}));
    }

    #[test]
    fn test_unknown_route_and_method() {
        let engine = engine();

        let missing = engine.handle(RequestSnapshot::builder("GET", "/nope").build()).unwrap();
        assert_eq!(missing.status, 404);
        assert_eq!(body(&missing), json!({"error": "Not Found"}));

        let wrong = engine.handle(RequestSnapshot::builder("GET", "/hello").build()).unwrap();
        assert_eq!(wrong.status, 405);
        assert_eq!(wrong.headers.get("allow"), Some("POST"));
    }

    #[test]
    fn test_head_uses_get_endpoint() {
        let engine = engine();

        let head = engine.handle(RequestSnapshot::builder("HEAD", "/users/7").build()).unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(body(&head)["id"], "7");

        let wrong = engine.handle(RequestSnapshot::builder("DELETE", "/users/7").build()).unwrap();
        assert_eq!(wrong.status, 405);
        assert_eq!(wrong.headers.get("allow"), Some("GET, HEAD"));
    }

    #[test]
    fn test_request_counters() {
        let engine = engine();
        engine.handle(post_json("/hello", json!({"name": "John"}))).unwrap();
        engine.handle(RequestSnapshot::builder("GET", "/empty").build()).unwrap();
        engine.handle(RequestSnapshot::builder("GET", "/nope").build()).unwrap();

        assert_eq!(engine.total_requests(), 3);
        assert_eq!(engine.total_matched(), 1);
        assert_eq!(engine.total_unmatched(), 2);
    }

    #[test]
    fn test_response_cache() {
        let yaml = format!("cache: {{ enabled: true, ttl_seconds: 60 }}\n{CONFIG}");
        let engine = MockEngine::from_yaml(&yaml).unwrap();
        let request = || {
            RequestSnapshot::builder("GET", "/users/7")
                .query_string("b=1&a=2")
                .build()
        };

        let first = engine.handle(request()).unwrap();
        let second = engine.handle(request()).unwrap();
        assert_eq!(body(&first)["token"], body(&second)["token"]);

        // Without a cache every render is fresh
        let uncached = self::engine();
        let a = uncached.handle(request()).unwrap();
        let b = uncached.handle(request()).unwrap();
        assert_ne!(body(&a)["token"], body(&b)["token"]);
    }

    #[test]
    fn test_missing_template_is_render_error() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
templates_dir: {dir}
endpoints:
  - path: /page
    method: GET
    template: missing.html
    rules:
      - response: {{ data: {{ title: Home }} }}
"#,
            dir = dir.path().display()
        );
        let engine = MockEngine::from_yaml(&yaml).unwrap();

        let err = engine
            .handle(RequestSnapshot::builder("GET", "/page").build())
            .unwrap_err();
        assert_eq!(err.kind(), "template_not_found");
    }

    #[test]
    fn test_template_response() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("user.html"), "<h1>{{title}} #{{id}}</h1>").unwrap();
        let yaml = format!(
            r#"
templates_dir: {dir}
endpoints:
  - path: "/users/<int:id>"
    method: GET
    rules:
      - response: {{ template: user.html, data: {{ title: Profile }} }}
"#,
            dir = dir.path().display()
        );
        let engine = MockEngine::from_yaml(&yaml).unwrap();

        let response = engine
            .handle(RequestSnapshot::builder("GET", "/users/5").build())
            .unwrap();
        assert_eq!(response.body, "<h1>Profile #5</h1>");
        assert_eq!(response.content_type(), Some("text/html; charset=utf-8"));
    }
}
