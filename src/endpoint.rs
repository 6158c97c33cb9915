//! Endpoint registration and routing.
//!
//! Each configured path+method becomes an [`Endpoint`] holding its ordered
//! rules. The [`EndpointRegistry`] resolves an incoming method and path to
//! an endpoint and its route parameters.

use crate::config::{ConfigError, EndpointDefinition, ResponsePayload};
use crate::matcher::Rule;
use std::collections::HashMap;
use tracing::info;

/// Route template such as `/users/{id}` or `/files/<path:rest>`.
#[derive(Debug, Clone)]
pub struct RoutePattern {
    source: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Param { name: String, kind: ParamKind },
}

/// Accepted shape of a captured segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Any non-empty segment
    String,
    /// ASCII digits
    Int,
    /// Digits with one decimal point
    Float,
    /// The rest of the path, slashes included
    Path,
}

impl ParamKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "string" => Some(ParamKind::String),
            "int" => Some(ParamKind::Int),
            "float" => Some(ParamKind::Float),
            "path" => Some(ParamKind::Path),
            _ => None,
        }
    }

    fn accepts(self, segment: &str) -> bool {
        match self {
            ParamKind::String | ParamKind::Path => !segment.is_empty(),
            ParamKind::Int => !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()),
            ParamKind::Float => match segment.split_once('.') {
                Some((whole, frac)) => {
                    !whole.is_empty()
                        && !frac.is_empty()
                        && whole.bytes().all(|b| b.is_ascii_digit())
                        && frac.bytes().all(|b| b.is_ascii_digit())
                }
                None => false,
            },
        }
    }
}

impl RoutePattern {
    /// Parse a route template. Parameters occupy whole path segments.
    pub fn parse(template: &str) -> Result<Self, String> {
        let Some(rest) = template.strip_prefix('/') else {
            return Err("route must start with '/'".to_string());
        };

        let mut segments = Vec::new();
        for raw in rest.split('/') {
            let segment = parse_segment(raw)?;
            if let Some(Segment::Param {
                kind: ParamKind::Path,
                ..
            }) = segments.last()
            {
                return Err("a path parameter must be the last segment".to_string());
            }
            if let Segment::Param { name, .. } = &segment {
                let duplicate = segments
                    .iter()
                    .any(|s| matches!(s, Segment::Param { name: n, .. } if n == name));
                if duplicate {
                    return Err(format!("duplicate parameter {name:?}"));
                }
            }
            segments.push(segment);
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// True when the route has no parameters.
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Match a request path, returning the decoded captures.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = path.strip_prefix('/')?.split('/').collect();
        let mut params = HashMap::new();

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(literal) => {
                    if parts.get(i) != Some(&literal.as_str()) {
                        return None;
                    }
                }
                Segment::Param {
                    name,
                    kind: ParamKind::Path,
                } => {
                    let rest = parts.get(i..)?.join("/");
                    if rest.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), decode(&rest));
                    return Some(params);
                }
                Segment::Param { name, kind } => {
                    let part = parts.get(i)?;
                    if !kind.accepts(part) {
                        return None;
                    }
                    params.insert(name.clone(), decode(part));
                }
            }
        }

        (parts.len() == self.segments.len()).then_some(params)
    }
}

fn parse_segment(raw: &str) -> Result<Segment, String> {
    let param = if let Some(inner) = raw.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
        Some((ParamKind::String, inner))
    } else if let Some(inner) = raw.strip_prefix('<').and_then(|r| r.strip_suffix('>')) {
        match inner.split_once(':') {
            Some((converter, name)) => {
                let kind = ParamKind::from_name(converter)
                    .ok_or_else(|| format!("unknown converter {converter:?}"))?;
                Some((kind, name))
            }
            None => Some((ParamKind::String, inner)),
        }
    } else {
        None
    };

    match param {
        Some((kind, name)) => {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(format!("invalid parameter name {name:?}"));
            }
            Ok(Segment::Param {
                name: name.to_string(),
                kind,
            })
        }
        None if raw.contains(['{', '}', '<', '>']) => Err(format!(
            "parameters must span a whole path segment: {raw:?}"
        )),
        None => Ok(Segment::Literal(raw.to_string())),
    }
}

fn decode(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// How an endpoint's rules were configured. Only affects the no-match body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Rules,
    Scenarios,
}

/// A registered endpoint. Immutable after startup.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub method: String,
    pub route: RoutePattern,
    pub kind: RuleKind,
    pub rules: Vec<Rule>,
    /// Template applied when the selected response names none
    pub template: Option<String>,
    pub default_response: Option<ResponsePayload>,
}

impl Endpoint {
    pub fn from_definition(definition: &EndpointDefinition) -> Result<Self, ConfigError> {
        definition.validate()?;
        let route = RoutePattern::parse(&definition.path).map_err(|reason| {
            ConfigError::InvalidRoute {
                path: definition.path.clone(),
                reason,
            }
        })?;

        let (kind, rules) = match (&definition.rules, &definition.scenarios) {
            (_, Some(scenarios)) => (
                RuleKind::Scenarios,
                scenarios
                    .iter()
                    .map(|s| Rule::named(s.name.clone(), s.conditions.clone(), s.response.clone()))
                    .collect(),
            ),
            (rules, None) => (
                RuleKind::Rules,
                rules
                    .iter()
                    .flatten()
                    .map(|r| Rule::new(r.conditions.clone(), r.response.clone()))
                    .collect(),
            ),
        };

        Ok(Self {
            method: definition.method.to_uppercase(),
            route,
            kind,
            rules,
            template: definition.template.clone(),
            default_response: definition.default_response.clone(),
        })
    }

    /// Error message returned when no rule matches.
    pub fn no_match_message(&self) -> &'static str {
        match self.kind {
            RuleKind::Rules => "No matching rule",
            RuleKind::Scenarios => "No matching scenario",
        }
    }
}

/// Outcome of routing a request.
#[derive(Debug)]
pub enum RouteMatch<'a> {
    Found {
        endpoint: &'a Endpoint,
        params: HashMap<String, String>,
    },
    /// The path exists under other methods
    MethodNotAllowed { allowed: Vec<String> },
    NotFound,
}

/// Registered endpoints in routing order: parameterless routes first,
/// then configuration order.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: Vec<Endpoint>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every definition, failing on the first invalid one.
    pub fn from_definitions(definitions: &[EndpointDefinition]) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for definition in definitions {
            registry.register(Endpoint::from_definition(definition)?)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, endpoint: Endpoint) -> Result<(), ConfigError> {
        let duplicate = self
            .endpoints
            .iter()
            .any(|e| e.method == endpoint.method && e.route.as_str() == endpoint.route.as_str());
        if duplicate {
            return Err(ConfigError::DuplicateEndpoint {
                method: endpoint.method,
                path: endpoint.route.as_str().to_string(),
            });
        }

        info!(
            method = %endpoint.method,
            path = endpoint.route.as_str(),
            rules = endpoint.rules.len(),
            "Registered endpoint"
        );

        if endpoint.route.is_literal() {
            let position = self
                .endpoints
                .iter()
                .position(|e| !e.route.is_literal())
                .unwrap_or(self.endpoints.len());
            self.endpoints.insert(position, endpoint);
        } else {
            self.endpoints.push(endpoint);
        }
        Ok(())
    }

    /// Resolve `method` and `path` to an endpoint. HEAD falls back to the
    /// GET endpoint when no HEAD endpoint is registered for the path.
    pub fn route(&self, method: &str, path: &str) -> RouteMatch<'_> {
        let is_head = method.eq_ignore_ascii_case("HEAD");
        let mut head_fallback = None;
        let mut allowed = Vec::new();

        for endpoint in &self.endpoints {
            let Some(params) = endpoint.route.matches(path) else {
                continue;
            };
            if endpoint.method.eq_ignore_ascii_case(method) {
                return RouteMatch::Found { endpoint, params };
            }
            if is_head && endpoint.method == "GET" && head_fallback.is_none() {
                head_fallback = Some((endpoint, params));
                continue;
            }
            if !allowed.contains(&endpoint.method) {
                allowed.push(endpoint.method.clone());
            }
        }

        if let Some((endpoint, params)) = head_fallback {
            return RouteMatch::Found { endpoint, params };
        }
        if allowed.iter().any(|m| m == "GET") && !allowed.iter().any(|m| m == "HEAD") {
            allowed.push("HEAD".to_string());
        }

        if allowed.is_empty() {
            RouteMatch::NotFound
        } else {
            RouteMatch::MethodNotAllowed { allowed }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
