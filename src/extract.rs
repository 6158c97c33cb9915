//! Property extraction.
//!
//! Pulls the value a condition tests out of a [`RequestSnapshot`]. Every
//! failure (missing key, wrong shape, bad JSONPath) yields `None`.

use crate::patterns::CompiledPatterns;
use crate::request::RequestSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::HashMap;
use tracing::debug;

/// Which part of the request a condition looks at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Target {
    Body,
    Params,
    Headers,
    Method,
    Path,
    RouteParams,
    Cookies,
    /// A query parameter parsed as a float
    Number,
    /// Reserved; always extracts nothing
    GlobalVariable,
    /// Reserved; always extracts nothing
    DataBucket,
    /// Anything not recognized in configuration
    Unknown(String),
}

impl Target {
    pub fn as_str(&self) -> &str {
        match self {
            Target::Body => "body",
            Target::Params => "params",
            Target::Headers => "headers",
            Target::Method => "method",
            Target::Path => "path",
            Target::RouteParams => "route_params",
            Target::Cookies => "cookies",
            Target::Number => "number",
            Target::GlobalVariable => "global_variable",
            Target::DataBucket => "data_bucket",
            Target::Unknown(name) => name,
        }
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        match name.as_str() {
            "body" => Target::Body,
            "params" => Target::Params,
            "headers" => Target::Headers,
            "method" => Target::Method,
            "path" => Target::Path,
            "route_params" => Target::RouteParams,
            "cookies" => Target::Cookies,
            "number" => Target::Number,
            "global_variable" => Target::GlobalVariable,
            "data_bucket" => Target::DataBucket,
            _ => Target::Unknown(name),
        }
    }
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Target::from(name.to_string())
    }
}

impl From<Target> for String {
    fn from(target: Target) -> Self {
        target.as_str().to_string()
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extract the value `target` (narrowed by `property`) from the request.
///
/// JSON `null` is reported as absent.
pub fn extract(
    patterns: &CompiledPatterns,
    snapshot: &RequestSnapshot,
    target: &Target,
    property: Option<&str>,
) -> Option<Value> {
    let property = property.filter(|p| !p.is_empty());

    let value = match target {
        Target::Body => match snapshot.body().structured() {
            Some(data) => resolve_property(patterns, data, property),
            None => match (snapshot.body().to_json(), property) {
                (text @ Value::String(_), None) => Some(text),
                _ => None,
            },
        },
        Target::Params => match property {
            Some(key) => Some(Value::Array(
                snapshot
                    .query()
                    .get_all(key)
                    .into_iter()
                    .map(|v| Value::String(v.to_string()))
                    .collect(),
            )),
            None => Some(snapshot.query().to_json()),
        },
        Target::Headers => match property {
            Some(name) if !name.starts_with('$') => snapshot
                .headers()
                .get(name)
                .map(|v| Value::String(v.to_string())),
            _ => resolve_property(patterns, snapshot.headers().to_json(), property),
        },
        Target::Cookies => lookup(patterns, snapshot.cookies(), property),
        Target::Method => Some(Value::String(snapshot.method().to_string())),
        Target::Path => Some(Value::String(snapshot.path().to_string())),
        Target::RouteParams => property
            .and_then(|name| snapshot.route_params().get(name))
            .map(|v| Value::String(v.clone())),
        Target::Number => property
            .and_then(|name| snapshot.query().get(name))
            .and_then(parse_number),
        Target::GlobalVariable | Target::DataBucket | Target::Unknown(_) => None,
    };

    value.filter(|v| !v.is_null())
}

/// Whether `extract` answers with the list of every match rather than a
/// single value: JSONPath queries and named query parameters.
pub fn yields_match_list(target: &Target, property: Option<&str>) -> bool {
    let Some(property) = property.filter(|p| !p.is_empty()) else {
        return false;
    };
    match target {
        Target::Params => true,
        Target::Body | Target::Headers | Target::Cookies => property.starts_with('$'),
        _ => false,
    }
}

/// Direct key lookup in a flat string map, or a JSONPath query over it.
fn lookup(
    patterns: &CompiledPatterns,
    map: &HashMap<String, String>,
    property: Option<&str>,
) -> Option<Value> {
    match property {
        Some(name) if !name.starts_with('$') => match map.get(name) {
            Some(value) => Some(Value::String(value.clone())),
            None => resolve_property(patterns, string_map_json(map), Some(name)),
        },
        _ => resolve_property(patterns, string_map_json(map), property),
    }
}

fn string_map_json(map: &HashMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

fn parse_number(raw: &str) -> Option<Value> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

/// Narrow `data` by a JSONPath query (`$...`, returns every match as a
/// list) or a dotted key path.
pub fn resolve_property(
    patterns: &CompiledPatterns,
    data: Value,
    property: Option<&str>,
) -> Option<Value> {
    let Some(property) = property else {
        return Some(data);
    };

    if property.starts_with('$') {
        let path = match patterns.json_path(property) {
            Ok(path) => path,
            Err(e) => {
                debug!(property, error = %e, "Invalid JSONPath expression");
                return None;
            }
        };
        return match path.find(&data) {
            Value::Array(matches) if !matches.is_empty() => Some(Value::Array(matches)),
            _ => None,
        };
    }

    nested_get(&data, property).cloned()
}

/// Follow a dot-separated key path through nested objects.
pub fn nested_get<'a>(data: &'a Value, property: &str) -> Option<&'a Value> {
    property
        .split('.')
        .try_fold(data, |current, key| current.as_object()?.get(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> RequestSnapshot {
        RequestSnapshot::builder("GET", "/test/123")
            .query_string("key=123&num=42&tag=a&tag=b&bad=forty")
            .header("X-Test", "value")
            .header("Cookie", "session=abc")
            .route_param("id", "123")
            .json_body(json!({"data": "test", "user": {"name": "John", "roles": ["admin"]}}))
            .build()
    }

    fn get(target: &str, property: Option<&str>) -> Option<Value> {
        let patterns = CompiledPatterns::default();
        extract(&patterns, &snapshot(), &Target::from(target), property)
    }

    #[test]
    fn test_target_names() {
        assert_eq!(Target::from("route_params"), Target::RouteParams);
        assert_eq!(Target::from("bogus"), Target::Unknown("bogus".to_string()));
        assert_eq!(String::from(Target::DataBucket), "data_bucket");
    }

    #[test]
    fn test_extract_body() {
        assert_eq!(get("body", Some("data")), Some(json!("test")));
        assert_eq!(get("body", Some("user.name")), Some(json!("John")));
        assert_eq!(get("body", Some("user.name.first")), None);
        assert_eq!(get("body", Some("missing.key")), None);
        assert_eq!(get("body", None).unwrap()["data"], "test");
    }

    #[test]
    fn test_extract_body_json_path() {
        assert_eq!(get("body", Some("$.data")), Some(json!(["test"])));
        assert_eq!(get("body", Some("$.user.roles[*]")), Some(json!(["admin"])));
        assert_eq!(get("body", Some("$.nothing")), None);
    }

    #[test]
    fn test_extract_text_body() {
        let patterns = CompiledPatterns::default();
        let snapshot = RequestSnapshot::builder("POST", "/")
            .header("Content-Type", "text/plain")
            .raw_body(b"plain words")
            .build();

        assert_eq!(
            extract(&patterns, &snapshot, &Target::Body, None),
            Some(json!("plain words"))
        );
        assert_eq!(extract(&patterns, &snapshot, &Target::Body, Some("a")), None);
    }

    #[test]
    fn test_extract_params() {
        assert_eq!(get("params", Some("key")), Some(json!(["123"])));
        assert_eq!(get("params", Some("tag")), Some(json!(["a", "b"])));
        assert_eq!(get("params", Some("missing")), Some(json!([])));
        assert_eq!(get("params", None).unwrap()["tag"], json!(["a", "b"]));
    }

    #[test]
    fn test_extract_scalars() {
        assert_eq!(get("method", None), Some(json!("GET")));
        assert_eq!(get("path", Some("ignored")), Some(json!("/test/123")));
    }

    #[test]
    fn test_extract_headers_and_cookies() {
        assert_eq!(get("headers", Some("X-Test")), Some(json!("value")));
        assert_eq!(get("headers", Some("x-test")), Some(json!("value")));
        assert_eq!(get("headers", Some("X-Missing")), None);
        assert_eq!(get("cookies", Some("session")), Some(json!("abc")));
        assert_eq!(get("cookies", Some("other")), None);
    }

    #[test]
    fn test_extract_route_params() {
        assert_eq!(get("route_params", Some("id")), Some(json!("123")));
        assert_eq!(get("route_params", Some("other")), None);
        assert_eq!(get("route_params", None), None);
    }

    #[test]
    fn test_extract_number() {
        assert_eq!(get("number", Some("num")), Some(json!(42.0)));
        assert_eq!(get("number", Some("bad")), None);
        assert_eq!(get("number", Some("missing")), None);
    }

    #[test]
    fn test_reserved_and_unknown_targets() {
        assert_eq!(get("global_variable", Some("var")), None);
        assert_eq!(get("data_bucket", Some("bucket")), None);
        assert_eq!(get("unknown", Some("key")), None);
    }

    #[test]
    fn test_json_null_is_absent() {
        let patterns = CompiledPatterns::default();
        let snapshot = RequestSnapshot::builder("POST", "/")
            .json_body(json!({"gone": null}))
            .build();
        assert_eq!(extract(&patterns, &snapshot, &Target::Body, Some("gone")), None);
    }
}
