//! Immutable request snapshot.
//!
//! Built once per incoming request by the transport layer and read by the
//! extractor, the expression layer and the templates.

use serde_json::{Map, Value};
use std::collections::HashMap;

/// Request headers in arrival order.
///
/// Names compare case-insensitively; inserting a name twice keeps the
/// original position and the last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing any previous value for the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Headers as a JSON object keyed by the names as received.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// Decoded query parameters. Repeated keys keep every value in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    /// Parse a raw query string (without the leading `?`).
    pub fn parse(query: &str) -> Self {
        let pairs = query
            .split('&')
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once('=') {
                Some((key, value)) => (decode_component(key), decode_component(value)),
                None => (decode_component(part), String::new()),
            })
            .collect();
        Self { pairs }
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `key`, in request order.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| k == key)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Multi-valued JSON view: every key maps to the list of its values.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (k, v) in &self.pairs {
            let entry = map
                .entry(k.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(values) = entry {
                values.push(Value::String(v.clone()));
            }
        }
        Value::Object(map)
    }

    /// Single-valued JSON view: every key maps to its first value.
    pub fn first_values_json(&self) -> Value {
        let mut map = Map::new();
        for (k, v) in &self.pairs {
            map.entry(k.clone())
                .or_insert_with(|| Value::String(v.clone()));
        }
        Value::Object(map)
    }

    /// Pairs sorted by key then value and joined as `k=v&k=v`.
    pub fn sorted_query_string(&self) -> String {
        let mut pairs: Vec<_> = self.pairs.iter().collect();
        pairs.sort();
        pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// Parse a `Cookie` header into name/value pairs.
pub fn parse_cookies(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|part| {
            let (name, value) = part.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let value = value.trim().trim_matches('"');
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// Request body, interpreted according to the content type.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestBody {
    /// Parsed JSON document
    Json(Value),
    /// Form-encoded fields (first value per key)
    Form(Map<String, Value>),
    /// Any other non-empty body
    Text(String),
    #[default]
    Empty,
}

impl RequestBody {
    /// Interpret raw body bytes using the request's content type.
    pub fn from_bytes(content_type: Option<&str>, bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return RequestBody::Empty;
        }

        let essence = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
            .unwrap_or_default();

        if essence == "application/json" || essence.ends_with("+json") {
            if let Ok(json) = serde_json::from_slice(bytes) {
                return RequestBody::Json(json);
            }
        } else if essence == "application/x-www-form-urlencoded" {
            let text = String::from_utf8_lossy(bytes);
            let mut fields = Map::new();
            for (k, v) in QueryParams::parse(&text).pairs {
                fields.entry(k).or_insert(Value::String(v));
            }
            return RequestBody::Form(fields);
        }

        RequestBody::Text(String::from_utf8_lossy(bytes).into_owned())
    }

    /// JSON or form bodies as a JSON value.
    pub fn structured(&self) -> Option<Value> {
        match self {
            RequestBody::Json(value) => Some(value.clone()),
            RequestBody::Form(fields) => Some(Value::Object(fields.clone())),
            RequestBody::Text(_) | RequestBody::Empty => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            RequestBody::Text(text) => Value::String(text.clone()),
            RequestBody::Empty => Value::Null,
            _ => self.structured().unwrap_or(Value::Null),
        }
    }
}

/// Everything the engine may look at for one request.
#[derive(Debug, Clone, Default)]
pub struct RequestSnapshot {
    method: String,
    path: String,
    headers: Headers,
    query: QueryParams,
    route_params: HashMap<String, String>,
    cookies: HashMap<String, String>,
    body: RequestBody,
    content_type: Option<String>,
}

impl RequestSnapshot {
    pub fn builder(method: &str, path: &str) -> RequestSnapshotBuilder {
        RequestSnapshotBuilder {
            snapshot: RequestSnapshot {
                method: method.to_uppercase(),
                path: path.to_string(),
                ..Default::default()
            },
            cookies_set: false,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn query(&self) -> &QueryParams {
        &self.query
    }

    pub fn route_params(&self) -> &HashMap<String, String> {
        &self.route_params
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Attach path captures once the route is known.
    pub fn with_route_params(mut self, params: HashMap<String, String>) -> Self {
        self.route_params = params;
        self
    }

    /// JSON view exposed to inline expressions as `request`.
    pub fn to_context(&self) -> Value {
        let string_map = |m: &HashMap<String, String>| -> Value {
            Value::Object(
                m.iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            )
        };

        serde_json::json!({
            "method": self.method,
            "path": self.path,
            "headers": self.headers.to_json(),
            "query": self.query.to_json(),
            "args": self.query.first_values_json(),
            "route_params": string_map(&self.route_params),
            "cookies": string_map(&self.cookies),
            "body": self.body.to_json(),
            "content_type": self.content_type,
        })
    }
}

/// Builder for [`RequestSnapshot`].
pub struct RequestSnapshotBuilder {
    snapshot: RequestSnapshot,
    cookies_set: bool,
}

impl RequestSnapshotBuilder {
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.snapshot.headers.insert(name, value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.snapshot.headers = headers;
        self
    }

    pub fn query_string(mut self, query: &str) -> Self {
        self.snapshot.query = QueryParams::parse(query);
        self
    }

    pub fn query(mut self, query: QueryParams) -> Self {
        self.snapshot.query = query;
        self
    }

    pub fn route_param(mut self, name: &str, value: &str) -> Self {
        self.snapshot
            .route_params
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn cookie(mut self, name: &str, value: &str) -> Self {
        self.snapshot
            .cookies
            .insert(name.to_string(), value.to_string());
        self.cookies_set = true;
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.snapshot.body = body;
        self
    }

    pub fn json_body(mut self, body: Value) -> Self {
        self.snapshot.body = RequestBody::Json(body);
        if self.snapshot.headers.get("content-type").is_none() {
            self.snapshot
                .headers
                .insert("Content-Type", "application/json");
        }
        self
    }

    /// Interpret raw bytes using the `Content-Type` header set so far.
    pub fn raw_body(mut self, bytes: &[u8]) -> Self {
        let content_type = self.snapshot.headers.get("content-type");
        self.snapshot.body = RequestBody::from_bytes(content_type, bytes);
        self
    }

    pub fn build(mut self) -> RequestSnapshot {
        if !self.cookies_set {
            if let Some(header) = self.snapshot.headers.get("cookie") {
                self.snapshot.cookies = parse_cookies(header);
            }
        }
        if self.snapshot.content_type.is_none() {
            self.snapshot.content_type = self
                .snapshot
                .headers
                .get("content-type")
                .map(str::to_string);
        }
        self.snapshot
    }
}
