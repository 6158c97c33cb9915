//! Inline `{{ ... }}` expressions in response data.
//!
//! Each marker is evaluated as a Rhai expression with the request bound
//! to `request` and substituted by its text form.

use crate::patterns::{PatternCache, DEFAULT_CAPACITY};
use crate::request::RequestSnapshot;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::format::{Item, StrftimeItems};
use chrono::Utc;
use rand::Rng;
use rhai::{Array, Dynamic, Engine, EvalAltResult, Map, Scope, AST};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use std::sync::Arc;
use thiserror::Error;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Longest string `random_string` will produce.
const MAX_RANDOM_STRING: i64 = 4096;

#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("failed to compile expression {expression:?}: {message}")]
    Compile { expression: String, message: String },

    #[error("failed to evaluate expression {expression:?}: {message}")]
    Eval { expression: String, message: String },
}

/// Whether `text` holds at least one complete `{{ ... }}` marker.
pub fn has_marker(text: &str) -> bool {
    text.find(OPEN)
        .is_some_and(|start| text[start + OPEN.len()..].contains(CLOSE))
}

/// Renders text containing inline expressions.
pub trait ExpressionEvaluator: Send + Sync {
    /// Substitute every `{{ expr }}` in `text`. Text without markers is
    /// returned unchanged.
    fn render(&self, text: &str, snapshot: &RequestSnapshot) -> Result<String, ExpressionError>;
}

/// Rhai-backed evaluator with a bounded cache of compiled expressions.
pub struct RhaiExpressions {
    engine: Engine,
    compiled: PatternCache<String, Arc<AST>>,
}

impl RhaiExpressions {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            engine: build_engine(),
            compiled: PatternCache::new(cache_capacity),
        }
    }

    fn compile(&self, expression: &str) -> Result<Arc<AST>, ExpressionError> {
        self.compiled.get_or_try_insert(expression, || {
            self.engine
                .compile_expression(expression)
                .map(Arc::new)
                .map_err(|e| ExpressionError::Compile {
                    expression: expression.to_string(),
                    message: e.to_string(),
                })
        })
    }

    fn evaluate(&self, expression: &str, scope: &mut Scope) -> Result<String, ExpressionError> {
        let ast = self.compile(expression)?;
        let value: Dynamic = self
            .engine
            .eval_ast_with_scope(scope, &ast)
            .map_err(|e| ExpressionError::Eval {
                expression: expression.to_string(),
                message: e.to_string(),
            })?;
        Ok(dynamic_to_text(value))
    }

    /// Number of cached compiled expressions.
    pub fn cached(&self) -> usize {
        self.compiled.len()
    }
}

impl Default for RhaiExpressions {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ExpressionEvaluator for RhaiExpressions {
    fn render(&self, text: &str, snapshot: &RequestSnapshot) -> Result<String, ExpressionError> {
        if !has_marker(text) {
            return Ok(text.to_string());
        }

        let request = rhai::serde::to_dynamic(snapshot.to_context()).map_err(|e| {
            ExpressionError::Eval {
                expression: "request".to_string(),
                message: e.to_string(),
            }
        })?;
        let mut scope = Scope::new();
        scope.push_constant("request", request);

        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find(OPEN) {
            let body = &rest[start + OPEN.len()..];
            // Unterminated markers stay literal
            let Some(end) = body.find(CLOSE) else {
                break;
            };
            out.push_str(&rest[..start]);
            out.push_str(&self.evaluate(body[..end].trim(), &mut scope)?);
            rest = &body[end + CLOSE.len()..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// Text form of an expression result. Arrays and maps become compact JSON.
fn dynamic_to_text(value: Dynamic) -> String {
    if value.is_unit() {
        return String::new();
    }
    if value.is::<Array>() || value.is::<Map>() {
        if let Ok(json) = rhai::serde::from_dynamic::<Value>(&value) {
            return json.to_string();
        }
    }
    value.to_string()
}

/// Current UTC time formatted with a strftime pattern, or `None` if the
/// pattern is invalid.
pub(crate) fn format_now(format: &str) -> Option<String> {
    let items: Vec<Item> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return None;
    }
    Some(Utc::now().format_with_items(items.into_iter()).to_string())
}

fn build_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(100_000);
    engine.set_max_expr_depths(64, 32);
    engine.set_max_string_size(1 << 20);
    engine.set_max_array_size(10_000);
    engine.set_max_map_size(10_000);

    engine.register_fn("uuid4", || uuid::Uuid::new_v4().to_string());

    engine.register_fn("random_int", |a: i64, b: i64| -> i64 {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        rand::thread_rng().gen_range(low..=high)
    });
    engine.register_fn("random_float", || -> f64 { rand::thread_rng().gen::<f64>() });
    engine.register_fn("random_float", |a: f64, b: f64| -> f64 {
        a + (b - a) * rand::thread_rng().gen::<f64>()
    });
    engine.register_fn("random_choice", |items: Array| -> Dynamic {
        if items.is_empty() {
            return Dynamic::UNIT;
        }
        let index = rand::thread_rng().gen_range(0..items.len());
        items[index].clone()
    });
    engine.register_fn("random_string", |len: i64| -> String {
        rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(len.clamp(0, MAX_RANDOM_STRING) as usize)
            .map(char::from)
            .collect()
    });
    engine.register_fn("fake", fake_value);

    engine.register_fn("base64_encode", |s: &str| STANDARD.encode(s));
    engine.register_fn(
        "base64_decode",
        |s: &str| -> Result<String, Box<EvalAltResult>> {
            let bytes = STANDARD
                .decode(s)
                .map_err(|e| format!("invalid base64: {e}"))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        },
    );
    engine.register_fn("sha256", |s: &str| format!("{:x}", Sha256::digest(s.as_bytes())));
    engine.register_fn("sha512", |s: &str| format!("{:x}", Sha512::digest(s.as_bytes())));

    engine.register_fn("env", |name: &str| -> Dynamic {
        std::env::var(name).map(Dynamic::from).unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("env", |name: &str, default: &str| -> String {
        std::env::var(name).unwrap_or_else(|_| default.to_string())
    });

    engine.register_fn("now", || Utc::now().to_rfc3339());
    engine.register_fn("now", |format: &str| -> Result<String, Box<EvalAltResult>> {
        format_now(format).ok_or_else(|| format!("invalid time format {format:?}").into())
    });

    engine
}

fn fake_value(kind: &str) -> Result<String, Box<EvalAltResult>> {
    use fake::faker::address::en::{CityName, CountryName, StreetName, ZipCode};
    use fake::faker::company::en::CompanyName;
    use fake::faker::internet::en::{SafeEmail, Username, IPv4};
    use fake::faker::lorem::en::{Sentence, Word};
    use fake::faker::name::en::{FirstName, LastName, Name};
    use fake::faker::phone_number::en::PhoneNumber;
    use fake::Fake;

    let value = match kind {
        "name" => Name().fake(),
        "first_name" => FirstName().fake(),
        "last_name" => LastName().fake(),
        "email" => SafeEmail().fake(),
        "username" => Username().fake(),
        "city" => CityName().fake(),
        "country" => CountryName().fake(),
        "street" => StreetName().fake(),
        "zip" => ZipCode().fake(),
        "company" => CompanyName().fake(),
        "phone" => PhoneNumber().fake(),
        "word" => Word().fake(),
        "sentence" => Sentence(3..8).fake(),
        "ipv4" => IPv4().fake(),
        other => return Err(format!("unknown fake data kind {other:?}").into()),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(text: &str) -> Result<String, ExpressionError> {
        let snapshot = RequestSnapshot::builder("POST", "/greet/Ada")
            .query_string("page=2&tag=a&tag=b")
            .route_param("name", "Ada")
            .json_body(json!({"user": {"id": 7}}))
            .build();
        RhaiExpressions::default().render(text, &snapshot)
    }

    #[test]
    fn test_plain_text_unchanged() {
        assert_eq!(render("no markers here").unwrap(), "no markers here");
        assert_eq!(
            render("open {{ but never closed").unwrap(),
            "open {{ but never closed"
        );
    }

    #[test]
    fn test_has_marker() {
        assert!(has_marker("{{ 1 }}"));
        assert!(has_marker("a {{x}} b"));
        assert!(!has_marker("[\"{{\"]"));
        assert!(!has_marker("}} {{"));
        assert!(!has_marker("plain"));
    }

    #[test]
    fn test_arithmetic_and_concatenation() {
        assert_eq!(render("{{ 1 + 2 }}").unwrap(), "3");
        assert_eq!(render("a{{ \"b\" }}c{{ 4 * 2 }}").unwrap(), "abc8");
    }

    #[test]
    fn test_request_context() {
        assert_eq!(render("Hello {{ request.route_params.name }}!").unwrap(), "Hello Ada!");
        assert_eq!(render("{{ request.method }} {{ request.path }}").unwrap(), "POST /greet/Ada");
        assert_eq!(render("{{ request.args.page }}").unwrap(), "2");
        assert_eq!(render("{{ request.body.user.id }}").unwrap(), "7");
        assert_eq!(render("{{ request.query.tag }}").unwrap(), r#"["a","b"]"#);
    }

    #[test]
    fn test_uuid4_is_fresh_per_evaluation() {
        let first = render("{{ uuid4() }}").unwrap();
        let second = render("{{ uuid4() }}").unwrap();
        assert_eq!(first.len(), 36);
        assert_ne!(first, second);
    }

    #[test]
    fn test_random_helpers() {
        for _ in 0..20 {
            let n: i64 = render("{{ random_int(1, 10) }}").unwrap().parse().unwrap();
            assert!((1..=10).contains(&n));
        }
        let f: f64 = render("{{ random_float(2.0, 3.0) }}").unwrap().parse().unwrap();
        assert!((2.0..=3.0).contains(&f));
        assert_eq!(render("{{ random_string(12) }}").unwrap().len(), 12);

        let choice = render(r#"{{ random_choice(["x", "y"]) }}"#).unwrap();
        assert!(choice == "x" || choice == "y");
        assert_eq!(render("{{ random_choice([]) }}").unwrap(), "");
    }

    #[test]
    fn test_hash_and_encoding_helpers() {
        assert_eq!(
            render(r#"{{ sha256("abc") }}"#).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(render(r#"{{ base64_encode("hi") }}"#).unwrap(), "aGk=");
        assert_eq!(render(r#"{{ base64_decode("aGk=") }}"#).unwrap(), "hi");
        assert!(render(r#"{{ base64_decode("@@") }}"#).is_err());
    }

    #[test]
    fn test_fake_and_env() {
        assert!(render(r#"{{ fake("email") }}"#).unwrap().contains('@'));
        assert!(!render(r#"{{ fake("name") }}"#).unwrap().is_empty());
        assert!(render(r#"{{ fake("dragon") }}"#).is_err());
        assert_eq!(
            render(r#"{{ env("RULEMOCK_SURELY_UNSET_VAR", "fallback") }}"#).unwrap(),
            "fallback"
        );
    }

    #[test]
    fn test_now_formats() {
        let year = render(r#"{{ now("%Y") }}"#).unwrap();
        assert_eq!(year.len(), 4);
        assert!(render(r#"{{ now("%Q") }}"#).is_err());
    }

    #[test]
    fn test_array_results_are_json() {
        assert_eq!(render("{{ [1, 2] }}").unwrap(), "[1,2]");
    }

    #[test]
    fn test_errors() {
        assert!(matches!(render("{{ 1 + }}"), Err(ExpressionError::Compile { .. })));
        assert!(matches!(render("{{ no_such_fn() }}"), Err(ExpressionError::Eval { .. })));
    }

    #[test]
    fn test_compiled_expressions_are_cached() {
        let expressions = RhaiExpressions::new(8);
        let snapshot = RequestSnapshot::default();
        for _ in 0..3 {
            expressions.render("{{ 40 + 2 }}", &snapshot).unwrap();
        }
        assert_eq!(expressions.cached(), 1);
    }
}
