//! Named response templates.
//!
//! Templates are Handlebars files under the configured templates directory,
//! loaded on first use and kept registered until [`TemplateEngine::clear_cache`].

use crate::expression::format_now;
use handlebars::Handlebars;
use parking_lot::RwLock;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template not found: {name}")]
    NotFound { name: String },

    #[error("failed to render template {name}: {message}")]
    RenderFailed { name: String, message: String },
}

/// Renders a named template with a JSON context.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, name: &str, context: &Value) -> Result<String, TemplateError>;
}

/// Handlebars template engine backed by a directory.
pub struct TemplateEngine {
    handlebars: RwLock<Handlebars<'static>>,
    templates_dir: PathBuf,
}

impl TemplateEngine {
    /// Create a new template engine reading from `templates_dir`.
    pub fn new(templates_dir: impl Into<PathBuf>) -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));

        Self {
            handlebars: RwLock::new(handlebars),
            templates_dir: templates_dir.into(),
        }
    }

    pub fn templates_dir(&self) -> &Path {
        &self.templates_dir
    }

    /// Forget every loaded template so the next render rereads the file.
    pub fn clear_cache(&self) {
        self.handlebars.write().clear_templates();
    }

    fn ensure_loaded(&self, name: &str) -> Result<(), TemplateError> {
        if self.handlebars.read().has_template(name) {
            return Ok(());
        }

        let not_found = || TemplateError::NotFound {
            name: name.to_string(),
        };
        if !is_safe_name(name) {
            return Err(not_found());
        }

        let path = self.templates_dir.join(name);
        let source = std::fs::read_to_string(&path).map_err(|_| not_found())?;

        self.handlebars
            .write()
            .register_template_string(name, source)
            .map_err(|e| TemplateError::RenderFailed {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        debug!(template = name, path = %path.display(), "Loaded template");
        Ok(())
    }
}

impl TemplateRenderer for TemplateEngine {
    fn render(&self, name: &str, context: &Value) -> Result<String, TemplateError> {
        self.ensure_loaded(name)?;
        self.handlebars
            .read()
            .render(name, context)
            .map_err(|e| TemplateError::RenderFailed {
                name: name.to_string(),
                message: e.to_string(),
            })
    }
}

/// Relative path that stays inside the templates directory.
fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

// Custom Handlebars helpers

fn json_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).map(|v| v.value().clone()).unwrap_or(Value::Null);
    out.write(&value.to_string())?;
    Ok(())
}

fn uuid_helper(
    _: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    out.write(&uuid::Uuid::new_v4().to_string())?;
    Ok(())
}

fn now_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");

    let formatted = format_now(format).ok_or_else(|| {
        handlebars::RenderErrorReason::Other(format!("invalid time format {format:?}"))
    })?;
    out.write(&formatted)?;
    Ok(())
}

fn random_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;

    let a = h.param(0).and_then(|v| v.value().as_i64()).unwrap_or(0);
    let b = h.param(1).and_then(|v| v.value().as_i64()).unwrap_or(100);
    let (min, max) = if a <= b { (a, b) } else { (b, a) };

    let value = rand::thread_rng().gen_range(min..=max);
    out.write(&value.to_string())?;
    Ok(())
}

fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).map(|v| v.value());
    let default = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");

    match value {
        Some(Value::String(s)) if !s.is_empty() => out.write(s)?,
        Some(Value::String(_)) | Some(Value::Null) | None => out.write(default)?,
        Some(other) => out.write(&other.to_string())?,
    }
    Ok(())
}

fn upper_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_lowercase())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn engine_with(files: &[(&str, &str)]) -> (TempDir, TemplateEngine) {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, content).unwrap();
        }
        let engine = TemplateEngine::new(dir.path());
        (dir, engine)
    }

    #[test]
    fn test_render_named_template() {
        let (_dir, engine) = engine_with(&[("user.html", "<h1>User {{id}}: {{name}}</h1>")]);

        let html = engine
            .render("user.html", &json!({"id": "7", "name": "Ada"}))
            .unwrap();
        assert_eq!(html, "<h1>User 7: Ada</h1>");
    }

    #[test]
    fn test_nested_template_path() {
        let (_dir, engine) = engine_with(&[("pages/hello.txt", "Hello {{who}}")]);
        assert_eq!(
            engine.render("pages/hello.txt", &json!({"who": "you"})).unwrap(),
            "Hello you"
        );
    }

    #[test]
    fn test_missing_template() {
        let (_dir, engine) = engine_with(&[]);
        assert!(matches!(
            engine.render("nope.html", &json!({})),
            Err(TemplateError::NotFound { .. })
        ));
    }

    #[test]
    fn test_path_traversal_is_not_found() {
        let (dir, engine) = engine_with(&[("inner/ok.txt", "ok")]);
        std::fs::write(dir.path().join("secret.txt"), "secret").unwrap();
        let nested = TemplateEngine::new(dir.path().join("inner"));

        assert!(matches!(
            nested.render("../secret.txt", &json!({})),
            Err(TemplateError::NotFound { .. })
        ));
        assert!(matches!(
            engine.render("/etc/passwd", &json!({})),
            Err(TemplateError::NotFound { .. })
        ));
    }

    #[test]
    fn test_syntax_error_is_render_failure() {
        let (_dir, engine) = engine_with(&[("broken.html", "{{#if}}")]);
        assert!(matches!(
            engine.render("broken.html", &json!({})),
            Err(TemplateError::RenderFailed { .. })
        ));
    }

    #[test]
    fn test_values_are_html_escaped() {
        let (_dir, engine) = engine_with(&[("x.html", "<p>{{msg}}</p>")]);
        let html = engine.render("x.html", &json!({"msg": "<b>"})).unwrap();
        assert_eq!(html, "<p>&lt;b&gt;</p>");
    }

    #[test]
    fn test_clear_cache_rereads_file() {
        let (dir, engine) = engine_with(&[("v.txt", "one")]);
        assert_eq!(engine.render("v.txt", &json!({})).unwrap(), "one");

        std::fs::write(dir.path().join("v.txt"), "two").unwrap();
        assert_eq!(engine.render("v.txt", &json!({})).unwrap(), "one");

        engine.clear_cache();
        assert_eq!(engine.render("v.txt", &json!({})).unwrap(), "two");
    }

    #[test]
    fn test_helpers() {
        let (_dir, engine) = engine_with(&[
            ("case.txt", "{{upper name}} {{lower name}}"),
            ("default.txt", "{{default missing \"fallback\"}}|{{default count \"x\"}}"),
            ("uuid.txt", "{{uuid}}"),
            ("random.txt", "{{random 5 5}}"),
        ]);
        let ctx = json!({"name": "Ada", "count": 3});

        assert_eq!(engine.render("case.txt", &ctx).unwrap(), "ADA ada");
        assert_eq!(engine.render("default.txt", &ctx).unwrap(), "fallback|3");
        assert_eq!(engine.render("uuid.txt", &ctx).unwrap().len(), 36);
        assert_eq!(engine.render("random.txt", &ctx).unwrap(), "5");
    }
}
