//! Configuration for the mock server.
//!
//! Defines endpoints, their ordered rules or named scenarios, response
//! payloads, and server settings.

use crate::endpoint::RoutePattern;
use crate::extract::Target;
use crate::operator::Operator;
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "RULEMOCK";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid endpoint file pattern {pattern:?}: {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("invalid endpoint {method} {path}: {reason}")]
    InvalidEndpoint {
        method: String,
        path: String,
        reason: String,
    },

    #[error("duplicate endpoint {method} {path}")]
    DuplicateEndpoint { method: String, path: String },

    #[error("invalid route {path}: {reason}")]
    InvalidRoute { path: String, reason: String },
}

/// Main configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockConfig {
    /// Listener settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Verbose logging
    #[serde(default)]
    pub debug: bool,

    /// Directories scanned recursively for endpoint files
    #[serde(default)]
    pub endpoints_path: Vec<PathBuf>,

    /// File-name pattern for endpoint files
    #[serde(default = "default_endpoints_glob")]
    pub endpoints_glob: String,

    /// Directory holding named response templates
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,

    /// Response cache
    #[serde(default)]
    pub cache: CacheSettings,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,

    /// Inline endpoint definitions
    #[serde(default)]
    pub endpoints: Vec<EndpointDefinition>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            debug: false,
            endpoints_path: Vec::new(),
            endpoints_glob: default_endpoints_glob(),
            templates_dir: default_templates_dir(),
            cache: CacheSettings::default(),
            settings: GlobalSettings::default(),
            endpoints: Vec::new(),
        }
    }
}

fn default_endpoints_glob() -> String {
    "*.{yaml,yml}".to_string()
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("templates")
}

impl MockConfig {
    /// Load configuration from a YAML file.
    ///
    /// Applies environment overrides, then loads endpoint files and
    /// validates the result. Relative directories resolve against the
    /// configuration file's directory.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&content, path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        config.load_endpoint_files()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document. `origin` is only used in error messages.
    pub fn parse(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Apply `RULEMOCK__*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}__{name}"));

        if let Some(host) = var("SERVER__HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("SERVER__PORT") {
            match port.trim().parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!(value = %port, "Invalid port in environment, ignoring"),
            }
        }
        if let Some(debug) = var("DEBUG") {
            self.debug = debug.trim().eq_ignore_ascii_case("true");
        }
        if let Some(paths) = var("ENDPOINTS_PATH") {
            self.endpoints_path = paths
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect();
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        for dir in &mut self.endpoints_path {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
        if self.templates_dir.is_relative() {
            self.templates_dir = base.join(&self.templates_dir);
        }
    }

    /// Append endpoints found under `endpoints_path` to the inline ones.
    ///
    /// Missing directories are skipped with a warning; unreadable or
    /// malformed endpoint files are errors.
    pub fn load_endpoint_files(&mut self) -> Result<(), ConfigError> {
        let matcher = endpoint_file_matcher(&self.endpoints_glob)?;

        for dir in &self.endpoints_path {
            if !dir.is_dir() {
                warn!(path = %dir.display(), "Endpoints directory does not exist");
                continue;
            }

            let mut files = Vec::new();
            collect_files(dir, &matcher, &mut files).map_err(|source| ConfigError::Io {
                path: dir.clone(),
                source,
            })?;
            files.sort();

            for file in files {
                let loaded = load_endpoint_file(&file)?;
                debug!(path = %file.display(), endpoints = loaded.len(), "Loaded endpoint file");
                self.endpoints.extend(loaded);
            }
        }

        info!(endpoints = self.endpoints.len(), "Endpoint definitions loaded");
        Ok(())
    }

    /// Validate every endpoint and reject duplicate method/path pairs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            endpoint.validate()?;
            let key = (endpoint.method.to_uppercase(), endpoint.path.clone());
            if !seen.insert(key) {
                return Err(ConfigError::DuplicateEndpoint {
                    method: endpoint.method.to_uppercase(),
                    path: endpoint.path.clone(),
                });
            }
        }
        Ok(())
    }
}

fn endpoint_file_matcher(pattern: &str) -> Result<GlobMatcher, ConfigError> {
    Glob::new(pattern)
        .map(|glob| glob.compile_matcher())
        .map_err(|source| ConfigError::InvalidGlob {
            pattern: pattern.to_string(),
            source,
        })
}

fn collect_files(dir: &Path, matcher: &GlobMatcher, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, matcher, out)?;
        } else if path
            .file_name()
            .is_some_and(|name| matcher.is_match(Path::new(name)))
        {
            out.push(path);
        }
    }
    Ok(())
}

/// An endpoint file holds one endpoint mapping or a list of them.
fn load_endpoint_file(path: &Path) -> Result<Vec<EndpointDefinition>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_err = |source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    };

    let document: serde_yaml::Value = serde_yaml::from_str(&content).map_err(parse_err)?;
    match document {
        serde_yaml::Value::Null => Ok(Vec::new()),
        serde_yaml::Value::Sequence(_) => serde_yaml::from_value(document).map_err(parse_err),
        serde_yaml::Value::Mapping(_) => serde_yaml::from_value(document)
            .map(|endpoint| vec![endpoint])
            .map_err(parse_err),
        _ => {
            warn!(path = %path.display(), "Skipping endpoint file that is not a mapping");
            Ok(Vec::new())
        }
    }
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Entry lifetime in seconds
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,

    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_seconds: default_cache_ttl(),
            max_entries: default_cache_entries(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_cache_entries() -> usize {
    1024
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Log all matched rules
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log requests no rule matched
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Capacity of each compiled-pattern cache
    #[serde(default = "default_pattern_cache_size")]
    pub pattern_cache_size: usize,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
            pattern_cache_size: default_pattern_cache_size(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_pattern_cache_size() -> usize {
    crate::patterns::DEFAULT_CAPACITY
}

/// One mocked endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointDefinition {
    /// Route template, e.g. `/users/{id}` or `/greet/<name>`
    pub path: String,

    pub method: String,

    /// Ordered rules (first match wins)
    #[serde(default)]
    pub rules: Option<Vec<RuleDefinition>>,

    /// Ordered named scenarios (first match wins)
    #[serde(default)]
    pub scenarios: Option<Vec<ScenarioDefinition>>,

    /// Template used for every response that does not name its own
    #[serde(default)]
    pub template: Option<String>,

    /// Payload used when nothing matches
    #[serde(default)]
    pub default_response: Option<ResponsePayload>,
}

impl EndpointDefinition {
    /// Validate the endpoint definition.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidEndpoint {
            method: self.method.clone(),
            path: self.path.clone(),
            reason,
        };

        if !self.path.starts_with('/') {
            return Err(invalid("path must start with '/'".to_string()));
        }
        if self.method.is_empty() || !self.method.chars().all(is_token_char) {
            return Err(invalid(format!("invalid HTTP method {:?}", self.method)));
        }
        if self.rules.is_some() && self.scenarios.is_some() {
            return Err(invalid(
                "rules and scenarios are mutually exclusive".to_string(),
            ));
        }
        RoutePattern::parse(&self.path).map_err(|reason| ConfigError::InvalidRoute {
            path: self.path.clone(),
            reason,
        })?;

        let payloads = self
            .rules
            .iter()
            .flatten()
            .map(|r| &r.response)
            .chain(self.scenarios.iter().flatten().map(|s| &s.response))
            .chain(self.default_response.as_ref());
        for payload in payloads {
            payload.validate().map_err(invalid)?;
        }
        Ok(())
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

/// A rule: AND-combined conditions plus the response they select.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    pub response: ResponsePayload,
}

/// A named rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioDefinition {
    #[serde(default = "default_scenario_name", alias = "scenario_name")]
    pub name: String,

    #[serde(default, alias = "rules_data")]
    pub conditions: Vec<Condition>,

    pub response: ResponsePayload,
}

fn default_scenario_name() -> String {
    "Unnamed".to_string()
}

/// A single predicate over an extracted request value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    pub target: Target,

    /// Dotted key path, or a JSONPath expression starting with `$`
    #[serde(default, alias = "prop")]
    pub property: Option<String>,

    #[serde(alias = "op")]
    pub operator: Operator,

    /// Expected operand
    #[serde(default)]
    pub value: Value,

    /// Negate the operator's result
    #[serde(default)]
    pub invert: bool,
}

/// Response selected by a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponsePayload {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Response data; string values may hold `{{ ... }}` expressions
    #[serde(default)]
    pub data: Map<String, Value>,

    /// Named template rendered with `data` and the route parameters
    #[serde(default)]
    pub template: Option<String>,

    /// Response headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_status() -> u16 {
    200
}

impl Default for ResponsePayload {
    fn default() -> Self {
        Self {
            status: default_status(),
            data: Map::new(),
            template: None,
            headers: HashMap::new(),
        }
    }
}

impl ResponsePayload {
    pub fn validate(&self) -> Result<(), String> {
        if !(100..=599).contains(&self.status) {
            return Err(format!("invalid status code: {}", self.status));
        }
        Ok(())
    }
}
