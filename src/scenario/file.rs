//! Scenario file loader
//!
//! Parses the YAML (or JSON, by extension) scenario file, loads variable
//! sources, compiles every request and expands scenario weights into the
//! round-robin rotation the provider iterates.

use super::postprocessor::{Postprocessor, PostprocessorConfig};
use super::preprocessor::{Preprocessor, PreprocessorConfig};
use super::sources::{self, SourceConfig};
use super::template::{Field, TemplateCache, TemplaterKind};
use super::vars::VariableStorage;
use super::{RequestStep, Scenario, Step};
use crate::error::ConfigError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// `name`, `name(count)` or `name(count, sleep_ms)`
const STEP_REF_REGEX: &str = r"^([A-Za-z0-9_.\-]+)(?:\(\s*(\d+)\s*(?:,\s*(\d+)\s*)?\))?$";

/// `sleep(ms)`
const SLEEP_REF_REGEX: &str = r"^sleep\(\s*(\d+)\s*\)$";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioFile {
    #[serde(default)]
    pub variable_sources: Vec<SourceConfig>,
    #[serde(default)]
    pub requests: Vec<RequestConfig>,
    #[serde(default)]
    pub scenarios: Vec<ScenarioConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    pub name: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub uri: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub templater: TemplaterKind,
    #[serde(default)]
    pub preprocessor: PreprocessorConfig,
    #[serde(default)]
    pub postprocessors: Vec<PostprocessorConfig>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: u64,
    /// Milliseconds
    #[serde(default)]
    pub min_waiting_time: u64,
    pub requests: Vec<String>,
}

fn default_weight() -> u64 {
    1
}

/// Parse a scenario file by extension; `.json` is JSON, anything else YAML
pub fn parse(path: &Path, text: &str) -> Result<ScenarioFile, ConfigError> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    let parsed = if is_json {
        serde_json::from_str(text).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(text).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| ConfigError::new(format!("scenario file {}: {}", path.display(), e)))
}

/// Load a scenario file into its weighted rotation
pub fn load(path: &Path) -> Result<Vec<Arc<Scenario>>, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::new(format!("Failed to read scenario file {}: {}", path.display(), e)))?;
    let file = parse(path, &text)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    build(&file, base_dir).map_err(|e| ConfigError::new(format!("scenario file {}: {}", path.display(), e.0)))
}

/// Compile a parsed file; relative source paths resolve against `base_dir`
pub fn build(file: &ScenarioFile, base_dir: &Path) -> Result<Vec<Arc<Scenario>>, ConfigError> {
    if file.scenarios.is_empty() {
        return Err(ConfigError::new("no scenarios defined"));
    }

    let sources = sources::load_all(&file.variable_sources, base_dir).map_err(|e| ConfigError::new(format!("{:#}", e)))?;
    let storage = Arc::new(VariableStorage::new(sources));
    let templates = Arc::new(TemplateCache::new());

    let mut requests: HashMap<&str, Arc<RequestStep>> = HashMap::new();
    for req in &file.requests {
        if requests.contains_key(req.name.as_str()) {
            return Err(ConfigError::new(format!("request {:?} is defined twice", req.name)));
        }
        let compiled = compile_request(req).map_err(|e| ConfigError::new(format!("request {:?}: {}", req.name, e)))?;
        requests.insert(req.name.as_str(), Arc::new(compiled));
    }

    let refs = StepRefParser::new()?;
    let mut scenarios = Vec::with_capacity(file.scenarios.len());
    for cfg in &file.scenarios {
        if cfg.weight == 0 {
            return Err(ConfigError::new(format!("scenario {:?}: weight must be greater than 0", cfg.name)));
        }
        let steps = refs
            .steps(&cfg.requests, &requests)
            .map_err(|e| ConfigError::new(format!("scenario {:?}: {}", cfg.name, e)))?;
        for step in &steps {
            precompile(&templates, &cfg.name, &step.request)
                .map_err(|e| ConfigError::new(format!("scenario {:?} request {:?}: {}", cfg.name, step.request.name, e)))?;
        }
        debug!(scenario = %cfg.name, steps = steps.len(), weight = cfg.weight, "Scenario loaded");
        scenarios.push((
            Arc::new(Scenario {
                name: cfg.name.clone(),
                steps,
                min_waiting_time: Duration::from_millis(cfg.min_waiting_time),
                storage: Arc::clone(&storage),
                templates: Arc::clone(&templates),
            }),
            cfg.weight,
        ));
    }

    Ok(expand_weights(&scenarios))
}

fn compile_request(cfg: &RequestConfig) -> Result<RequestStep, String> {
    if cfg.uri.is_empty() {
        return Err("uri must be set".to_string());
    }
    let postprocessors = cfg
        .postprocessors
        .iter()
        .map(Postprocessor::compile)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RequestStep {
        name: cfg.name.clone(),
        method: cfg.method.to_ascii_uppercase(),
        uri: cfg.uri.clone(),
        headers: cfg.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        body: cfg.body.clone(),
        tag: cfg.tag.clone().unwrap_or_else(|| cfg.name.clone()),
        templater: cfg.templater,
        preprocessor: Preprocessor::compile(&cfg.preprocessor)?,
        postprocessors,
    })
}

/// Compile every template of a step up front so syntax errors fail the load
fn precompile(cache: &TemplateCache, scenario: &str, req: &RequestStep) -> Result<(), String> {
    cache.get_or_compile(scenario, &req.name, Field::Uri, &req.uri)?;
    for (name, value) in &req.headers {
        cache.get_or_compile(scenario, &req.name, Field::Header(name.clone()), value)?;
    }
    if let Some(ref body) = req.body {
        cache.get_or_compile(scenario, &req.name, Field::Body, body)?;
    }
    Ok(())
}

struct StepRefParser {
    step_re: Regex,
    sleep_re: Regex,
}

impl StepRefParser {
    fn new() -> Result<Self, ConfigError> {
        let compile = |re: &str| Regex::new(re).map_err(|e| ConfigError::new(format!("step reference regex: {}", e)));
        Ok(Self {
            step_re: compile(STEP_REF_REGEX)?,
            sleep_re: compile(SLEEP_REF_REGEX)?,
        })
    }

    fn steps(&self, refs: &[String], requests: &HashMap<&str, Arc<RequestStep>>) -> Result<Vec<Step>, String> {
        let mut steps: Vec<Step> = Vec::new();
        for text in refs {
            let text = text.trim();
            if let Some(caps) = self.sleep_re.captures(text) {
                let ms: u64 = caps[1].parse().map_err(|_| format!("bad sleep {:?}", text))?;
                let last = steps
                    .last_mut()
                    .ok_or_else(|| format!("{:?} must follow a request", text))?;
                last.sleep += Duration::from_millis(ms);
                continue;
            }

            let caps = self
                .step_re
                .captures(text)
                .ok_or_else(|| format!("invalid request reference {:?}", text))?;
            let request = requests
                .get(&caps[1])
                .ok_or_else(|| format!("unknown request {:?}", &caps[1]))?;
            let count = match caps.get(2) {
                Some(m) => m.as_str().parse::<usize>().map_err(|_| format!("bad count in {:?}", text))?,
                None => 1,
            };
            if count == 0 {
                return Err(format!("{:?}: count must be greater than 0", text));
            }
            let sleep = match caps.get(3) {
                Some(m) => Duration::from_millis(m.as_str().parse().map_err(|_| format!("bad sleep in {:?}", text))?),
                None => Duration::ZERO,
            };
            for _ in 0..count {
                steps.push(Step {
                    request: Arc::clone(request),
                    sleep,
                });
            }
        }
        if steps.is_empty() {
            return Err("no requests".to_string());
        }
        Ok(steps)
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Repeat each scenario `weight / gcd(weights)` times, in declaration order
pub fn expand_weights(weighted: &[(Arc<Scenario>, u64)]) -> Vec<Arc<Scenario>> {
    let divisor = weighted.iter().fold(0, |acc, (_, w)| gcd(acc, *w)).max(1);
    weighted
        .iter()
        .flat_map(|(scenario, weight)| std::iter::repeat(Arc::clone(scenario)).take((*weight / divisor) as usize))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
variable_sources:
  - type: variables
    name: vars
    variables:
      users: [{id: 1}, {id: 2}]
requests:
  - name: auth
    method: post
    uri: /auth
    body: '{"id": {{ .request.auth.preprocessor.id }}}'
    preprocessor:
      mapping:
        id: source.vars.users[next].id
    postprocessors:
      - type: var/jsonpath
        mapping:
          token: $.token
  - name: list
    tag: items
    uri: /list
    headers:
      Authorization: Bearer {{ .request.auth.token }}
scenarios:
  - name: a
    weight: 20
    min_waiting_time: 250
    requests: [auth, sleep(100), sleep(50), 'list(3, 10)']
  - name: b
    weight: 30
    requests: [list]
  - name: c
    weight: 60
    requests: [auth]
"#;

    fn build_str(text: &str) -> Result<Vec<Arc<Scenario>>, ConfigError> {
        let file = parse(Path::new("s.yaml"), text)?;
        build(&file, Path::new("."))
    }

    #[test]
    fn test_steps_and_sleeps() {
        let rotation = build_str(SCENARIO).unwrap();
        let a = &rotation[0];
        assert_eq!(a.name, "a");
        assert_eq!(a.min_waiting_time, Duration::from_millis(250));
        assert_eq!(a.steps.len(), 4);
        assert_eq!(a.steps[0].sleep, Duration::from_millis(150));
        assert_eq!(a.steps[0].request.method, "POST");
        assert!(a.steps[1..].iter().all(|s| s.sleep == Duration::from_millis(10)));
        assert_eq!(a.step_tag(&a.steps[1]), "a.items");
        assert_eq!(a.step_tag(&a.steps[0]), "a.auth");
    }

    #[test]
    fn test_weights_expand_by_gcd() {
        let rotation = build_str(SCENARIO).unwrap();
        let names: Vec<&str> = rotation.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names.len(), 11);
        assert_eq!(names.iter().filter(|n| **n == "a").count(), 2);
        assert_eq!(names.iter().filter(|n| **n == "b").count(), 3);
        assert_eq!(names.iter().filter(|n| **n == "c").count(), 6);
    }

    #[test]
    fn test_scenarios_share_storage_and_templates() {
        let rotation = build_str(SCENARIO).unwrap();
        assert!(Arc::ptr_eq(&rotation[0].storage, &rotation[10].storage));
        assert!(Arc::ptr_eq(&rotation[0].templates, &rotation[2].templates));
        // auth uri+body under a and c, list uri+header under a and b
        assert_eq!(rotation[0].templates.len(), 8);
    }

    #[test]
    fn test_invalid_files() {
        let cases = [
            ("scenarios: []", "no scenarios"),
            (
                "requests: [{name: a, uri: /}]\nscenarios: [{name: s, requests: [sleep(10), a]}]",
                "must follow a request",
            ),
            ("requests: [{name: a, uri: /}]\nscenarios: [{name: s, requests: [b]}]", "unknown request"),
            ("requests: [{name: a, uri: /}]\nscenarios: [{name: s, weight: 0, requests: [a]}]", "weight"),
            ("requests: [{name: a, uri: /}]\nscenarios: [{name: s, requests: ['a(0)']}]", "count"),
            ("requests: [{name: a, uri: '/{{ .x'}]\nscenarios: [{name: s, requests: [a]}]", "unclosed"),
            (
                "requests: [{name: a, uri: /}, {name: a, uri: /b}]\nscenarios: [{name: s, requests: [a]}]",
                "defined twice",
            ),
        ];
        for (text, needle) in cases {
            let err = build_str(text).unwrap_err();
            assert!(err.to_string().contains(needle), "{:?}: {}", text, err);
        }
    }

    #[test]
    fn test_json_by_extension_and_relative_sources() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("users.csv"), "id\n7\n").unwrap();
        let path = dir.path().join("scenario.json");
        std::fs::write(
            &path,
            r#"{"variable_sources": [{"type": "file/csv", "name": "users", "file": "users.csv"}],
                "requests": [{"name": "r", "uri": "/u/{{ .source.users[0].id }}"}],
                "scenarios": [{"name": "s", "requests": ["r"]}]}"#,
        )
        .unwrap();
        let rotation = load(&path).unwrap();
        assert_eq!(rotation.len(), 1);
        assert_eq!(rotation[0].storage.sources()["users"][0]["id"], serde_json::json!("7"));
    }
}
