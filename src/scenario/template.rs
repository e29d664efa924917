//! Request templating
//!
//! A small subset of Go template syntax:
//!
//! ```text
//! /users/{{ .request.auth.preprocessor.user_id }}?r={{ randInt 1 100 }}
//! Authorization: Bearer {{.request.auth.postprocessor.token}}
//! {"nonce": "{{ randString 8 }}", "id": "{{ uuid }}"}
//! ```
//!
//! The `html` templater escapes every substituted value; literal text is
//! never touched. Compiled templates are cached per `(scenario, step, field)`.

use super::vars::{value_to_string, VarPath, Vars, VariableStorage, DEFAULT_ALPHABET};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplaterKind {
    #[default]
    Text,
    Html,
}

/// Built-in value generators shared by templates and preprocessors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Helper {
    /// Integer in `[lo, hi)`
    RandInt(i64, i64),
    RandString(usize, String),
    Uuid,
}

impl Helper {
    /// Build from a helper name and its already split arguments
    pub fn from_call(name: &str, args: &[&str]) -> Result<Self, String> {
        let int = |s: &str| {
            s.trim()
                .parse::<i64>()
                .map_err(|_| format!("{}: {:?} is not an integer", name, s))
        };
        match (name, args.len()) {
            ("randInt", 0) => Ok(Helper::RandInt(0, i32::MAX as i64)),
            ("randInt", 1) => Ok(Helper::RandInt(0, int(args[0])?)),
            ("randInt", 2) => Ok(Helper::RandInt(int(args[0])?, int(args[1])?)),
            ("randString", 0) => Ok(Helper::RandString(1, DEFAULT_ALPHABET.to_string())),
            ("randString", n @ (1 | 2)) => {
                let len = int(args[0])?;
                let len = usize::try_from(len).map_err(|_| format!("randString: negative length {}", len))?;
                let alphabet = if n == 2 { unquote(args[1]) } else { DEFAULT_ALPHABET };
                if alphabet.is_empty() {
                    return Err("randString: empty alphabet".to_string());
                }
                Ok(Helper::RandString(len, alphabet.to_string()))
            }
            ("uuid", 0) => Ok(Helper::Uuid),
            ("randInt" | "randString" | "uuid", n) => Err(format!("{}: unexpected {} argument(s)", name, n)),
            _ => Err(format!("unknown function {:?}", name)),
        }
    }

    pub fn eval(&self, storage: &VariableStorage) -> Value {
        match self {
            Helper::RandInt(lo, hi) => Value::from(storage.rand_int(*lo, *hi)),
            Helper::RandString(len, alphabet) => Value::String(storage.rand_string(*len, alphabet)),
            Helper::Uuid => Value::String(uuid::Uuid::new_v4().to_string()),
        }
    }
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Path(VarPath),
    Helper(Helper),
}

/// Compiled template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    parts: Vec<Part>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, String> {
        let mut parts = Vec::new();
        let mut rest = source;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                parts.push(Part::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or_else(|| format!("unclosed action in template {:?}", source))?;
            parts.push(parse_action(after[..close].trim())?);
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }
        Ok(Self { parts })
    }

    /// Template without actions renders to itself
    pub fn is_static(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, Part::Literal(_)))
    }

    pub fn render(&self, vars: &Vars<'_>, kind: TemplaterKind) -> Result<String, String> {
        let mut out = String::new();
        for part in &self.parts {
            let value = match part {
                Part::Literal(text) => {
                    out.push_str(text);
                    continue;
                }
                Part::Path(path) => value_to_string(&vars.resolve(path)?),
                Part::Helper(helper) => value_to_string(&helper.eval(vars.storage)),
            };
            match kind {
                TemplaterKind::Text => out.push_str(&value),
                TemplaterKind::Html => escape_html(&value, &mut out),
            }
        }
        Ok(out)
    }
}

fn parse_action(action: &str) -> Result<Part, String> {
    if action.is_empty() {
        return Err("empty template action".to_string());
    }
    if action.starts_with('.') {
        return VarPath::parse(action).map(Part::Path);
    }
    let mut words = split_words(action)?;
    let name = words.remove(0);
    Helper::from_call(name, &words).map(Part::Helper)
}

/// Split on whitespace, keeping double-quoted words together
fn split_words(action: &str) -> Result<Vec<&str>, String> {
    let mut words = Vec::new();
    let mut rest = action.trim_start();
    while !rest.is_empty() {
        if rest.starts_with('"') {
            let end = rest[1..]
                .find('"')
                .ok_or_else(|| format!("unterminated string in {:?}", action))?;
            words.push(&rest[..end + 2]);
            rest = rest[end + 2..].trim_start();
        } else {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            words.push(&rest[..end]);
            rest = rest[end..].trim_start();
        }
    }
    Ok(words)
}

fn escape_html(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
}

/// Request field a template belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    Uri,
    Header(String),
    Body,
}

/// Compiled templates keyed by `(scenario, step, field)`
#[derive(Debug, Default)]
pub struct TemplateCache {
    templates: DashMap<(String, String, Field), Arc<Template>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(&self, scenario: &str, step: &str, field: Field, source: &str) -> Result<Arc<Template>, String> {
        let key = (scenario.to_string(), step.to_string(), field);
        if let Some(t) = self.templates.get(&key) {
            return Ok(Arc::clone(&t));
        }
        let compiled = Arc::new(Template::parse(source)?);
        self.templates.insert(key, Arc::clone(&compiled));
        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
