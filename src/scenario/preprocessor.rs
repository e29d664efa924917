//! Step preprocessor
//!
//! ```yaml
//! preprocessor:
//!   mapping:
//!     user_id: source.users[next].id
//!     nonce: randString(8)
//!     request_id: uuid()
//! ```
//!
//! Each mapping value is a variable path or a helper call. The result lands
//! in `request.<step>.preprocessor`.

use super::template::Helper;
use super::vars::{VarPath, Vars};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PreprocessorConfig {
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Path(VarPath),
    Helper(Helper),
}

/// Compiled preprocessor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preprocessor {
    mapping: Vec<(String, Expr)>,
}

impl Preprocessor {
    pub fn compile(cfg: &PreprocessorConfig) -> Result<Self, String> {
        let mapping = cfg
            .mapping
            .iter()
            .map(|(name, expr)| {
                parse_expr(expr)
                    .map(|e| (name.clone(), e))
                    .map_err(|e| format!("preprocessor {:?}: {}", name, e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { mapping })
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn run(&self, vars: &Vars<'_>) -> Result<Map<String, Value>, String> {
        let mut out = Map::new();
        for (name, expr) in &self.mapping {
            let value = match expr {
                Expr::Path(path) => vars.resolve(path),
                Expr::Helper(helper) => Ok(helper.eval(vars.storage)),
            }
            .map_err(|e| format!("preprocessor {:?}: {}", name, e))?;
            out.insert(name.clone(), value);
        }
        Ok(out)
    }
}

/// `name(arg, ...)` is a helper call, anything else a path
fn parse_expr(expr: &str) -> Result<Expr, String> {
    let expr = expr.trim();
    if let Some(open) = expr.find('(') {
        let name = &expr[..open];
        let inner = expr[open + 1..]
            .strip_suffix(')')
            .ok_or_else(|| format!("unclosed call {:?}", expr))?;
        let args: Vec<&str> = if inner.trim().is_empty() {
            Vec::new()
        } else {
            inner.split(',').map(str::trim).collect()
        };
        return Helper::from_call(name.trim(), &args).map(Expr::Helper);
    }
    VarPath::parse(expr).map(Expr::Path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::vars::VariableStorage;
    use serde_json::json;

    fn compile(pairs: &[(&str, &str)]) -> Result<Preprocessor, String> {
        let cfg = PreprocessorConfig {
            mapping: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        };
        Preprocessor::compile(&cfg)
    }

    #[test]
    fn test_paths_and_helpers() {
        let pre = compile(&[
            ("user", "source.users[next].id"),
            ("n", "randInt(5, 6)"),
            ("s", "randString(4, ab)"),
            ("id", "uuid()"),
        ])
        .unwrap();
        let storage = VariableStorage::with_seed(json!({"users": [{"id": 10}, {"id": 20}]}), 3);
        let request = json!({});
        let vars = Vars::new(&storage, &request);

        let first = pre.run(&vars).unwrap();
        assert_eq!(first["user"], json!(10));
        assert_eq!(first["n"], json!(5));
        assert_eq!(first["s"].as_str().unwrap().len(), 4);
        assert!(uuid::Uuid::parse_str(first["id"].as_str().unwrap()).is_ok());

        let second = pre.run(&vars).unwrap();
        assert_eq!(second["user"], json!(20));
    }

    #[test]
    fn test_compile_errors_name_the_key() {
        let err = compile(&[("bad", "randInt(1")]).unwrap_err();
        assert!(err.contains("\"bad\""));
        assert!(compile(&[("x", "nope()")]).is_err());
        assert!(compile(&[("x", "a..b")]).is_err());
    }

    #[test]
    fn test_missing_variable_fails_at_run() {
        let pre = compile(&[("t", "request.auth.token")]).unwrap();
        let storage = VariableStorage::with_seed(json!({}), 1);
        let request = json!({});
        assert!(pre.run(&Vars::new(&storage, &request)).is_err());
    }
}
