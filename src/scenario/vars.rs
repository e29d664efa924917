//! Scenario variables
//!
//! Variables are `serde_json::Value` trees. Two roots exist:
//!
//! - `source`: tables loaded once from variable sources, shared and immutable
//! - `request`: per-shot overlay filled by pre- and postprocessors
//!
//! Paths navigate them: `source.users[next].id`, `request.auth.token`,
//! `source.list[-1]`. Index forms:
//!
//! - `[3]`, `[-1]`: position, wrapped around the length
//! - `[next]`: per-path counter shared by every instance, modulo length
//! - `[rand]`: uniformly random element
//! - `[last]`: final element

use dashmap::DashMap;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Alphabet used by `randString` when none is given
pub const DEFAULT_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Index {
    At(i64),
    Next,
    Rand,
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(Index),
}

/// Parsed variable path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarPath {
    text: String,
    segments: Vec<Segment>,
}

impl VarPath {
    /// Parse `a.b[0].c`; a leading `.` is accepted
    pub fn parse(text: &str) -> Result<Self, String> {
        let trimmed = text.trim();
        let body = trimmed.strip_prefix('.').unwrap_or(trimmed);
        if body.is_empty() {
            return Err("empty variable path".to_string());
        }

        let mut segments = Vec::new();
        let mut key = String::new();
        let mut chars = body.chars();
        let mut expect_key = true;

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if key.is_empty() && expect_key {
                        return Err(format!("empty segment in path {:?}", text));
                    }
                    if !key.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut key)));
                    }
                    expect_key = true;
                }
                '[' => {
                    if !key.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut key)));
                    } else if segments.is_empty() {
                        return Err(format!("path {:?} starts with an index", text));
                    }
                    let mut inner = String::new();
                    loop {
                        match chars.next() {
                            Some(']') => break,
                            Some(c) => inner.push(c),
                            None => return Err(format!("unclosed '[' in path {:?}", text)),
                        }
                    }
                    segments.push(Segment::Index(parse_index(inner.trim(), text)?));
                    expect_key = false;
                }
                ']' => return Err(format!("unexpected ']' in path {:?}", text)),
                c if c.is_whitespace() => return Err(format!("whitespace in path {:?}", text)),
                c => {
                    key.push(c);
                    expect_key = false;
                }
            }
        }
        if !key.is_empty() {
            segments.push(Segment::Key(key));
        } else if expect_key {
            return Err(format!("path {:?} ends with '.'", text));
        }

        Ok(Self {
            text: body.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    fn root(&self) -> Option<&str> {
        match self.segments.first() {
            Some(Segment::Key(k)) => Some(k),
            _ => None,
        }
    }
}

fn parse_index(inner: &str, text: &str) -> Result<Index, String> {
    match inner {
        "next" => Ok(Index::Next),
        "rand" => Ok(Index::Rand),
        "last" => Ok(Index::Last),
        n => n
            .parse::<i64>()
            .map(Index::At)
            .map_err(|_| format!("invalid index [{}] in path {:?}", inner, text)),
    }
}

impl fmt::Display for VarPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Immutable sources plus the shared iterator state
pub struct VariableStorage {
    sources: Value,
    counters: DashMap<String, AtomicU64>,
    rng: Mutex<Xoshiro256PlusPlus>,
}

impl fmt::Debug for VariableStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariableStorage")
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

impl VariableStorage {
    pub fn new(sources: Value) -> Self {
        Self::with_rng(sources, Xoshiro256PlusPlus::from_entropy())
    }

    /// Deterministic storage for tests
    pub fn with_seed(sources: Value, seed: u64) -> Self {
        Self::with_rng(sources, Xoshiro256PlusPlus::seed_from_u64(seed))
    }

    fn with_rng(sources: Value, rng: Xoshiro256PlusPlus) -> Self {
        Self {
            sources,
            counters: DashMap::new(),
            rng: Mutex::new(rng),
        }
    }

    pub fn sources(&self) -> &Value {
        &self.sources
    }

    fn next_index(&self, key: &str, len: usize) -> usize {
        if let Some(counter) = self.counters.get(key) {
            return (counter.fetch_add(1, Ordering::Relaxed) % len as u64) as usize;
        }
        let counter = self.counters.entry(key.to_string()).or_insert_with(|| AtomicU64::new(0));
        (counter.fetch_add(1, Ordering::Relaxed) % len as u64) as usize
    }

    fn rng(&self) -> std::sync::MutexGuard<'_, Xoshiro256PlusPlus> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn rand_index(&self, len: usize) -> usize {
        self.rng().gen_range(0..len)
    }

    /// Uniform integer in `[lo, hi)`; `lo` when the range is empty
    pub fn rand_int(&self, lo: i64, hi: i64) -> i64 {
        if hi <= lo {
            return lo;
        }
        self.rng().gen_range(lo..hi)
    }

    pub fn rand_string(&self, len: usize, alphabet: &str) -> String {
        let chars: Vec<char> = alphabet.chars().collect();
        if chars.is_empty() {
            return String::new();
        }
        let mut rng = self.rng();
        (0..len).map(|_| chars[rng.gen_range(0..chars.len())]).collect()
    }
}

/// Variable view of one shot
pub struct Vars<'a> {
    pub storage: &'a VariableStorage,
    pub request: &'a Value,
}

impl<'a> Vars<'a> {
    pub fn new(storage: &'a VariableStorage, request: &'a Value) -> Self {
        Self { storage, request }
    }

    /// Look up a path, returning a copy of the value
    pub fn resolve(&self, path: &VarPath) -> Result<Value, String> {
        let mut current = match path.root() {
            Some("source") => self.storage.sources(),
            Some("request") => self.request,
            Some(other) => {
                return Err(format!(
                    "path {:?}: unknown root {:?}, expected source or request",
                    path.text, other
                ))
            }
            None => return Err(format!("path {:?} has no root", path.text)),
        };

        let mut prefix = String::new();
        for (i, segment) in path.segments.iter().enumerate() {
            match segment {
                Segment::Key(key) => {
                    if !prefix.is_empty() {
                        prefix.push('.');
                    }
                    prefix.push_str(key);
                    if i == 0 {
                        continue;
                    }
                    current = current
                        .as_object()
                        .and_then(|obj| obj.get(key))
                        .ok_or_else(|| format!("path {:?}: {:?} not found", path.text, prefix))?;
                }
                Segment::Index(index) => {
                    let list = current
                        .as_array()
                        .ok_or_else(|| format!("path {:?}: {:?} is not a list", path.text, prefix))?;
                    if list.is_empty() {
                        return Err(format!("path {:?}: {:?} is empty", path.text, prefix));
                    }
                    let len = list.len();
                    let pos = match index {
                        Index::At(n) => n.rem_euclid(len as i64) as usize,
                        Index::Next => self.storage.next_index(&prefix, len),
                        Index::Rand => self.storage.rand_index(len),
                        Index::Last => len - 1,
                    };
                    prefix.push_str("[]");
                    current = &list[pos];
                }
            }
        }
        Ok(current.clone())
    }
}

/// Text form of a value as substituted into requests
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Store `values` under `request.<step>.<slot>` and merge them into
/// `request.<step>` itself
pub fn store_step_output(request: &mut Value, step: &str, slot: &str, values: Map<String, Value>, merge: bool) {
    if !request.is_object() {
        *request = Value::Object(Map::new());
    }
    let Value::Object(root) = request else {
        return;
    };
    let entry = root.entry(step.to_string()).or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    let Value::Object(step_map) = entry else {
        return;
    };
    if merge {
        for (k, v) in &values {
            step_map.insert(k.clone(), v.clone());
        }
    }
    step_map.insert(slot.to_string(), Value::Object(values));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn storage() -> VariableStorage {
        VariableStorage::with_seed(
            json!({
                "users": [{"id": 1}, {"id": 2}, {"id": 3}],
                "empty": [],
                "cfg": {"host": "a.com"}
            }),
            7,
        )
    }

    #[test]
    fn test_parse_paths() {
        assert!(VarPath::parse(".source.users[next].id").is_ok());
        assert!(VarPath::parse("request.a[0][1]").is_ok());
        for bad in ["", ".", "a..b", "a[", "a]", "[0]", "a.b.", "a[x]", "a b"] {
            assert!(VarPath::parse(bad).is_err(), "{:?} should not parse", bad);
        }
    }

    #[test]
    fn test_numeric_indices_wrap() {
        let storage = storage();
        let request = json!({});
        let vars = Vars::new(&storage, &request);
        let get = |p: &str| vars.resolve(&VarPath::parse(p).unwrap()).unwrap();
        assert_eq!(get("source.users[0].id"), json!(1));
        assert_eq!(get("source.users[4].id"), json!(2));
        assert_eq!(get("source.users[-1].id"), json!(3));
        assert_eq!(get("source.users[last].id"), json!(3));
        assert_eq!(get("source.cfg.host"), json!("a.com"));
    }

    #[test]
    fn test_next_is_shared_per_path() {
        let storage = storage();
        let request = json!({});
        let vars = Vars::new(&storage, &request);
        let next = VarPath::parse("source.users[next].id").unwrap();
        let ids: Vec<Value> = (0..4).map(|_| vars.resolve(&next).unwrap()).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3), json!(1)]);

        // Same list through a different leaf keeps the same counter
        let other = VarPath::parse("source.users[next]").unwrap();
        assert_eq!(vars.resolve(&other).unwrap(), json!({"id": 2}));
    }

    #[test]
    fn test_rand_stays_in_range() {
        let storage = storage();
        let request = json!({});
        let vars = Vars::new(&storage, &request);
        let path = VarPath::parse("source.users[rand].id").unwrap();
        for _ in 0..50 {
            let id = vars.resolve(&path).unwrap().as_i64().unwrap();
            assert!((1..=3).contains(&id));
        }
    }

    #[test]
    fn test_resolution_errors() {
        let storage = storage();
        let request = json!({"auth": {"token": "t"}});
        let vars = Vars::new(&storage, &request);
        let err = |p: &str| vars.resolve(&VarPath::parse(p).unwrap()).unwrap_err();
        assert!(err("source.empty[next]").contains("is empty"));
        assert!(err("source.cfg[0]").contains("not a list"));
        assert!(err("request.auth.missing").contains("not found"));
        assert!(err("env.HOME").contains("unknown root"));
        assert_eq!(vars.resolve(&VarPath::parse("request.auth.token").unwrap()).unwrap(), json!("t"));
    }

    #[test]
    fn test_store_step_output_merges() {
        let mut request = json!({});
        let mut values = Map::new();
        values.insert("token".to_string(), json!("abc"));
        store_step_output(&mut request, "auth", "postprocessor", values, true);
        assert_eq!(request["auth"]["postprocessor"]["token"], json!("abc"));
        assert_eq!(request["auth"]["token"], json!("abc"));
    }

    #[test]
    fn test_rand_helpers() {
        let storage = storage();
        for _ in 0..20 {
            let n = storage.rand_int(5, 8);
            assert!((5..8).contains(&n));
        }
        assert_eq!(storage.rand_int(3, 3), 3);
        let s = storage.rand_string(12, "ab");
        assert_eq!(s.len(), 12);
        assert!(s.chars().all(|c| c == 'a' || c == 'b'));
    }
}
