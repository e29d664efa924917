//! Step postprocessors
//!
//! Applied to the response of a step, `assert/response` first and then the
//! extractors in config order:
//!
//! - `var/header`: response headers, optionally piped through
//!   `lower`, `upper`, `substr(a[,b])`, `replace(x,y)`
//! - `var/jsonpath`: JSONPath over the JSON body
//! - `var/xpath`: XPath location path over the HTML body
//! - `assert/response`: header and body substrings, status code, body size
//!
//! Extractors yield a single value for one match and a list for several.

use crate::gun::http::HttpResponse;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_json_path::JsonPath;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PostprocessorConfig {
    #[serde(rename = "var/header")]
    Header { mapping: BTreeMap<String, String> },
    #[serde(rename = "var/jsonpath")]
    JsonPath { mapping: BTreeMap<String, String> },
    #[serde(rename = "var/xpath")]
    XPath { mapping: BTreeMap<String, String> },
    #[serde(rename = "assert/response")]
    AssertResponse {
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Vec<String>,
        #[serde(default)]
        status_code: Option<u16>,
        #[serde(default)]
        size: Option<SizeAssert>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SizeAssert {
    pub val: usize,
    #[serde(default)]
    pub op: SizeOp,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SizeOp {
    #[default]
    Eq,
    Lt,
    Gt,
}

/// Why a postprocessor rejected a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostprocessError {
    /// `assert/response` mismatch
    Assertion(String),
    /// Extraction failed (missing header, bad body, no match)
    Extraction(String),
}

impl fmt::Display for PostprocessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostprocessError::Assertion(msg) | PostprocessError::Extraction(msg) => f.write_str(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Modifier {
    Lower,
    Upper,
    Substr(usize, Option<usize>),
    Replace(String, String),
}

impl Modifier {
    fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        let (name, args) = match text.find('(') {
            Some(open) => {
                let inner = text[open + 1..]
                    .strip_suffix(')')
                    .ok_or_else(|| format!("unclosed modifier {:?}", text))?;
                (&text[..open], inner.split(',').map(str::trim).collect::<Vec<_>>())
            }
            None => (text, Vec::new()),
        };
        let index = |s: &str| s.parse::<usize>().map_err(|_| format!("{}: bad index {:?}", name, s));
        match (name, args.as_slice()) {
            ("lower", []) => Ok(Modifier::Lower),
            ("upper", []) => Ok(Modifier::Upper),
            ("substr", [a]) => Ok(Modifier::Substr(index(a)?, None)),
            ("substr", [a, b]) => Ok(Modifier::Substr(index(a)?, Some(index(b)?))),
            ("replace", [from, to]) => Ok(Modifier::Replace(from.to_string(), to.to_string())),
            _ => Err(format!("unknown modifier {:?}", text)),
        }
    }

    fn apply(&self, value: String) -> String {
        match self {
            Modifier::Lower => value.to_lowercase(),
            Modifier::Upper => value.to_uppercase(),
            Modifier::Substr(from, to) => {
                let chars: Vec<char> = value.chars().collect();
                let end = to.unwrap_or(chars.len()).min(chars.len());
                let start = (*from).min(end);
                chars[start..end].iter().collect()
            }
            Modifier::Replace(from, to) => value.replace(from.as_str(), to),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Extract {
    Text,
    Attr(String),
}

#[derive(Debug)]
struct XPathQuery {
    selector: Selector,
    extract: Extract,
}

/// Compiled postprocessor
#[derive(Debug)]
pub struct Postprocessor {
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    Header(Vec<(String, String, Vec<Modifier>)>),
    JsonPath(Vec<(String, JsonPath)>),
    XPath(Vec<(String, XPathQuery)>),
    Assert {
        headers: BTreeMap<String, String>,
        body: Vec<String>,
        status_code: Option<u16>,
        size: Option<SizeAssert>,
    },
}

impl Postprocessor {
    pub fn compile(cfg: &PostprocessorConfig) -> Result<Self, String> {
        let kind = match cfg {
            PostprocessorConfig::Header { mapping } => {
                let mut out = Vec::new();
                for (var, spec) in mapping {
                    let mut pieces = spec.split('|');
                    let header = pieces.next().unwrap_or_default().trim().to_string();
                    if header.is_empty() {
                        return Err(format!("var/header {:?}: empty header name", var));
                    }
                    let modifiers = pieces
                        .map(Modifier::parse)
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| format!("var/header {:?}: {}", var, e))?;
                    out.push((var.clone(), header, modifiers));
                }
                Kind::Header(out)
            }
            PostprocessorConfig::JsonPath { mapping } => {
                let mut out = Vec::new();
                for (var, expr) in mapping {
                    let path = JsonPath::parse(expr).map_err(|e| format!("var/jsonpath {:?}: {}", var, e))?;
                    out.push((var.clone(), path));
                }
                Kind::JsonPath(out)
            }
            PostprocessorConfig::XPath { mapping } => {
                let mut out = Vec::new();
                for (var, expr) in mapping {
                    let query = compile_xpath(expr).map_err(|e| format!("var/xpath {:?}: {}", var, e))?;
                    out.push((var.clone(), query));
                }
                Kind::XPath(out)
            }
            PostprocessorConfig::AssertResponse {
                headers,
                body,
                status_code,
                size,
            } => Kind::Assert {
                headers: headers.clone(),
                body: body.clone(),
                status_code: *status_code,
                size: *size,
            },
        };
        Ok(Self { kind })
    }

    /// `assert/response`, checked before any extractor runs
    pub fn is_assertion(&self) -> bool {
        matches!(self.kind, Kind::Assert { .. })
    }

    /// Run against a response; assertions return an empty map on success
    pub fn process(&self, response: &HttpResponse) -> Result<Map<String, Value>, PostprocessError> {
        let mut out = Map::new();
        match &self.kind {
            Kind::Header(mapping) => {
                for (var, header, modifiers) in mapping {
                    let value = response
                        .headers
                        .get(header.as_str())
                        .ok_or_else(|| PostprocessError::Extraction(format!("header {:?} not in response", header)))?;
                    let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
                    let value = modifiers.iter().fold(value, |v, m| m.apply(v));
                    out.insert(var.clone(), Value::String(value));
                }
            }
            Kind::JsonPath(mapping) => {
                let body: Value = serde_json::from_slice(&response.body)
                    .map_err(|e| PostprocessError::Extraction(format!("response body is not JSON: {}", e)))?;
                for (var, path) in mapping {
                    let found = path.query(&body).all();
                    let value = match found.as_slice() {
                        [] => {
                            return Err(PostprocessError::Extraction(format!(
                                "jsonpath for {:?} matched nothing",
                                var
                            )))
                        }
                        [one] => (*one).clone(),
                        many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
                    };
                    out.insert(var.clone(), value);
                }
            }
            Kind::XPath(mapping) => {
                let html = String::from_utf8_lossy(&response.body);
                let document = Html::parse_document(&html);
                for (var, query) in mapping {
                    let mut found: Vec<String> = Vec::new();
                    for element in document.select(&query.selector) {
                        match query.extract {
                            Extract::Text => {
                                let text: String = element.text().collect();
                                found.push(text.trim().to_string());
                            }
                            Extract::Attr(ref name) => {
                                if let Some(v) = element.value().attr(name) {
                                    found.push(v.to_string());
                                }
                            }
                        }
                    }
                    let value = match found.len() {
                        0 => {
                            return Err(PostprocessError::Extraction(format!("xpath for {:?} matched nothing", var)))
                        }
                        1 => Value::String(found.remove(0)),
                        _ => Value::Array(found.into_iter().map(Value::String).collect()),
                    };
                    out.insert(var.clone(), value);
                }
            }
            Kind::Assert {
                headers,
                body,
                status_code,
                size,
            } => {
                if let Some(expected) = status_code {
                    if response.status != *expected {
                        return Err(PostprocessError::Assertion(format!(
                            "status code {} != expected {}",
                            response.status, expected
                        )));
                    }
                }
                for (name, needle) in headers {
                    let value = response
                        .headers
                        .get(name.as_str())
                        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                        .ok_or_else(|| PostprocessError::Assertion(format!("header {:?} is missing", name)))?;
                    if !value.contains(needle.as_str()) {
                        return Err(PostprocessError::Assertion(format!(
                            "header {:?} = {:?} does not contain {:?}",
                            name, value, needle
                        )));
                    }
                }
                if !body.is_empty() {
                    let text = String::from_utf8_lossy(&response.body);
                    for needle in body {
                        if !text.contains(needle.as_str()) {
                            return Err(PostprocessError::Assertion(format!("body does not contain {:?}", needle)));
                        }
                    }
                }
                if let Some(SizeAssert { val, op }) = size {
                    let len = response.body.len();
                    let ok = match op {
                        SizeOp::Eq => len == *val,
                        SizeOp::Lt => len < *val,
                        SizeOp::Gt => len > *val,
                    };
                    if !ok {
                        return Err(PostprocessError::Assertion(format!(
                            "body size {} is not {:?} {}",
                            len, op, val
                        )));
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Translate an XPath location path into a CSS selector plus what to extract
///
/// Supported: `/` and `//` axes, `*`, predicates `[@a='v']`, `[@a]`,
/// `[contains(@a,'v')]`, `[n]`, and a final `@attr` or `text()` step.
fn compile_xpath(expr: &str) -> Result<XPathQuery, String> {
    let expr = expr.trim();
    if !expr.starts_with('/') {
        return Err(format!("xpath {:?} must start with '/'", expr));
    }

    let mut css = String::new();
    let mut extract = Extract::Text;
    let mut rest = expr;
    let mut first = true;

    while !rest.is_empty() {
        let combinator = if let Some(r) = rest.strip_prefix("//") {
            rest = r;
            " "
        } else if let Some(r) = rest.strip_prefix('/') {
            rest = r;
            " > "
        } else {
            return Err(format!("unexpected {:?} in xpath", rest));
        };

        let end = step_end(rest);
        let step = &rest[..end];
        rest = &rest[end..];
        if step.is_empty() {
            return Err(format!("empty step in xpath {:?}", expr));
        }

        if let Some(attr) = step.strip_prefix('@') {
            if !rest.is_empty() {
                return Err("attribute step must be last".to_string());
            }
            extract = Extract::Attr(attr.to_string());
            break;
        }
        if step == "text()" {
            if !rest.is_empty() {
                return Err("text() step must be last".to_string());
            }
            break;
        }

        if !first {
            css.push_str(combinator);
        }
        first = false;
        css.push_str(&translate_step(step)?);
    }

    if css.is_empty() {
        return Err(format!("xpath {:?} selects no element", expr));
    }
    let selector = Selector::parse(&css).map_err(|e| format!("invalid selector {:?}: {:?}", css, e))?;
    Ok(XPathQuery { selector, extract })
}

/// Length of the next step, skipping slashes inside predicates
fn step_end(s: &str) -> usize {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match (c, quote) {
            ('\'' | '"', None) => quote = Some(c),
            (c, Some(q)) if c == q => quote = None,
            (_, Some(_)) => {}
            ('[', None) => depth += 1,
            (']', None) => depth = depth.saturating_sub(1),
            ('/', None) if depth == 0 => return i,
            _ => {}
        }
    }
    s.len()
}

fn translate_step(step: &str) -> Result<String, String> {
    let (tag, mut preds) = match step.find('[') {
        Some(i) => (&step[..i], &step[i..]),
        None => (step, ""),
    };
    let mut css = if tag == "*" || tag.is_empty() {
        "*".to_string()
    } else {
        tag.to_string()
    };

    while !preds.is_empty() {
        let inner_end = preds
            .find(']')
            .ok_or_else(|| format!("unclosed predicate in {:?}", step))?;
        let pred = preds[1..inner_end].trim();
        preds = &preds[inner_end + 1..];

        if let Ok(n) = pred.parse::<usize>() {
            css.push_str(&format!(":nth-of-type({})", n));
        } else if let Some(inner) = pred.strip_prefix("contains(").and_then(|p| p.strip_suffix(')')) {
            let (attr, value) = inner
                .split_once(',')
                .ok_or_else(|| format!("bad contains() in {:?}", step))?;
            let attr = attr.trim().strip_prefix('@').ok_or("contains() needs an @attribute")?;
            css.push_str(&format!("[{}*=\"{}\"]", attr, strip_quotes(value)));
        } else if let Some(attr) = pred.strip_prefix('@') {
            match attr.split_once('=') {
                Some((name, value)) => css.push_str(&format!("[{}=\"{}\"]", name.trim(), strip_quotes(value))),
                None => css.push_str(&format!("[{}]", attr.trim())),
            }
        } else {
            return Err(format!("unsupported predicate [{}]", pred));
        }
    }
    Ok(css)
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    for q in ['\'', '"'] {
        if let Some(inner) = s.strip_prefix(q).and_then(|s| s.strip_suffix(q)) {
            return inner;
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use reqwest::header::{HeaderMap, HeaderValue};
    use serde_json::json;

    fn response(status: u16, headers: &[(&'static str, &'static str)], body: &str) -> HttpResponse {
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            map.insert(*k, HeaderValue::from_static(v));
        }
        HttpResponse {
            status,
            headers: map,
            body: Bytes::from(body.to_string()),
        }
    }

    fn compile(yaml: &str) -> Postprocessor {
        let cfg: PostprocessorConfig = serde_yaml::from_str(yaml).unwrap();
        Postprocessor::compile(&cfg).unwrap()
    }

    #[test]
    fn test_header_modifiers() {
        let pp = compile(
            "type: var/header\nmapping:\n  ct: Content-Type|lower|substr(0,16)\n  srv: server|replace(nginx,proxy)|upper\n",
        );
        let resp = response(200, &[("content-type", "Application/JSON; charset=utf-8"), ("server", "nginx/1.2")], "");
        let out = pp.process(&resp).unwrap();
        assert_eq!(out["ct"], json!("application/json"));
        assert_eq!(out["srv"], json!("PROXY/1.2"));
    }

    #[test]
    fn test_missing_header_is_an_extraction_error() {
        let pp = compile("type: var/header\nmapping:\n  x: X-Missing\n");
        let err = pp.process(&response(200, &[], "")).unwrap_err();
        assert!(matches!(err, PostprocessError::Extraction(_)));
    }

    #[test]
    fn test_jsonpath_single_and_many() {
        let pp = compile("type: var/jsonpath\nmapping:\n  token: $.auth_key\n  ids: $.items[*].id\n");
        let resp = response(200, &[], r#"{"auth_key": "k1", "items": [{"id": 1}, {"id": 2}]}"#);
        let first = pp.process(&resp).unwrap();
        assert_eq!(first["token"], json!("k1"));
        assert_eq!(first["ids"], json!([1, 2]));
        // Same body, same map
        assert_eq!(pp.process(&resp).unwrap(), first);
    }

    #[test]
    fn test_jsonpath_errors() {
        let pp = compile("type: var/jsonpath\nmapping:\n  t: $.nope\n");
        assert!(pp.process(&response(200, &[], "{}")).is_err());
        assert!(pp.process(&response(200, &[], "<html>")).is_err());
        let bad: PostprocessorConfig = serde_yaml::from_str("type: var/jsonpath\nmapping:\n  t: '$[['\n").unwrap();
        assert!(Postprocessor::compile(&bad).is_err());
    }

    #[test]
    fn test_xpath_translation() {
        let css = |x: &str| translate_steps(x);
        assert_eq!(css("//div[@class='item']/a"), "div[class=\"item\"] > a");
        assert_eq!(css("/html/body//li[2]"), "html > body li:nth-of-type(2)");
        assert_eq!(css("//a[contains(@href,'/x/')][@id]"), "a[href*=\"/x/\"][id]");
    }

    fn translate_steps(xpath: &str) -> String {
        // Rebuild the CSS the same way compile_xpath does, for inspection
        let mut out = String::new();
        let mut rest = xpath;
        let mut first = true;
        while !rest.is_empty() {
            let comb = if let Some(r) = rest.strip_prefix("//") {
                rest = r;
                " "
            } else {
                rest = &rest[1..];
                " > "
            };
            let end = step_end(rest);
            if !first {
                out.push_str(comb);
            }
            first = false;
            out.push_str(&translate_step(&rest[..end]).unwrap());
            rest = &rest[end..];
        }
        out
    }

    #[test]
    fn test_xpath_extraction() {
        let html = r#"<html><body>
            <ul><li><a href="/a" class="x">First</a></li><li><a href="/b">Second</a></li></ul>
            <form><input name="csrf" value="tok"/></form>
        </body></html>"#;
        let pp = compile(
            "type: var/xpath\nmapping:\n  links: //li/a/@href\n  first: //a[@class='x']/text()\n  csrf: //input[@name='csrf']/@value\n",
        );
        let out = pp.process(&response(200, &[], html)).unwrap();
        assert_eq!(out["links"], json!(["/a", "/b"]));
        assert_eq!(out["first"], json!("First"));
        assert_eq!(out["csrf"], json!("tok"));

        let none = compile("type: var/xpath\nmapping:\n  x: //table\n");
        assert!(none.process(&response(200, &[], html)).is_err());
    }

    #[test]
    fn test_xpath_compile_errors() {
        for bad in ["div", "//a/@href/b", "//a[last()]", "//"] {
            assert!(compile_xpath(bad).is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_only_assert_response_is_an_assertion() {
        assert!(compile("type: assert/response\nstatus_code: 200\n").is_assertion());
        assert!(!compile("type: var/jsonpath\nmapping:\n  t: $.t\n").is_assertion());
        assert!(!compile("type: var/header\nmapping:\n  t: Server\n").is_assertion());
    }

    #[test]
    fn test_assert_response() {
        let pp = compile(
            "type: assert/response\nstatus_code: 200\nheaders:\n  Content-Type: json\nbody: [token]\nsize: {val: 5, op: gt}\n",
        );
        let ok = response(200, &[("content-type", "application/json")], r#"{"token": 1}"#);
        assert!(pp.process(&ok).unwrap().is_empty());

        let unauthorized = response(401, &[("content-type", "application/json")], r#"{"token": 1}"#);
        let err = pp.process(&unauthorized).unwrap_err();
        assert_eq!(err, PostprocessError::Assertion("status code 401 != expected 200".to_string()));

        let small = response(200, &[("content-type", "application/json")], "token");
        assert!(matches!(pp.process(&small), Err(PostprocessError::Assertion(_))));

        let wrong_type = response(200, &[("content-type", "text/html")], r#"{"token": 1}"#);
        assert!(pp.process(&wrong_type).is_err());
    }
}
