//! Variable sources
//!
//! Loaded once before the run into the `source` root:
//!
//! - `file/csv`: list of row objects keyed by `fields` (or the header line)
//! - `file/json`: any JSON document
//! - `variables`: literal table from the scenario file itself

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum SourceConfig {
    #[serde(rename = "file/csv")]
    Csv {
        name: String,
        file: PathBuf,
        /// Column names; the first line is used when empty
        #[serde(default)]
        fields: Vec<String>,
        #[serde(default)]
        ignore_first_line: bool,
        #[serde(default = "default_delimiter")]
        delimiter: String,
    },
    #[serde(rename = "file/json")]
    Json { name: String, file: PathBuf },
    #[serde(rename = "variables")]
    Variables { name: String, variables: Value },
}

fn default_delimiter() -> String {
    ",".to_string()
}

impl SourceConfig {
    pub fn name(&self) -> &str {
        match self {
            SourceConfig::Csv { name, .. } | SourceConfig::Json { name, .. } | SourceConfig::Variables { name, .. } => name,
        }
    }

    /// Load the source; relative paths are resolved against `base_dir`
    pub fn load(&self, base_dir: &Path) -> Result<Value> {
        match self {
            SourceConfig::Csv {
                file,
                fields,
                ignore_first_line,
                delimiter,
                ..
            } => {
                let path = base_dir.join(file);
                let data = std::fs::read(&path)
                    .with_context(|| format!("Failed to read CSV source: {}", path.display()))?;
                parse_csv(&data, fields, *ignore_first_line, delimiter)
                    .with_context(|| format!("Failed to parse CSV source: {}", path.display()))
            }
            SourceConfig::Json { file, .. } => {
                let path = base_dir.join(file);
                let data = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read JSON source: {}", path.display()))?;
                serde_json::from_str(&data)
                    .with_context(|| format!("Failed to parse JSON source: {}", path.display()))
            }
            SourceConfig::Variables { variables, .. } => Ok(variables.clone()),
        }
    }
}

fn parse_csv(data: &[u8], fields: &[String], ignore_first_line: bool, delimiter: &str) -> Result<Value> {
    let delimiter = match delimiter.as_bytes() {
        [b] => *b,
        _ => bail!("delimiter must be a single byte, got {:?}", delimiter),
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(data);

    let mut records = reader.records();
    let header: Vec<String> = if fields.is_empty() {
        match records.next() {
            Some(first) => first?.iter().map(|s| s.trim().to_string()).collect(),
            None => return Ok(Value::Array(Vec::new())),
        }
    } else {
        if ignore_first_line {
            records.next().transpose()?;
        }
        fields.to_vec()
    };

    let mut rows = Vec::new();
    for record in records {
        let record = record?;
        let mut row = Map::new();
        for (name, value) in header.iter().zip(record.iter()) {
            row.insert(name.clone(), Value::String(value.to_string()));
        }
        rows.push(Value::Object(row));
    }
    Ok(Value::Array(rows))
}

/// Load every source into one `{name: value}` object
pub fn load_all(sources: &[SourceConfig], base_dir: &Path) -> Result<Value> {
    let mut out = Map::new();
    for source in sources {
        if out.contains_key(source.name()) {
            bail!("variable source {:?} is defined twice", source.name());
        }
        let value = source
            .load(base_dir)
            .with_context(|| format!("variable source {:?}", source.name()))?;
        out.insert(source.name().to_string(), value);
    }
    Ok(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_csv_with_fields_and_skip() {
        let rows = parse_csv(b"id,name\n1,alice\n2,bob\n", &["user_id".into(), "name".into()], true, ",").unwrap();
        assert_eq!(rows, json!([{"user_id": "1", "name": "alice"}, {"user_id": "2", "name": "bob"}]));
    }

    #[test]
    fn test_csv_header_from_first_line() {
        let rows = parse_csv(b"id;name\n1;alice\n", &[], false, ";").unwrap();
        assert_eq!(rows, json!([{"id": "1", "name": "alice"}]));
        assert!(parse_csv(b"a\n", &[], false, "::").is_err());
    }

    #[test]
    fn test_load_all_from_files_and_literals() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("users.csv"), "id\n1\n2\n").unwrap();
        std::fs::write(dir.path().join("filter.json"), r#"{"list": ["a", "b"]}"#).unwrap();
        let yaml = r#"
- type: file/csv
  name: users
  file: users.csv
- type: file/json
  name: filter
  file: filter.json
- type: variables
  name: vars
  variables:
    header: yandex
    n: 3
"#;
        let sources: Vec<SourceConfig> = serde_yaml::from_str(yaml).unwrap();
        let value = load_all(&sources, dir.path()).unwrap();
        assert_eq!(value["users"], json!([{"id": "1"}, {"id": "2"}]));
        assert_eq!(value["filter"]["list"][1], json!("b"));
        assert_eq!(value["vars"]["header"], json!("yandex"));
        assert_eq!(value["vars"]["n"], json!(3));
    }

    #[test]
    fn test_missing_file_names_the_source() {
        let sources = vec![SourceConfig::Json {
            name: "gone".to_string(),
            file: PathBuf::from("missing.json"),
        }];
        let err = load_all(&sources, Path::new("/nonexistent")).unwrap_err();
        assert!(format!("{:#}", err).contains("variable source \"gone\""));
    }
}
