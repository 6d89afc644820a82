//! Manifest YAML handling using yaml-rust2
//!
//! Addon manifests arrive as multi-document YAML (a release bundle or the
//! output of `helm template`). They are parsed into `serde_json::Value`
//! documents so they can be inspected and sent to the API server with
//! server-side apply.

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

use crate::Error;

/// Parse a multi-document YAML string into one `Value` per document.
///
/// Empty documents (a stray `---`, comment-only blocks) are dropped.
pub fn parse_documents(input: &str) -> Result<Vec<Value>, Error> {
    let docs = YamlLoader::load_from_str(input)
        .map_err(|e| Error::configuration(format!("invalid YAML: {e}")))?;
    let mut values = Vec::with_capacity(docs.len());
    for doc in docs {
        let value = yaml_to_json(doc)?;
        if !value.is_null() {
            values.push(value);
        }
    }
    Ok(values)
}

/// Parse the first document of a YAML string. Empty input yields `Null`.
pub fn parse_document(input: &str) -> Result<Value, Error> {
    Ok(parse_documents(input)?.into_iter().next().unwrap_or(Value::Null))
}

/// Split a multi-document manifest into individual documents, dropping
/// empty documents and Helm test/hook resources that must not be applied.
pub fn split_yaml_documents(yaml: &str) -> Vec<String> {
    yaml.split("\n---")
        .map(|doc| doc.trim().trim_start_matches("---").trim())
        .filter(|doc| {
            let keep = !doc.is_empty() && doc.contains("kind:") && !doc.contains("helm.sh/hook");
            if !keep && !doc.is_empty() {
                tracing::debug!(
                    doc_preview = &doc[..doc.len().min(100)],
                    "Filtered out YAML document"
                );
            }
            keep
        })
        .map(|doc| format!("---\n{doc}"))
        .collect()
}

fn yaml_to_json(yaml: Yaml) -> Result<Value, Error> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e| Error::configuration(format!("invalid YAML float {s:?}: {e}")))?;
            Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(arr) => arr
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| {
                let key = match k {
                    Yaml::String(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Real(r) => r,
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    _ => return Err(Error::configuration("unsupported YAML key type")),
                };
                yaml_to_json(v).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(Error::configuration("YAML aliases not supported")),
        Yaml::BadValue => Err(Error::configuration("bad YAML value")),
    }
}
