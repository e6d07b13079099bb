//! YAML documents read by the controller
//!
//! The controller ConfigMap and pod spec patches both arrive as YAML or JSON
//! text. They are read into serde_json::Value so typed configuration and
//! strategic merges work on one representation.

use serde_json::{Map, Number, Value};
use thiserror::Error;
use yaml_rust2::{Yaml, YamlLoader};

/// A YAML document that could not be read, naming where it came from
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum YamlError {
    /// The text does not parse, or holds a scalar that does not convert
    #[error("{origin} is not valid YAML: {message}")]
    Syntax {
        /// What the document is, e.g. `template podSpecPatch`
        origin: String,
        /// Parser message
        message: String,
    },
    /// The document uses a YAML feature that has no JSON counterpart
    #[error("{origin} uses {feature}, which is not supported")]
    Unsupported {
        /// What the document is, e.g. `controller config`
        origin: String,
        /// The offending feature
        feature: &'static str,
    },
}

impl YamlError {
    fn syntax(origin: &str, message: impl ToString) -> Self {
        Self::Syntax {
            origin: origin.to_string(),
            message: message.to_string(),
        }
    }

    fn unsupported(origin: &str, feature: &'static str) -> Self {
        Self::Unsupported {
            origin: origin.to_string(),
            feature,
        }
    }

    /// What the failing document was
    pub fn origin(&self) -> &str {
        match self {
            Self::Syntax { origin, .. } | Self::Unsupported { origin, .. } => origin,
        }
    }
}

/// Read the first document of `input` as JSON
///
/// `origin` names the document in errors. Empty input reads as `Value::Null`.
pub fn parse_yaml(input: &str, origin: &str) -> Result<Value, YamlError> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| YamlError::syntax(origin, e))?;
    match docs.into_iter().next() {
        Some(doc) => to_json(doc, origin),
        None => Ok(Value::Null),
    }
}

fn to_json(yaml: Yaml, origin: &str) -> Result<Value, YamlError> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s.parse().map_err(|e| YamlError::syntax(origin, e))?;
            // NaN and infinities have no JSON form
            Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(items) => items
            .into_iter()
            .map(|item| to_json(item, origin))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| {
                let key = match k {
                    Yaml::String(s) | Yaml::Real(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    _ => return Err(YamlError::unsupported(origin, "a non-scalar mapping key")),
                };
                to_json(v, origin).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(YamlError::unsupported(origin, "an alias")),
        Yaml::BadValue => Err(YamlError::syntax(origin, "bad value")),
    }
}
