use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};

/// Key holding pre-rendered manifest text in the stored envelope.
pub const RAW_KEY: &str = "_raw";

/// Key holding the format of the pre-rendered text in the stored envelope.
pub const FORMAT_KEY: &str = "_format";

/// Output formats a pattern can declare or a caller can request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ManifestFormat {
    Json,
    Yaml,
    Xml,
    Csv,
    Text,
}

impl ManifestFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ManifestFormat::Json => "application/json",
            ManifestFormat::Yaml => "application/x-yaml",
            ManifestFormat::Xml => "application/xml",
            ManifestFormat::Csv => "text/csv",
            ManifestFormat::Text => "text/plain",
        }
    }
}

/// Already-rendered manifest text, optionally stored next to structured keys.
#[derive(Debug, Clone, PartialEq)]
pub struct RawManifest {
    pub text: String,
    pub format: String,
    /// Structured keys persisted alongside the envelope; empty when none.
    pub data: Map<String, Value>,
}

/// Extraction result of a succeeded job.
///
/// The store persists both variants as a single JSON document; the raw
/// variant uses the `_raw`/`_format` envelope keys. Decoding happens once
/// on load so the converter can dispatch on the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum Manifest {
    Structured(Value),
    Raw(RawManifest),
}

impl Manifest {
    pub fn raw(text: impl Into<String>, format: ManifestFormat) -> Self {
        Manifest::Raw(RawManifest {
            text: text.into(),
            format: format.to_string(),
            data: Map::new(),
        })
    }

    /// Decode a stored JSON document.
    pub fn from_stored(value: Value) -> Self {
        let Value::Object(mut map) = value else {
            return Manifest::Structured(value);
        };

        let has_envelope = matches!(map.get(RAW_KEY), Some(Value::String(_)))
            && matches!(map.get(FORMAT_KEY), Some(Value::String(_)));
        if !has_envelope {
            return Manifest::Structured(Value::Object(map));
        }

        let text = take_string(&mut map, RAW_KEY);
        let format = take_string(&mut map, FORMAT_KEY);
        Manifest::Raw(RawManifest {
            text,
            format,
            data: map,
        })
    }

    /// Encode into the stored JSON document.
    pub fn to_stored(&self) -> Value {
        match self {
            Manifest::Structured(value) => value.clone(),
            Manifest::Raw(raw) => {
                let mut map = Map::new();
                map.insert(RAW_KEY.to_string(), Value::String(raw.text.clone()));
                map.insert(FORMAT_KEY.to_string(), Value::String(raw.format.clone()));
                for (key, value) in &raw.data {
                    map.insert(key.clone(), value.clone());
                }
                Value::Object(map)
            }
        }
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> String {
    match map.remove(key) {
        Some(Value::String(s)) => s,
        _ => String::new(),
    }
}

impl From<Value> for Manifest {
    fn from(value: Value) -> Self {
        Manifest::from_stored(value)
    }
}

impl From<Manifest> for Value {
    fn from(manifest: Manifest) -> Self {
        manifest.to_stored()
    }
}
