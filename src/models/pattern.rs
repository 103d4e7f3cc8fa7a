use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::manifest::ManifestFormat;

/// Field separator for CSV manifests.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CsvDelimiter {
    #[default]
    Comma,
    Semicolon,
}

impl CsvDelimiter {
    pub fn as_byte(self) -> u8 {
        match self {
            CsvDelimiter::Comma => b',',
            CsvDelimiter::Semicolon => b';',
        }
    }

    pub fn as_char(self) -> char {
        self.as_byte() as char
    }
}

/// Extraction configuration applied to an image. Read-only to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub version: i32,
    pub format: ManifestFormat,
    pub instructions: String,
    /// Canonical schema used to constrain the model for every format.
    pub json_schema: serde_json::Value,
    /// User-declared YAML template; records field order for YAML patterns.
    pub yaml_schema: Option<String>,
    pub xml_schema: Option<String>,
    /// Declared CSV header row, e.g. `name;age`.
    pub csv_schema: Option<String>,
    pub plain_text_schema: Option<String>,
    pub csv_delimiter: CsvDelimiter,
    pub model_profile: String,
}

impl Pattern {
    /// The per-format schema string the user declared for `format`, if any.
    pub fn format_schema(&self, format: ManifestFormat) -> Option<&str> {
        match format {
            ManifestFormat::Json => None,
            ManifestFormat::Yaml => self.yaml_schema.as_deref(),
            ManifestFormat::Xml => self.xml_schema.as_deref(),
            ManifestFormat::Csv => self.csv_schema.as_deref(),
            ManifestFormat::Text => self.plain_text_schema.as_deref(),
        }
    }
}
