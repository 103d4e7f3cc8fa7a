//! Manifest rendering.
//!
//! Succeeded jobs carry either a structured value or pre-rendered text (see
//! [`Manifest`]). On read the manifest is restored to schema key order and
//! rendered into the requested format, defaulting to the pattern's own.

use std::io::Cursor;
use std::str::FromStr;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde_json::{Map, Value};

use crate::models::manifest::{Manifest, ManifestFormat, RawManifest, FORMAT_KEY, RAW_KEY};
use crate::models::pattern::{CsvDelimiter, Pattern};
use crate::services::schema;

/// Root element of XML manifests.
const XML_ROOT: &str = "manifest";

/// Element wrapping each array entry in XML manifests.
const XML_ITEM: &str = "item";

/// A manifest ready to be returned to a caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub content_type: &'static str,
    pub body: RenderedBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderedBody {
    Json(Value),
    Text(String),
}

impl Rendered {
    fn json(value: Value) -> Self {
        Self {
            content_type: ManifestFormat::Json.content_type(),
            body: RenderedBody::Json(value),
        }
    }

    fn text(format: ManifestFormat, text: String) -> Self {
        Self {
            content_type: format.content_type(),
            body: RenderedBody::Text(text),
        }
    }
}

/// Render a stored manifest for a reader.
///
/// `requested` of `None` means the pattern's declared format.
pub fn render_manifest(
    manifest: &Manifest,
    pattern: &Pattern,
    requested: Option<ManifestFormat>,
) -> Result<Rendered, ConvertError> {
    let target = requested.unwrap_or(pattern.format);

    match (manifest, target) {
        (Manifest::Raw(raw), ManifestFormat::Json) if raw.data.is_empty() => {
            Ok(Rendered::json(raw_envelope(raw)))
        }
        (Manifest::Raw(raw), ManifestFormat::Json) => {
            let data = Value::Object(raw.data.clone());
            Ok(Rendered::json(restore_order(&data, pattern)))
        }
        (Manifest::Raw(raw), format) => {
            let raw_format = ManifestFormat::from_str(&raw.format).unwrap_or(format);
            Ok(Rendered::text(raw_format, raw.text.clone()))
        }
        (Manifest::Structured(value), ManifestFormat::Json) => {
            Ok(Rendered::json(restore_order(value, pattern)))
        }
        (Manifest::Structured(value), format) => {
            let ordered = restore_order(value, pattern);
            let text = convert(&ordered, format, pattern)?;
            Ok(Rendered::text(format, text))
        }
    }
}

fn raw_envelope(raw: &RawManifest) -> Value {
    let mut map = Map::new();
    map.insert(RAW_KEY.to_string(), Value::String(raw.text.clone()));
    map.insert(FORMAT_KEY.to_string(), Value::String(raw.format.clone()));
    Value::Object(map)
}

/// Put a structured manifest back into the order its pattern declares.
///
/// CSV patterns order each row by the declared header. Every other format
/// follows the JSON schema, then the YAML/XML/text template the pattern
/// declares for its own format, if any.
pub fn restore_order(value: &Value, pattern: &Pattern) -> Value {
    match pattern.format {
        ManifestFormat::Csv => schema::reorder_csv_rows(value, &schema::csv_header(pattern)),
        _ => {
            let ordered = schema::order_by_schema(value, &pattern.json_schema);
            match schema::declared_template(pattern) {
                Some(template) => schema::order_by_template(&ordered, &template),
                None => ordered,
            }
        }
    }
}

/// Serialize a structured value into `format`.
pub fn convert(value: &Value, format: ManifestFormat, pattern: &Pattern) -> Result<String, ConvertError> {
    match format {
        ManifestFormat::Json => Ok(serde_json::to_string_pretty(value)?),
        ManifestFormat::Yaml => to_yaml(value),
        ManifestFormat::Xml => to_xml(value),
        ManifestFormat::Csv => to_csv(value, &schema::csv_header(pattern), pattern.csv_delimiter),
        ManifestFormat::Text => Ok(to_text(value)),
    }
}

pub fn to_yaml(value: &Value) -> Result<String, ConvertError> {
    Ok(serde_yaml::to_string(value)?)
}

pub fn to_xml(value: &Value) -> Result<String, ConvertError> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;
    write_xml_element(&mut writer, XML_ROOT, value)?;

    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes).map_err(xml_err)
}

fn xml_err(e: impl std::fmt::Display) -> ConvertError {
    ConvertError::Xml(e.to_string())
}

fn write_xml_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    name: &str,
    value: &Value,
) -> Result<(), ConvertError> {
    let tag = xml_name(name);

    match value {
        Value::Null => {
            writer
                .write_event(Event::Empty(BytesStart::new(tag.as_str())))
                .map_err(xml_err)?;
        }
        Value::Object(map) => {
            writer
                .write_event(Event::Start(BytesStart::new(tag.as_str())))
                .map_err(xml_err)?;
            for (key, child) in map {
                write_xml_element(writer, key, child)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new(tag.as_str())))
                .map_err(xml_err)?;
        }
        Value::Array(items) => {
            writer
                .write_event(Event::Start(BytesStart::new(tag.as_str())))
                .map_err(xml_err)?;
            for item in items {
                write_xml_element(writer, XML_ITEM, item)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new(tag.as_str())))
                .map_err(xml_err)?;
        }
        scalar => {
            let text = scalar_text(scalar);
            writer
                .write_event(Event::Start(BytesStart::new(tag.as_str())))
                .map_err(xml_err)?;
            writer
                .write_event(Event::Text(BytesText::new(&text)))
                .map_err(xml_err)?;
            writer
                .write_event(Event::End(BytesEnd::new(tag.as_str())))
                .map_err(xml_err)?;
        }
    }
    Ok(())
}

/// Coerce an object key into a valid XML element name.
fn xml_name(key: &str) -> String {
    let mut name: String = key
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let bad_start = name
        .chars()
        .next()
        .map_or(true, |c| c.is_ascii_digit() || matches!(c, '-' | '.'));
    if bad_start || name.to_ascii_lowercase().starts_with("xml") {
        name.insert(0, '_');
    }
    name
}

pub fn to_csv(value: &Value, declared: &[String], delimiter: CsvDelimiter) -> Result<String, ConvertError> {
    let rows = schema::csv_rows(value).ok_or(ConvertError::UnsupportedShape(
        "csv manifests must be an object or a list of objects",
    ))?;

    let mut header: Vec<String> = declared.to_vec();
    for row in &rows {
        for key in row.keys() {
            if !header.contains(key) {
                header.push(key.clone());
            }
        }
    }

    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter.as_byte())
        .from_writer(Vec::new());
    writer.write_record(&header)?;
    for row in rows {
        let record: Vec<String> = header
            .iter()
            .map(|name| row.get(name).map(scalar_text).unwrap_or_default())
            .collect();
        writer.write_record(&record)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| ConvertError::Csv(e.into_error().into()))?;
    String::from_utf8(bytes).map_err(|_| ConvertError::UnsupportedShape("csv output is not utf-8"))
}

/// Plain-text rendering: `key: value` lines, nested blocks indented.
pub fn to_text(value: &Value) -> String {
    let mut out = String::new();
    match value {
        Value::Object(_) | Value::Array(_) => write_text(&mut out, value, 0),
        scalar => {
            out.push_str(&scalar_text(scalar));
            out.push('\n');
        }
    }
    out
}

fn write_text(out: &mut String, value: &Value, depth: usize) {
    let indent = "  ".repeat(depth);
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                match child {
                    Value::Object(_) | Value::Array(_) => {
                        out.push_str(&format!("{indent}{key}:\n"));
                        write_text(out, child, depth + 1);
                    }
                    scalar => out.push_str(&format!("{indent}{key}: {}\n", scalar_text(scalar))),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Object(_) | Value::Array(_) => {
                        out.push_str(&format!("{indent}-\n"));
                        write_text(out, item, depth + 1);
                    }
                    scalar => out.push_str(&format!("{indent}- {}\n", scalar_text(scalar))),
                }
            }
        }
        scalar => out.push_str(&format!("{indent}{}\n", scalar_text(scalar))),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        nested => nested.to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("JSON rendering failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML rendering failed: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("XML rendering failed: {0}")]
    Xml(String),

    #[error("CSV rendering failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("Manifest cannot be rendered: {0}")]
    UnsupportedShape(&'static str),
}
