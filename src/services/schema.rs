//! JSON Schema helpers for structured extraction.
//!
//! The manifest column is JSONB, which does not keep object key order, so
//! manifests are re-ordered on the way out using the pattern's schema: the
//! `required` array (an array, so its order survives storage) first, then the
//! remaining `properties`, then any keys the schema does not mention.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::{Map, Value};

use crate::models::manifest::ManifestFormat;
use crate::models::pattern::{CsvDelimiter, Pattern};

static NO_SCHEMA: Value = Value::Null;

/// Build the strict schema sent to the inference provider.
///
/// Objects get `type: object`, their declared `properties` and `required`
/// list, and `additionalProperties: false`. Nested object and array-item
/// schemas are tightened the same way.
pub fn strict_output_schema(schema: &Value) -> Value {
    let mut strict = Map::new();
    if let Value::Object(source) = schema {
        for (key, value) in source {
            if !matches!(key.as_str(), "type" | "properties" | "required" | "additionalProperties") {
                strict.insert(key.clone(), value.clone());
            }
        }
    }

    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| {
            props
                .iter()
                .map(|(name, sub)| (name.clone(), tighten(sub)))
                .collect::<Map<String, Value>>()
        })
        .unwrap_or_default();

    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    strict.insert("type".to_string(), Value::String("object".to_string()));
    strict.insert("properties".to_string(), Value::Object(properties));
    strict.insert("required".to_string(), Value::Array(required));
    strict.insert("additionalProperties".to_string(), Value::Bool(false));
    Value::Object(strict)
}

fn tighten(schema: &Value) -> Value {
    if is_object_schema(schema) {
        return strict_output_schema(schema);
    }
    match (schema, schema.get("items")) {
        (Value::Object(source), Some(items)) => {
            let mut out = source.clone();
            out.insert("items".to_string(), tighten(items));
            Value::Object(out)
        }
        _ => schema.clone(),
    }
}

fn is_object_schema(schema: &Value) -> bool {
    schema.get("type").and_then(Value::as_str) == Some("object")
        || schema.get("properties").is_some_and(Value::is_object)
}

/// Check a provider response against a strict schema.
///
/// Only the structural parts the strict schema pins down are checked:
/// object-ness, required keys and undeclared keys, recursively.
pub fn check_conformance(value: &Value, schema: &Value) -> Result<(), String> {
    check_at(value, schema, "$")
}

fn check_at(value: &Value, schema: &Value, path: &str) -> Result<(), String> {
    if is_object_schema(schema) {
        let Value::Object(map) = value else {
            return Err(format!("{path}: expected an object"));
        };
        let properties = schema.get("properties").and_then(Value::as_object);

        for name in required_names(schema) {
            if !map.contains_key(name) {
                return Err(format!("{path}: missing required field `{name}`"));
            }
        }

        let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));
        for (key, child) in map {
            match properties.and_then(|props| props.get(key)) {
                Some(sub) => check_at(child, sub, &format!("{path}.{key}"))?,
                None if closed => return Err(format!("{path}: unexpected field `{key}`")),
                None => {}
            }
        }
        return Ok(());
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (index, item) in items.iter().enumerate() {
            check_at(item, item_schema, &format!("{path}[{index}]"))?;
        }
    }
    Ok(())
}

fn required_names(schema: &Value) -> impl Iterator<Item = &str> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

/// Rebuild object key order from the schema, recursing into nested values.
pub fn order_by_schema(value: &Value, schema: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let properties = schema.get("properties").and_then(Value::as_object);
            let sub_schema =
                |name: &str| properties.and_then(|p| p.get(name)).unwrap_or(&NO_SCHEMA);

            let mut ordered = Map::with_capacity(map.len());
            let declared = required_names(schema)
                .chain(properties.into_iter().flat_map(|p| p.keys().map(String::as_str)));
            for name in declared {
                if ordered.contains_key(name) {
                    continue;
                }
                if let Some(child) = map.get(name) {
                    ordered.insert(name.to_string(), order_by_schema(child, sub_schema(name)));
                }
            }
            for (name, child) in map {
                if !ordered.contains_key(name) {
                    ordered.insert(name.clone(), order_by_schema(child, sub_schema(name)));
                }
            }
            Value::Object(ordered)
        }
        Value::Array(items) => {
            let item_schema = schema.get("items").unwrap_or(&NO_SCHEMA);
            Value::Array(items.iter().map(|item| order_by_schema(item, item_schema)).collect())
        }
        other => other.clone(),
    }
}

/// Key-order template from the per-format schema declared for the pattern's
/// own format (YAML document, XML skeleton or `key:` text lines). Only object
/// keys and their nesting are kept.
pub fn declared_template(pattern: &Pattern) -> Option<Value> {
    let declared = pattern.format_schema(pattern.format)?;
    let template = match pattern.format {
        ManifestFormat::Yaml => serde_yaml::from_str::<Value>(declared).ok(),
        ManifestFormat::Xml => xml_template(declared),
        ManifestFormat::Text => text_template(declared),
        ManifestFormat::Json | ManifestFormat::Csv => None,
    }?;
    template.is_object().then_some(template)
}

/// Children of the root element, in document order. Repeated names keep
/// their first position.
fn xml_template(declared: &str) -> Option<Value> {
    let mut reader = Reader::from_str(declared);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<(String, Map<String, Value>)> = Vec::new();
    loop {
        match reader.read_event().ok()? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                stack.push((name, Map::new()));
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if let Some((_, parent)) = stack.last_mut() {
                    parent.entry(name).or_insert(Value::Null);
                }
            }
            Event::End(_) => {
                let (name, children) = stack.pop()?;
                let Some((_, parent)) = stack.last_mut() else {
                    return Some(Value::Object(children));
                };
                let node = if children.is_empty() {
                    Value::Null
                } else {
                    Value::Object(children)
                };
                parent.entry(name).or_insert(node);
            }
            Event::Eof => return None,
            _ => {}
        }
    }
}

/// Unindented `key:` lines of a plain-text template.
fn text_template(declared: &str) -> Option<Value> {
    let keys: Map<String, Value> = declared
        .lines()
        .filter(|line| !line.starts_with(char::is_whitespace))
        .filter_map(|line| line.split_once(':'))
        .map(|(key, _)| key.trim())
        .filter(|key| !key.is_empty() && *key != "-")
        .map(|key| (key.to_string(), Value::Null))
        .collect();
    (!keys.is_empty()).then_some(Value::Object(keys))
}

/// Reorder object keys to follow `template`, recursing into nested values.
/// Keys the template does not mention keep their relative order after it.
pub fn order_by_template(value: &Value, template: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let declared = template.as_object();
            let sub_template =
                |name: &str| declared.and_then(|t| t.get(name)).unwrap_or(&NO_SCHEMA);

            let mut ordered = Map::with_capacity(map.len());
            for name in declared.into_iter().flat_map(|t| t.keys()) {
                if let Some(child) = map.get(name) {
                    ordered.insert(name.clone(), order_by_template(child, sub_template(name)));
                }
            }
            for (name, child) in map {
                if !ordered.contains_key(name) {
                    ordered.insert(name.clone(), order_by_template(child, sub_template(name)));
                }
            }
            Value::Object(ordered)
        }
        Value::Array(items) => {
            // YAML lists template their first entry; XML wraps entries in one element.
            let item_template = match template {
                Value::Array(entries) => entries.first(),
                Value::Object(wrapper) if wrapper.len() == 1 => wrapper.values().next(),
                _ => None,
            }
            .unwrap_or(&NO_SCHEMA);
            Value::Array(items.iter().map(|item| order_by_template(item, item_template)).collect())
        }
        other => other.clone(),
    }
}

/// Parse a declared CSV header row (first non-blank line of the schema).
pub fn parse_csv_header(schema: &str, delimiter: CsvDelimiter) -> Vec<String> {
    let Some(line) = schema.lines().find(|line| !line.trim().is_empty()) else {
        return Vec::new();
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter.as_byte())
        .from_reader(line.as_bytes());

    match reader.records().next() {
        Some(Ok(record)) => record
            .iter()
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Header order for a CSV pattern: the declared header row, or the order of
/// `properties.rows.items` when no header was declared.
///
/// The provider only returns objects, so CSV patterns declare their rows as
/// a `rows` array property rather than a top-level array schema.
pub fn csv_header(pattern: &Pattern) -> Vec<String> {
    if let Some(schema) = pattern.format_schema(ManifestFormat::Csv) {
        let header = parse_csv_header(schema, pattern.csv_delimiter);
        if !header.is_empty() {
            return header;
        }
    }

    let row_schema = pattern
        .json_schema
        .pointer("/properties/rows/items")
        .unwrap_or(&NO_SCHEMA);

    let mut header: Vec<String> = required_names(row_schema).map(str::to_string).collect();
    if let Some(props) = row_schema.get("properties").and_then(Value::as_object) {
        for name in props.keys() {
            if !header.contains(name) {
                header.push(name.clone());
            }
        }
    }
    header
}

/// Borrow the rows of a CSV-shaped manifest: a top-level array of objects,
/// an object with a `rows` array, or a single flat object.
pub fn csv_rows(value: &Value) -> Option<Vec<&Map<String, Value>>> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("rows") {
            Some(Value::Array(items)) => items,
            _ => return Some(vec![map]),
        },
        _ => return None,
    };
    items.iter().map(Value::as_object).collect()
}

/// Reorder every row's keys to `header`, appending unknown keys afterwards
/// in their original order. Values are untouched.
pub fn reorder_csv_rows(value: &Value, header: &[String]) -> Value {
    match value {
        Value::Array(items) => {
            Value::Array(items.iter().map(|row| reorder_row(row, header)).collect())
        }
        Value::Object(map) => match map.get("rows") {
            Some(Value::Array(_)) => {
                let mut out = map.clone();
                if let Some(rows) = out.get_mut("rows") {
                    *rows = reorder_csv_rows(rows, header);
                }
                Value::Object(out)
            }
            _ => reorder_row(value, header),
        },
        other => other.clone(),
    }
}

fn reorder_row(row: &Value, header: &[String]) -> Value {
    let Value::Object(map) = row else {
        return row.clone();
    };
    let mut ordered = Map::with_capacity(map.len());
    for name in header {
        if let Some(cell) = map.get(name) {
            ordered.insert(name.clone(), cell.clone());
        }
    }
    for (name, cell) in map {
        if !ordered.contains_key(name) {
            ordered.insert(name.clone(), cell.clone());
        }
    }
    Value::Object(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(value: &Value) -> Vec<&str> {
        value.as_object().unwrap().keys().map(String::as_str).collect()
    }

    fn templated(format: ManifestFormat, declared: &str) -> Pattern {
        let mut pattern = Pattern {
            id: uuid::Uuid::new_v4(),
            user_id: "u".to_string(),
            name: "invoice".to_string(),
            version: 1,
            format,
            instructions: "Extract".to_string(),
            json_schema: json!({"type": "object"}),
            yaml_schema: None,
            xml_schema: None,
            csv_schema: None,
            plain_text_schema: None,
            csv_delimiter: CsvDelimiter::Comma,
            model_profile: "default".to_string(),
        };
        match format {
            ManifestFormat::Yaml => pattern.yaml_schema = Some(declared.to_string()),
            ManifestFormat::Xml => pattern.xml_schema = Some(declared.to_string()),
            ManifestFormat::Text => pattern.plain_text_schema = Some(declared.to_string()),
            ManifestFormat::Csv => pattern.csv_schema = Some(declared.to_string()),
            ManifestFormat::Json => {}
        }
        pattern
    }

    #[test]
    fn test_strict_schema_closes_objects() {
        let schema = json!({
            "required": ["a"],
            "properties": {
                "a": {"type": "string", "description": "first"},
                "nested": {"type": "object", "properties": {"x": {"type": "number"}}},
                "list": {"type": "array", "items": {"properties": {"y": {"type": "string"}}}}
            }
        });
        let strict = strict_output_schema(&schema);
        assert_eq!(strict["type"], json!("object"));
        assert_eq!(strict["additionalProperties"], json!(false));
        assert_eq!(strict["required"], json!(["a"]));
        assert_eq!(strict["properties"]["a"]["description"], json!("first"));
        assert_eq!(strict["properties"]["nested"]["additionalProperties"], json!(false));
        assert_eq!(strict["properties"]["nested"]["required"], json!([]));
        assert_eq!(
            strict["properties"]["list"]["items"]["additionalProperties"],
            json!(false)
        );
    }

    #[test]
    fn test_strict_schema_of_empty_schema() {
        let strict = strict_output_schema(&json!({}));
        assert_eq!(
            strict,
            json!({"type": "object", "properties": {}, "required": [], "additionalProperties": false})
        );
    }

    #[test]
    fn test_conformance_accepts_valid_response() {
        let strict = strict_output_schema(&json!({
            "required": ["a", "b"],
            "properties": {"a": {"type": "string"}, "b": {"type": "string"}}
        }));
        assert!(check_conformance(&json!({"b": "x", "a": "y"}), &strict).is_ok());
    }

    #[test]
    fn test_conformance_rejects_missing_and_extra_fields() {
        let strict = strict_output_schema(&json!({
            "required": ["a"],
            "properties": {"a": {"type": "string"}}
        }));
        let missing = check_conformance(&json!({}), &strict).unwrap_err();
        assert!(missing.contains("missing required field `a`"));
        let extra = check_conformance(&json!({"a": "x", "z": 1}), &strict).unwrap_err();
        assert!(extra.contains("unexpected field `z`"));
        assert!(check_conformance(&json!(["a"]), &strict).is_err());
    }

    #[test]
    fn test_conformance_checks_nested_items() {
        let strict = strict_output_schema(&json!({
            "properties": {
                "people": {"type": "array", "items": {"type": "object", "required": ["name"], "properties": {"name": {}}}}
            }
        }));
        let err = check_conformance(&json!({"people": [{"name": "a"}, {}]}), &strict).unwrap_err();
        assert!(err.starts_with("$.people[1]"));
    }

    #[test]
    fn test_required_fields_come_first() {
        let schema = json!({
            "required": ["a", "b"],
            "properties": {"b": {"type": "string"}, "a": {"type": "string"}}
        });
        let ordered = order_by_schema(&json!({"b": "x", "a": "y"}), &schema);
        assert_eq!(keys(&ordered), vec!["a", "b"]);
        assert_eq!(ordered["a"], json!("y"));
        assert_eq!(ordered["b"], json!("x"));
    }

    #[test]
    fn test_optional_then_unknown_fields() {
        let schema = json!({
            "required": ["id"],
            "properties": {"note": {}, "id": {}}
        });
        let ordered = order_by_schema(&json!({"zzz": 1, "note": "n", "id": 7}), &schema);
        assert_eq!(keys(&ordered), vec!["id", "note", "zzz"]);
    }

    #[test]
    fn test_ordering_recurses_into_objects_and_arrays() {
        let schema = json!({
            "required": ["items", "owner"],
            "properties": {
                "owner": {"required": ["first", "last"], "properties": {"last": {}, "first": {}}},
                "items": {"type": "array", "items": {"required": ["sku", "qty"], "properties": {}}}
            }
        });
        let ordered = order_by_schema(
            &json!({
                "owner": {"last": "L", "first": "F"},
                "items": [{"qty": 1, "sku": "A"}, {"qty": 2, "sku": "B"}]
            }),
            &schema,
        );
        assert_eq!(keys(&ordered), vec!["items", "owner"]);
        assert_eq!(keys(&ordered["owner"]), vec!["first", "last"]);
        assert_eq!(keys(&ordered["items"][1]), vec!["sku", "qty"]);
    }

    #[test]
    fn test_ordering_is_idempotent() {
        let schema = json!({
            "required": ["c", "a"],
            "properties": {"a": {}, "b": {"properties": {"y": {}, "x": {}}}, "c": {}}
        });
        let value = json!({"b": {"x": 1, "y": 2}, "extra": true, "a": 1, "c": 3});
        let once = order_by_schema(&value, &schema);
        let twice = order_by_schema(&once, &schema);
        assert_eq!(serde_json::to_string(&once).unwrap(), serde_json::to_string(&twice).unwrap());
        assert_eq!(once, value);
    }

    #[test]
    fn test_parse_csv_header() {
        assert_eq!(parse_csv_header("name;age\n", CsvDelimiter::Semicolon), vec!["name", "age"]);
        assert_eq!(
            parse_csv_header("\n \"full name\", age ", CsvDelimiter::Comma),
            vec!["full name", "age"]
        );
        assert!(parse_csv_header("", CsvDelimiter::Comma).is_empty());
    }

    #[test]
    fn test_csv_rows_reordered_to_header() {
        let header = vec!["name".to_string(), "age".to_string()];
        let rows = json!([{"age": 5, "name": "A"}, {"name": "B", "age": 9}]);
        let ordered = reorder_csv_rows(&rows, &header);
        assert_eq!(ordered, json!([{"name": "A", "age": 5}, {"name": "B", "age": 9}]));
        assert_eq!(keys(&ordered[0]), vec!["name", "age"]);
        assert_eq!(keys(&ordered[1]), vec!["name", "age"]);
    }

    #[test]
    fn test_csv_unknown_keys_appended_in_original_order() {
        let header = vec!["name".to_string()];
        let rows = json!({"rows": [{"z": 1, "name": "A", "b": 2}]});
        let ordered = reorder_csv_rows(&rows, &header);
        assert_eq!(keys(&ordered["rows"][0]), vec!["name", "z", "b"]);
        assert_eq!(ordered["rows"][0]["z"], json!(1));
        assert_eq!(ordered["rows"][0]["b"], json!(2));
    }

    #[test]
    fn test_csv_rows_shapes() {
        assert_eq!(csv_rows(&json!([{"a": 1}, {"a": 2}])).unwrap().len(), 2);
        assert_eq!(csv_rows(&json!({"rows": [{"a": 1}]})).unwrap().len(), 1);
        assert_eq!(csv_rows(&json!({"a": 1})).unwrap().len(), 1);
        assert!(csv_rows(&json!([1, 2])).is_none());
        assert!(csv_rows(&json!("text")).is_none());
    }

    #[test]
    fn test_yaml_template_order() {
        let pattern = templated(
            ManifestFormat::Yaml,
            "vendor: string\ntotal: number\nlines:\n  - sku: string\n    qty: number\n",
        );
        let template = declared_template(&pattern).unwrap();
        let ordered = order_by_template(
            &json!({"lines": [{"qty": 1, "sku": "A"}], "extra": true, "total": 3, "vendor": "Acme"}),
            &template,
        );
        assert_eq!(keys(&ordered), vec!["vendor", "total", "lines", "extra"]);
        assert_eq!(keys(&ordered["lines"][0]), vec!["sku", "qty"]);
    }

    #[test]
    fn test_xml_template_order() {
        let pattern = templated(
            ManifestFormat::Xml,
            "<manifest><vendor/><buyer><name/><city/></buyer><tags><item/></tags></manifest>",
        );
        let template = declared_template(&pattern).unwrap();
        assert_eq!(keys(&template), vec!["vendor", "buyer", "tags"]);

        let ordered = order_by_template(
            &json!({"tags": ["x"], "buyer": {"city": "Delft", "name": "B"}, "vendor": "V"}),
            &template,
        );
        assert_eq!(keys(&ordered), vec!["vendor", "buyer", "tags"]);
        assert_eq!(keys(&ordered["buyer"]), vec!["name", "city"]);
    }

    #[test]
    fn test_text_template_order() {
        let pattern = templated(ManifestFormat::Text, "Total: <amount>\nVendor: <name>\n  note: ignored\n");
        let template = declared_template(&pattern).unwrap();
        assert_eq!(keys(&template), vec!["Total", "Vendor"]);
    }

    #[test]
    fn test_no_template_for_json_csv_or_unparseable() {
        assert!(declared_template(&templated(ManifestFormat::Json, "")).is_none());
        assert!(declared_template(&templated(ManifestFormat::Csv, "a,b")).is_none());
        assert!(declared_template(&templated(ManifestFormat::Yaml, "- just\n- a list\n")).is_none());
        assert!(declared_template(&templated(ManifestFormat::Xml, "<manifest><open>")).is_none());
    }

    #[test]
    fn test_csv_header_from_rows_schema() {
        let mut pattern = templated(ManifestFormat::Csv, "");
        pattern.json_schema = json!({
            "required": ["rows"],
            "properties": {
                "rows": {"type": "array", "items": {"required": ["name"], "properties": {"age": {}, "name": {}}}}
            }
        });
        assert_eq!(csv_header(&pattern), vec!["name", "age"]);

        // The strict schema keeps the wrapper an object, so the provider can fill it.
        let strict = strict_output_schema(&pattern.json_schema);
        assert_eq!(strict["type"], json!("object"));
        let rows = json!({"rows": [{"name": "A", "age": 5}]});
        assert!(check_conformance(&rows, &strict).is_ok());

        // Top-level array schemas carry no header.
        pattern.json_schema = json!({"type": "array", "items": {"required": ["name"]}});
        assert!(csv_header(&pattern).is_empty());
    }
}
