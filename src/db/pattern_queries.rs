use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::manifest::ManifestFormat;
use crate::models::pattern::{CsvDelimiter, Pattern};

fn decode_err(column: &str, e: strum::ParseError) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    }
}

/// Get a pattern by ID
pub async fn get_pattern(pool: &PgPool, pattern_id: Uuid) -> Result<Option<Pattern>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, name, version, format, instructions, json_schema,
               yaml_schema, xml_schema, csv_schema, plain_text_schema,
               csv_delimiter, model_profile
        FROM patterns
        WHERE id = $1
        "#,
    )
    .bind(pattern_id)
    .fetch_optional(pool)
    .await?;

    let Some(r) = row else {
        return Ok(None);
    };

    let format: String = r.try_get("format")?;
    let delimiter: String = r.try_get("csv_delimiter")?;

    Ok(Some(Pattern {
        id: r.try_get("id")?,
        user_id: r.try_get("user_id")?,
        name: r.try_get("name")?,
        version: r.try_get("version")?,
        format: ManifestFormat::from_str(&format).map_err(|e| decode_err("format", e))?,
        instructions: r.try_get("instructions")?,
        json_schema: r.try_get("json_schema")?,
        yaml_schema: r.try_get("yaml_schema")?,
        xml_schema: r.try_get("xml_schema")?,
        csv_schema: r.try_get("csv_schema")?,
        plain_text_schema: r.try_get("plain_text_schema")?,
        csv_delimiter: CsvDelimiter::from_str(&delimiter)
            .map_err(|e| decode_err("csv_delimiter", e))?,
        model_profile: r.try_get("model_profile")?,
    }))
}

/// Insert a pattern (used by seeding and integration tests)
pub async fn insert_pattern(pool: &PgPool, pattern: &Pattern) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO patterns (id, user_id, name, version, format, instructions, json_schema,
                              yaml_schema, xml_schema, csv_schema, plain_text_schema,
                              csv_delimiter, model_profile)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(pattern.id)
    .bind(&pattern.user_id)
    .bind(&pattern.name)
    .bind(pattern.version)
    .bind(pattern.format.to_string())
    .bind(&pattern.instructions)
    .bind(&pattern.json_schema)
    .bind(&pattern.yaml_schema)
    .bind(&pattern.xml_schema)
    .bind(&pattern.csv_schema)
    .bind(&pattern.plain_text_schema)
    .bind(pattern.csv_delimiter.to_string())
    .bind(&pattern.model_profile)
    .execute(pool)
    .await?;

    Ok(())
}
