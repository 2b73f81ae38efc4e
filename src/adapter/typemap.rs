//! Column type normalization across engines.
//!
//! Staging tables are created on the target from source-side introspection,
//! so MySQL column types must render as PostgreSQL types and vice versa.
//! Schema compatibility checks compare the canonical family of a type, not
//! its engine-specific spelling.

use super::Engine;

/// Strip the display width or precision suffix: `int(11)` becomes `int`,
/// `varchar(255)` stays split into base and suffix.
fn split_base(sql_type: &str) -> (String, Option<&str>) {
    let lowered = sql_type.trim().to_lowercase();
    match sql_type.find('(') {
        Some(idx) => (lowered[..idx].trim().to_string(), Some(&sql_type[idx..])),
        None => (lowered, None),
    }
}

/// Canonical type family used for source/target compatibility comparison.
/// Engine-specific spellings of the same family compare equal; display
/// widths, unsigned markers, and timezone spellings do not participate.
pub fn canonical(sql_type: &str) -> String {
    let (base, _) = split_base(sql_type);
    let base = base.trim_end_matches(" unsigned").to_string();
    match base.as_str() {
        "tinyint" | "smallint" | "smallserial" | "int2" => "int16",
        "int" | "integer" | "mediumint" | "serial" | "int4" => "int32",
        "bigint" | "bigserial" | "int8" => "int64",
        "float" | "real" | "float4" => "float32",
        "double" | "double precision" | "float8" => "float64",
        "decimal" | "numeric" => "decimal",
        "bool" | "boolean" => "bool",
        "char" | "character" => "char",
        "varchar" | "character varying" => "varchar",
        "text" | "tinytext" | "mediumtext" | "longtext" => "text",
        "date" => "date",
        "time" | "time without time zone" => "time",
        "datetime" | "timestamp" | "timestamp without time zone"
        | "timestamptz" | "timestamp with time zone" => "datetime",
        "json" | "jsonb" => "json",
        "blob" | "tinyblob" | "mediumblob" | "longblob" | "binary" | "varbinary" | "bytea" => {
            "bytes"
        }
        "uuid" => "uuid",
        other => other,
    }
    .to_string()
}

/// Render a source column type in the target engine's dialect. Same-engine
/// types pass through unchanged; auto-increment and serial flavors
/// deliberately degrade to plain integers, since replicated tables never
/// generate keys server-side.
pub fn render_type(target: Engine, source_type: &str) -> String {
    let (base, suffix) = split_base(source_type);
    let base = base.trim_end_matches(" unsigned");

    match target {
        Engine::Postgres => match base {
            "tinyint" if suffix == Some("(1)") => "boolean".to_string(),
            "tinyint" | "smallint" => "smallint".to_string(),
            "int" | "integer" | "mediumint" | "serial" => "integer".to_string(),
            "bigint" | "bigserial" => "bigint".to_string(),
            "float" => "real".to_string(),
            "double" => "double precision".to_string(),
            "decimal" | "numeric" => format!("numeric{}", suffix.unwrap_or("")),
            "varchar" | "character varying" => format!("varchar{}", suffix.unwrap_or("(255)")),
            "char" | "character" => format!("char{}", suffix.unwrap_or("(1)")),
            "tinytext" | "mediumtext" | "longtext" | "text" => "text".to_string(),
            "datetime" => "timestamp".to_string(),
            "timestamp" => "timestamptz".to_string(),
            "json" | "jsonb" => "jsonb".to_string(),
            "blob" | "tinyblob" | "mediumblob" | "longblob" | "binary" | "varbinary" => {
                "bytea".to_string()
            }
            _ => source_type.to_string(),
        },
        Engine::MySql => match base {
            "boolean" | "bool" => "tinyint(1)".to_string(),
            "smallint" | "smallserial" | "int2" => "smallint".to_string(),
            "integer" | "serial" | "int4" => "int".to_string(),
            "bigint" | "bigserial" | "int8" => "bigint".to_string(),
            "real" | "float4" => "float".to_string(),
            "double precision" | "float8" => "double".to_string(),
            "numeric" => format!("decimal{}", suffix.unwrap_or("")),
            "character varying" => format!("varchar{}", suffix.unwrap_or("(255)")),
            "character" => format!("char{}", suffix.unwrap_or("(1)")),
            "timestamp" | "timestamp without time zone" | "timestamptz"
            | "timestamp with time zone" => "datetime".to_string(),
            "jsonb" => "json".to_string(),
            "bytea" => "longblob".to_string(),
            "uuid" => "char(36)".to_string(),
            _ => source_type.to_string(),
        },
    }
}
