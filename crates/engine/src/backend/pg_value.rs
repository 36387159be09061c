//! JSON conversion for Postgres parameters and result rows.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use sluice_error::{ErrorCode, Result, SluiceError};
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::Row;

use super::ParamError;

pub(crate) type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Rewrite `:name` placeholders to `$n`, returning the names in position
/// order. Quoted text, `::` casts and repeated names are handled.
pub(crate) fn rewrite_named_params(sql: &str) -> (String, Vec<String>) {
    let mut out = String::with_capacity(sql.len());
    let mut names: Vec<String> = Vec::new();
    let chars: Vec<char> = sql.chars().collect();
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if let Some(q) = quote {
            out.push(ch);
            if ch == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match ch {
            '\'' | '"' => {
                quote = Some(ch);
                out.push(ch);
                i += 1;
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                out.push_str("::");
                i += 2;
            }
            ':' if chars
                .get(i + 1)
                .is_some_and(|c| c.is_alphabetic() || *c == '_') =>
            {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let position = match names.iter().position(|n| *n == name) {
                    Some(p) => p + 1,
                    None => {
                        names.push(name);
                        names.len()
                    }
                };
                out.push('$');
                out.push_str(&position.to_string());
                i = end;
            }
            _ => {
                out.push(ch);
                i += 1;
            }
        }
    }
    (out, names)
}

fn typed<T>(
    name: &str,
    value: &Value,
    ty: &Type,
    extract: impl Fn(&Value) -> Option<T>,
) -> std::result::Result<Option<T>, ParamError> {
    if value.is_null() {
        return Ok(None);
    }
    extract(value)
        .map(Some)
        .ok_or_else(|| ParamError::TypeMismatch {
            name: name.to_string(),
            expected: ty.name().to_string(),
            value: value.to_string(),
        })
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Convert a JSON value to a parameter of the type the server prepared.
pub(crate) fn to_sql_param(
    name: &str,
    value: &Value,
    ty: &Type,
) -> std::result::Result<BoxedParam, ParamError> {
    let param: BoxedParam = match ty.name() {
        "bool" => Box::new(typed(name, value, ty, Value::as_bool)?),
        "int2" => Box::new(typed(name, value, ty, |v| {
            v.as_i64().and_then(|n| i16::try_from(n).ok())
        })?),
        "int4" => Box::new(typed(name, value, ty, |v| {
            v.as_i64().and_then(|n| i32::try_from(n).ok())
        })?),
        "int8" => Box::new(typed(name, value, ty, Value::as_i64)?),
        "float4" => Box::new(typed(name, value, ty, |v| v.as_f64().map(|f| f as f32))?),
        "float8" => Box::new(typed(name, value, ty, Value::as_f64)?),
        "json" | "jsonb" => Box::new(value.clone()),
        "timestamptz" => Box::new(typed(name, value, ty, |v| {
            v.as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        })?),
        "timestamp" => Box::new(typed(name, value, ty, |v| {
            v.as_str().and_then(|s| s.parse::<NaiveDateTime>().ok())
        })?),
        "date" => Box::new(typed(name, value, ty, |v| {
            v.as_str().and_then(|s| s.parse::<NaiveDate>().ok())
        })?),
        _ => Box::new(typed(name, value, ty, as_text)?),
    };
    Ok(param)
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<T> {
    row.try_get(idx).map_err(|e| {
        SluiceError::new(
            ErrorCode::SerializationFailed,
            format!("Failed to decode column {}: {}", idx, e),
        )
    })
}

fn json_or_null<T: Into<Value>>(v: Option<T>) -> Value {
    v.map(Into::into).unwrap_or(Value::Null)
}

/// Convert every column of a row to JSON according to its Postgres type.
pub(crate) fn row_to_json(row: &Row) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match column.type_().name() {
            "bool" => json_or_null(get::<Option<bool>>(row, idx)?),
            "int2" => json_or_null(get::<Option<i16>>(row, idx)?),
            "int4" => json_or_null(get::<Option<i32>>(row, idx)?),
            "int8" => json_or_null(get::<Option<i64>>(row, idx)?),
            "oid" => json_or_null(get::<Option<u32>>(row, idx)?),
            "float4" => json_or_null(get::<Option<f32>>(row, idx)?.map(f64::from)),
            "float8" => json_or_null(get::<Option<f64>>(row, idx)?),
            "json" | "jsonb" => get::<Option<Value>>(row, idx)?.unwrap_or(Value::Null),
            "timestamptz" => json_or_null(
                get::<Option<DateTime<Utc>>>(row, idx)?.map(|dt| dt.to_rfc3339()),
            ),
            "timestamp" => json_or_null(
                get::<Option<NaiveDateTime>>(row, idx)?.map(|dt| dt.to_string()),
            ),
            "date" => json_or_null(get::<Option<NaiveDate>>(row, idx)?.map(|d| d.to_string())),
            "_text" | "_varchar" | "_name" => {
                json_or_null(get::<Option<Vec<String>>>(row, idx)?)
            }
            // Types without a native mapping are read as text when the
            // driver allows it, otherwise reported as null.
            _ => row
                .try_get::<_, Option<String>>(idx)
                .ok()
                .flatten()
                .map(Value::String)
                .unwrap_or(Value::Null),
        };
        values.push(value);
    }
    Ok(values)
}
