use duckdb::types::{ToSql, Value};
use duckdb::{Result as DuckResult, Rows, Statement};
use serde_json::Value as JsonValue;
use std::convert::TryInto;

/// Converts a JSON parameter value into a DuckDB value for binding.
/// Arrays and objects are bound as their JSON text form.
pub fn json_to_duck(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Boolean(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::BigInt(i)
            } else {
                Value::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        JsonValue::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

/// Converts a fetched DuckDB value into JSON for the result payload.
pub fn duck_to_json(value: Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Boolean(b) => JsonValue::Bool(b),
        Value::TinyInt(i) => JsonValue::from(i),
        Value::SmallInt(i) => JsonValue::from(i),
        Value::Int(i) => JsonValue::from(i),
        Value::BigInt(i) => JsonValue::from(i),
        Value::UTinyInt(i) => JsonValue::from(i),
        Value::USmallInt(i) => JsonValue::from(i),
        Value::UInt(i) => JsonValue::from(i),
        Value::UBigInt(i) => JsonValue::from(i),
        Value::Float(f) => JsonValue::from(f),
        Value::Double(f) => JsonValue::from(f),
        Value::Text(s) => JsonValue::String(s),
        other => JsonValue::String(format!("{:?}", other)),
    }
}

/// Runs a prepared statement with a dynamic slice of positional parameters,
/// supporting up to 27 parameters.
/// If you exceed 27 parameters, you will get an unimplemented!() panic.
pub fn query_stmt<'a>(
    stmt: &'a mut Statement,
    params: &[&(dyn ToSql + Sync)],
) -> DuckResult<Rows<'a>> {
    macro_rules! match_params {
        ($($n:expr),*) => {
            match params.len() {
                0 => stmt.query([]),
                $(
                    $n => {
                        let arr: [&(dyn ToSql + Sync); $n] = params.try_into().unwrap();
                        stmt.query(arr)
                    }
                ),*,
                n => unimplemented!("Too many parameters: {} (max 27 allowed)", n),
            }
        };
    }

    match_params!(
        1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25,
        26, 27
    )
}
