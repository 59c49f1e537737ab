//! JSON ⇄ backend value mapping shared by the executors.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};
use std::fmt::Display;

/// Positional parameter for the SQL executors.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&Value> for SqlParam {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => SqlParam::Null,
            Value::Bool(b) => SqlParam::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlParam::Int(i),
                None => n.as_f64().map_or(SqlParam::Null, SqlParam::Float),
            },
            Value::String(s) => SqlParam::Text(s.clone()),
            // arrays and objects travel as their JSON text
            other => SqlParam::Text(other.to_string()),
        }
    }
}

pub(crate) fn sql_params(values: &[Value]) -> Vec<SqlParam> {
    values.iter().map(SqlParam::from).collect()
}

pub(crate) fn float(v: f64) -> Value {
    Number::from_f64(v).map_or(Value::Null, Value::Number)
}

/// Exact numerics travel as strings so no precision is lost to `f64`.
pub(crate) fn decimal(v: impl Display) -> Value {
    Value::String(v.to_string())
}

pub(crate) fn bytes(v: &[u8]) -> Value {
    Value::String(BASE64.encode(v))
}

pub(crate) fn timestamp(v: DateTime<Utc>) -> Value {
    Value::String(v.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Zone-less timestamps render without an offset.
pub(crate) fn naive_timestamp(v: NaiveDateTime) -> Value {
    Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
}

/// `None` stays JSON null.
pub(crate) fn opt<T>(v: Option<T>, f: impl FnOnce(T) -> Value) -> Value {
    v.map_or(Value::Null, f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sql_param_mapping() {
        assert_eq!(
            sql_params(&[
                json!(null),
                json!(true),
                json!(-7),
                json!(1.5),
                json!("x"),
                json!([1, 2]),
                json!({"a": 1}),
            ]),
            vec![
                SqlParam::Null,
                SqlParam::Bool(true),
                SqlParam::Int(-7),
                SqlParam::Float(1.5),
                SqlParam::Text("x".into()),
                SqlParam::Text("[1,2]".into()),
                SqlParam::Text("{\"a\":1}".into()),
            ]
        );
    }

    #[test]
    fn test_large_unsigned_becomes_float() {
        assert_eq!(
            SqlParam::from(&json!(u64::MAX)),
            SqlParam::Float(u64::MAX as f64)
        );
    }

    #[test]
    fn test_non_finite_float_is_null() {
        assert_eq!(float(f64::NAN), Value::Null);
        assert_eq!(float(2.0), json!(2.0));
        assert_eq!(bytes(b"hi"), json!("aGk="));
    }

    #[test]
    fn test_decimal_keeps_scale() {
        let money: bigdecimal::BigDecimal = "1234.50".parse().unwrap();
        assert_eq!(decimal(money), json!("1234.50"));

        let negative: bigdecimal::BigDecimal = "-12.5".parse().unwrap();
        assert_eq!(decimal(negative), json!("-12.5"));
    }

    #[test]
    fn test_temporal_rendering() {
        let ts = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(timestamp(ts), json!("2023-11-14T22:13:20Z"));
        assert_eq!(
            naive_timestamp(ts.naive_utc()),
            json!("2023-11-14T22:13:20")
        );
        assert_eq!(opt(None::<i64>, Value::from), Value::Null);
    }
}
