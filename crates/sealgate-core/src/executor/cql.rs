//! Cassandra / ScyllaDB executor over the scylla driver.
//!
//! Statements are prepared first so every positional JSON value can be
//! converted against the bind marker's declared column type.

use super::params::ConnParams;
use super::value::{self, opt};
use super::Executor;
use crate::error::{BackendError, CapabilityError};
use crate::schema::Row;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveTime};
use num_bigint::BigInt;
use scylla::frame::response::result::{ColumnType, CqlValue};
use scylla::frame::value::{CqlDate, CqlDecimal, CqlTime, CqlTimestamp, CqlVarint};
use scylla::statement::Consistency;
use scylla::{Session, SessionBuilder};
use serde_json::Value;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct CqlExecutor {
    hosts: Vec<String>,
    user: String,
    pass: String,
    keyspace: String,
    consistency: Consistency,
    session: Option<Session>,
}

impl CqlExecutor {
    pub(crate) fn from_params(p: &ConnParams<'_>) -> Result<Self, CapabilityError> {
        let hosts: Vec<String> = p
            .required("hosts")?
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();
        if hosts.is_empty() {
            return Err(p.invalid("missing hosts"));
        }

        let consistency = p.required("consistency")?;
        let consistency = parse_consistency(&consistency)
            .ok_or_else(|| p.invalid(format!("unknown consistency {consistency}")))?;

        Ok(Self {
            hosts,
            user: p.required("user")?,
            pass: p.secret("pass")?,
            keyspace: p.required("keyspace")?,
            consistency,
            session: None,
        })
    }
}

pub(crate) fn parse_consistency(name: &str) -> Option<Consistency> {
    let c = match name.trim().to_ascii_lowercase().as_str() {
        "any" => Consistency::Any,
        "one" => Consistency::One,
        "two" => Consistency::Two,
        "three" => Consistency::Three,
        "quorum" => Consistency::Quorum,
        "all" => Consistency::All,
        "local_quorum" => Consistency::LocalQuorum,
        "each_quorum" => Consistency::EachQuorum,
        "local_one" => Consistency::LocalOne,
        _ => return None,
    };
    Some(c)
}

fn mismatch(index: usize, typ: &ColumnType) -> BackendError {
    BackendError::QueryFailure(format!("param {} cannot be bound as {typ:?}", index + 1))
}

/// Convert one JSON parameter against its bind marker type.
fn to_cql(index: usize, value: &Value, typ: &ColumnType) -> Result<Option<CqlValue>, BackendError> {
    let fail = || mismatch(index, typ);
    let int = || value.as_i64().ok_or_else(fail);
    let text = || value.as_str().ok_or_else(fail);

    let v = match (typ, value) {
        (_, Value::Null) => return Ok(None),
        (ColumnType::Boolean, _) => CqlValue::Boolean(value.as_bool().ok_or_else(fail)?),
        (ColumnType::TinyInt, _) => CqlValue::TinyInt(int()?.try_into().map_err(|_| fail())?),
        (ColumnType::SmallInt, _) => CqlValue::SmallInt(int()?.try_into().map_err(|_| fail())?),
        (ColumnType::Int, _) => CqlValue::Int(int()?.try_into().map_err(|_| fail())?),
        (ColumnType::BigInt, _) => CqlValue::BigInt(int()?),
        (ColumnType::Float, _) => CqlValue::Float(value.as_f64().ok_or_else(fail)? as f32),
        (ColumnType::Double, _) => CqlValue::Double(value.as_f64().ok_or_else(fail)?),
        (ColumnType::Text, _) => CqlValue::Text(text()?.to_string()),
        (ColumnType::Ascii, _) => CqlValue::Ascii(text()?.to_string()),
        (ColumnType::Uuid, _) => {
            CqlValue::Uuid(uuid::Uuid::parse_str(text()?).map_err(|_| fail())?)
        }
        (ColumnType::Blob, _) => CqlValue::Blob(BASE64.decode(text()?).map_err(|_| fail())?),
        (ColumnType::Timestamp, Value::Number(_)) => CqlValue::Timestamp(CqlTimestamp(int()?)),
        (ColumnType::Timestamp, _) => {
            let ts = DateTime::parse_from_rfc3339(text()?).map_err(|_| fail())?;
            CqlValue::Timestamp(CqlTimestamp(ts.timestamp_millis()))
        }
        _ => return Err(fail()),
    };
    Ok(Some(v))
}

fn from_cql(value: CqlValue) -> Value {
    match value {
        CqlValue::Ascii(s) | CqlValue::Text(s) => Value::String(s),
        CqlValue::Boolean(b) => Value::Bool(b),
        CqlValue::TinyInt(i) => Value::from(i),
        CqlValue::SmallInt(i) => Value::from(i),
        CqlValue::Int(i) => Value::from(i),
        CqlValue::BigInt(i) => Value::from(i),
        CqlValue::Counter(c) => Value::from(c.0),
        CqlValue::Float(f) => value::float(f.into()),
        CqlValue::Double(f) => value::float(f),
        CqlValue::Blob(b) => value::bytes(&b),
        CqlValue::Uuid(u) => Value::String(u.to_string()),
        CqlValue::Inet(ip) => Value::String(ip.to_string()),
        CqlValue::Timestamp(CqlTimestamp(ms)) => {
            opt(DateTime::from_timestamp_millis(ms), value::timestamp)
        }
        CqlValue::List(items) | CqlValue::Set(items) => {
            Value::Array(items.into_iter().map(from_cql).collect())
        }
        CqlValue::Map(pairs) => {
            if pairs.iter().all(|(k, _)| k.as_text().is_some()) {
                Value::Object(
                    pairs
                        .into_iter()
                        .filter_map(|(k, v)| k.into_string().map(|k| (k, from_cql(v))))
                        .collect(),
                )
            } else {
                Value::Array(
                    pairs
                        .into_iter()
                        .map(|(k, v)| Value::Array(vec![from_cql(k), from_cql(v)]))
                        .collect(),
                )
            }
        }
        CqlValue::Tuple(items) => Value::Array(
            items
                .into_iter()
                .map(|item| opt(item, from_cql))
                .collect(),
        ),
        CqlValue::Varint(v) => varint(v),
        CqlValue::Decimal(d) => decimal(d),
        CqlValue::Date(d) => opt(cql_date(d), |d| Value::String(d.to_string())),
        CqlValue::Time(t) => opt(cql_time(t), |t| Value::String(t.to_string())),
        CqlValue::Empty => Value::Null,
        other => Value::String(format!("{other:?}")),
    }
}

fn varint(v: CqlVarint) -> Value {
    value::decimal(BigInt::from_signed_bytes_be(&v.into_signed_bytes_be()))
}

/// CQL decimals are a two's-complement unscaled integer plus a scale.
fn decimal(d: CqlDecimal) -> Value {
    let (digits, scale) = d.into_signed_be_bytes_and_exponent();
    value::decimal(BigDecimal::new(
        BigInt::from_signed_bytes_be(&digits),
        i64::from(scale),
    ))
}

/// Days since the epoch, biased by 2^31.
fn cql_date(d: CqlDate) -> Option<chrono::NaiveDate> {
    let days = i64::from(d.0) - (1i64 << 31);
    DateTime::from_timestamp(days.checked_mul(86_400)?, 0).map(|dt| dt.date_naive())
}

/// Nanoseconds since midnight.
fn cql_time(t: CqlTime) -> Option<NaiveTime> {
    let secs = u32::try_from(t.0.div_euclid(1_000_000_000)).ok()?;
    let nanos = u32::try_from(t.0.rem_euclid(1_000_000_000)).ok()?;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
}

#[async_trait]
impl Executor for CqlExecutor {
    async fn connect(&mut self) -> Result<(), BackendError> {
        let session = SessionBuilder::new()
            .known_nodes(&self.hosts)
            .user(&self.user, &self.pass)
            .use_keyspace(&self.keyspace, false)
            .connection_timeout(CONNECT_TIMEOUT)
            .build()
            .await
            .map_err(|e| BackendError::ConnectFailure(e.to_string()))?;
        self.session = Some(session);
        Ok(())
    }

    async fn execute(
        &mut self,
        statement: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, BackendError> {
        let query_failure = |e: scylla::transport::errors::QueryError| {
            BackendError::QueryFailure(e.to_string())
        };
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| BackendError::ConnectFailure("not connected".to_string()))?;

        let mut prepared = session.prepare(statement).await.map_err(query_failure)?;
        prepared.set_consistency(self.consistency);

        let specs = prepared.get_variable_col_specs();
        if specs.len() != params.len() {
            return Err(BackendError::QueryFailure(format!(
                "statement has {} bind markers, got {} params",
                specs.len(),
                params.len()
            )));
        }
        let values = params
            .iter()
            .zip(specs)
            .enumerate()
            .map(|(i, (v, spec))| to_cql(i, v, &spec.typ))
            .collect::<Result<Vec<_>, _>>()?;

        let result = session
            .execute(&prepared, values)
            .await
            .map_err(query_failure)?;

        let names: Vec<String> = result.col_specs.iter().map(|c| c.name.clone()).collect();
        let rows = result.rows.unwrap_or_default();
        Ok(rows
            .into_iter()
            .map(|row| {
                names
                    .iter()
                    .cloned()
                    .zip(row.columns)
                    .map(|(name, v)| (name, opt(v, from_cql)))
                    .collect()
            })
            .collect())
    }

    async fn disconnect(&mut self) {
        // dropping the session closes its connections
        self.session = None;
    }
}
