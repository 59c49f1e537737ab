//! PostgreSQL, CockroachDB and MySQL executors over sqlx.

use super::params::ConnParams;
use super::value::{self, opt, SqlParam};
use super::{DriverName, Executor};
use crate::error::{BackendError, CapabilityError};
use crate::schema::Row;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow, PgSslMode};
use sqlx::query::Query;
use sqlx::types::BigDecimal;
use sqlx::{Column, ConnectOptions, Connection, MySql, Postgres, Row as _, TypeInfo};
use std::str::FromStr;

const APPLICATION_NAME: &str = "sealgate";

fn connect_failure(e: sqlx::Error) -> BackendError {
    BackendError::ConnectFailure(e.to_string())
}

fn query_failure(e: sqlx::Error) -> BackendError {
    BackendError::QueryFailure(e.to_string())
}

fn not_connected() -> BackendError {
    BackendError::ConnectFailure("not connected".to_string())
}

/// PostgreSQL wire protocol; also serves `cockroachdb`.
pub struct PostgresExecutor {
    options: PgConnectOptions,
    conn: Option<PgConnection>,
}

impl PostgresExecutor {
    pub fn new(options: PgConnectOptions) -> Self {
        Self {
            options: options.disable_statement_logging(),
            conn: None,
        }
    }

    pub(crate) fn from_params(p: &ConnParams<'_>) -> Result<Self, CapabilityError> {
        let cockroach = p.driver() == DriverName::CockroachDb;

        let ssl_mode = if cockroach {
            Some(p.required("sslmode")?)
        } else {
            p.optional("sslmode")?
        };
        let ssl_mode = match ssl_mode {
            Some(mode) => PgSslMode::from_str(&mode)
                .map_err(|_| p.invalid(format!("unknown sslmode {mode}")))?,
            None => PgSslMode::Prefer,
        };

        let mut database = p.required("db")?;
        let mut options = PgConnectOptions::new()
            .host(&p.required("host")?)
            .port(p.port("port")?)
            .username(&p.required("user")?)
            .password(&p.secret("pass")?)
            .ssl_mode(ssl_mode)
            .application_name(APPLICATION_NAME);

        if cockroach {
            if let Some(path) = p.optional("sslrootcert")? {
                options = options.ssl_root_cert(path);
            }
            if let Some(path) = p.optional("sslcert")? {
                options = options.ssl_client_cert(path);
            }
            if let Some(path) = p.optional("sslkey")? {
                options = options.ssl_client_key(path);
            }
            // serverless clusters route on a "<routing_id>.<db>" database name
            if let Some(routing_id) = p.optional("routing_id")? {
                database = format!("{routing_id}.{database}");
            }
        }

        Ok(Self::new(options.database(&database)))
    }
}

fn bind_pg<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: SqlParam,
) -> Query<'q, Postgres, PgArguments> {
    match param {
        SqlParam::Null => query.bind(None::<String>),
        SqlParam::Bool(b) => query.bind(b),
        SqlParam::Int(i) => query.bind(i),
        SqlParam::Float(f) => query.bind(f),
        SqlParam::Text(s) => query.bind(s),
    }
}

/// Decoding strategy for one result column, chosen by the driver's type
/// name. Types outside this set come back as null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Bool,
    Int16,
    Int32,
    Int64,
    UInt64,
    Float32,
    Float64,
    Decimal,
    Text,
    Uuid,
    Json,
    Bytes,
    TimestampTz,
    Timestamp,
    Date,
    Time,
    Unknown,
}

fn pg_kind(type_name: &str) -> ColumnKind {
    match type_name {
        "BOOL" => ColumnKind::Bool,
        "INT2" => ColumnKind::Int16,
        "INT4" => ColumnKind::Int32,
        "INT8" => ColumnKind::Int64,
        "FLOAT4" => ColumnKind::Float32,
        "FLOAT8" => ColumnKind::Float64,
        "NUMERIC" => ColumnKind::Decimal,
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => ColumnKind::Text,
        "UUID" => ColumnKind::Uuid,
        "JSON" | "JSONB" => ColumnKind::Json,
        "BYTEA" => ColumnKind::Bytes,
        "TIMESTAMPTZ" => ColumnKind::TimestampTz,
        "TIMESTAMP" => ColumnKind::Timestamp,
        "DATE" => ColumnKind::Date,
        "TIME" => ColumnKind::Time,
        _ => ColumnKind::Unknown,
    }
}

fn mysql_kind(type_name: &str) -> ColumnKind {
    match type_name {
        "BOOLEAN" => ColumnKind::Bool,
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => ColumnKind::Int64,
        unsigned if unsigned.ends_with(" UNSIGNED") => ColumnKind::UInt64,
        "FLOAT" => ColumnKind::Float32,
        "DOUBLE" => ColumnKind::Float64,
        "DECIMAL" => ColumnKind::Decimal,
        "VARCHAR" | "CHAR" | "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM" | "SET" => {
            ColumnKind::Text
        }
        "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => {
            ColumnKind::Bytes
        }
        "JSON" => ColumnKind::Json,
        "TIMESTAMP" => ColumnKind::TimestampTz,
        "DATETIME" => ColumnKind::Timestamp,
        "DATE" => ColumnKind::Date,
        "TIME" => ColumnKind::Time,
        _ => ColumnKind::Unknown,
    }
}

fn pg_row(row: &PgRow) -> Result<Row, sqlx::Error> {
    let mut out = Row::new();
    for col in row.columns() {
        let i = col.ordinal();
        let v = match pg_kind(col.type_info().name()) {
            ColumnKind::Bool => opt(row.try_get::<Option<bool>, _>(i)?, Value::Bool),
            ColumnKind::Int16 => opt(row.try_get::<Option<i16>, _>(i)?, Value::from),
            ColumnKind::Int32 => opt(row.try_get::<Option<i32>, _>(i)?, Value::from),
            ColumnKind::Int64 => opt(row.try_get::<Option<i64>, _>(i)?, Value::from),
            ColumnKind::Float32 => {
                opt(row.try_get::<Option<f32>, _>(i)?, |f| value::float(f.into()))
            }
            ColumnKind::Float64 => opt(row.try_get::<Option<f64>, _>(i)?, value::float),
            ColumnKind::Decimal => opt(row.try_get::<Option<BigDecimal>, _>(i)?, value::decimal),
            ColumnKind::Text => opt(row.try_get::<Option<String>, _>(i)?, Value::String),
            ColumnKind::Uuid => opt(row.try_get::<Option<uuid::Uuid>, _>(i)?, |u| {
                Value::String(u.to_string())
            }),
            ColumnKind::Json => row.try_get::<Option<Value>, _>(i)?.unwrap_or(Value::Null),
            ColumnKind::Bytes => opt(row.try_get::<Option<Vec<u8>>, _>(i)?, |b| value::bytes(&b)),
            ColumnKind::TimestampTz => opt(
                row.try_get::<Option<DateTime<Utc>>, _>(i)?,
                value::timestamp,
            ),
            ColumnKind::Timestamp => opt(
                row.try_get::<Option<NaiveDateTime>, _>(i)?,
                value::naive_timestamp,
            ),
            ColumnKind::Date => opt(row.try_get::<Option<NaiveDate>, _>(i)?, |d| {
                Value::String(d.to_string())
            }),
            ColumnKind::Time => opt(row.try_get::<Option<NaiveTime>, _>(i)?, |t| {
                Value::String(t.to_string())
            }),
            // postgres has no unsigned integers
            ColumnKind::UInt64 | ColumnKind::Unknown => Value::Null,
        };
        out.insert(col.name().to_string(), v);
    }
    Ok(out)
}

#[async_trait]
impl Executor for PostgresExecutor {
    async fn connect(&mut self) -> Result<(), BackendError> {
        let conn = PgConnection::connect_with(&self.options)
            .await
            .map_err(connect_failure)?;
        self.conn = Some(conn);
        Ok(())
    }

    async fn execute(
        &mut self,
        statement: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, BackendError> {
        let conn = self.conn.as_mut().ok_or_else(not_connected)?;
        let query = value::sql_params(params)
            .into_iter()
            .fold(sqlx::query(statement), bind_pg);
        let rows = query.fetch_all(&mut *conn).await.map_err(query_failure)?;
        rows.iter()
            .map(pg_row)
            .collect::<Result<_, _>>()
            .map_err(query_failure)
    }

    async fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                tracing::debug!(event = "executor.close_failed", driver = "postgres", error = %e);
            }
        }
    }
}

pub struct MySqlExecutor {
    options: MySqlConnectOptions,
    conn: Option<MySqlConnection>,
}

impl MySqlExecutor {
    pub fn new(options: MySqlConnectOptions) -> Self {
        Self {
            options: options.disable_statement_logging(),
            conn: None,
        }
    }

    pub(crate) fn from_params(p: &ConnParams<'_>) -> Result<Self, CapabilityError> {
        let options = MySqlConnectOptions::new()
            .host(&p.required("host")?)
            .port(p.port("port")?)
            .username(&p.required("user")?)
            .password(&p.secret("pass")?)
            .database(&p.required("db")?);
        Ok(Self::new(options))
    }
}

fn bind_mysql<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    param: SqlParam,
) -> Query<'q, MySql, MySqlArguments> {
    match param {
        SqlParam::Null => query.bind(None::<String>),
        SqlParam::Bool(b) => query.bind(b),
        SqlParam::Int(i) => query.bind(i),
        SqlParam::Float(f) => query.bind(f),
        SqlParam::Text(s) => query.bind(s),
    }
}

fn mysql_row(row: &MySqlRow) -> Result<Row, sqlx::Error> {
    let mut out = Row::new();
    for col in row.columns() {
        let i = col.ordinal();
        let v = match mysql_kind(col.type_info().name()) {
            ColumnKind::Bool => opt(row.try_get::<Option<bool>, _>(i)?, Value::Bool),
            ColumnKind::Int16 | ColumnKind::Int32 | ColumnKind::Int64 => {
                opt(row.try_get::<Option<i64>, _>(i)?, Value::from)
            }
            ColumnKind::UInt64 => opt(row.try_get::<Option<u64>, _>(i)?, Value::from),
            ColumnKind::Float32 => {
                opt(row.try_get::<Option<f32>, _>(i)?, |f| value::float(f.into()))
            }
            ColumnKind::Float64 => opt(row.try_get::<Option<f64>, _>(i)?, value::float),
            ColumnKind::Decimal => opt(row.try_get::<Option<BigDecimal>, _>(i)?, value::decimal),
            ColumnKind::Text => opt(row.try_get::<Option<String>, _>(i)?, Value::String),
            ColumnKind::Bytes => opt(row.try_get::<Option<Vec<u8>>, _>(i)?, |b| value::bytes(&b)),
            ColumnKind::Json => row.try_get::<Option<Value>, _>(i)?.unwrap_or(Value::Null),
            ColumnKind::TimestampTz => opt(
                row.try_get::<Option<DateTime<Utc>>, _>(i)?,
                value::timestamp,
            ),
            ColumnKind::Timestamp => opt(
                row.try_get::<Option<NaiveDateTime>, _>(i)?,
                value::naive_timestamp,
            ),
            ColumnKind::Date => opt(row.try_get::<Option<NaiveDate>, _>(i)?, |d| {
                Value::String(d.to_string())
            }),
            ColumnKind::Time => opt(row.try_get::<Option<NaiveTime>, _>(i)?, |t| {
                Value::String(t.to_string())
            }),
            ColumnKind::Uuid | ColumnKind::Unknown => Value::Null,
        };
        out.insert(col.name().to_string(), v);
    }
    Ok(out)
}

#[async_trait]
impl Executor for MySqlExecutor {
    async fn connect(&mut self) -> Result<(), BackendError> {
        let conn = MySqlConnection::connect_with(&self.options)
            .await
            .map_err(connect_failure)?;
        self.conn = Some(conn);
        Ok(())
    }

    async fn execute(
        &mut self,
        statement: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, BackendError> {
        let conn = self.conn.as_mut().ok_or_else(not_connected)?;
        let query = value::sql_params(params)
            .into_iter()
            .fold(sqlx::query(statement), bind_mysql);
        let rows = query.fetch_all(&mut *conn).await.map_err(query_failure)?;
        rows.iter()
            .map(mysql_row)
            .collect::<Result<_, _>>()
            .map_err(query_failure)
    }

    async fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                tracing::debug!(event = "executor.close_failed", driver = "mysql", error = %e);
            }
        }
    }
}
