//! Microsoft SQL Server executor over tiberius (TDS 7.3+).
//!
//! Statements use `@P1`, `@P2`, ... placeholders.

use super::params::ConnParams;
use super::value::{self, opt, SqlParam};
use super::Executor;
use crate::error::{BackendError, CapabilityError};
use crate::schema::Row;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat};
use serde_json::Value;
use tiberius::{AuthMethod, Client, ColumnData, Config, FromSql, Query};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

type MsSqlClient = Client<Compat<TcpStream>>;

fn connect_failure(e: impl std::fmt::Display) -> BackendError {
    BackendError::ConnectFailure(e.to_string())
}

pub struct MsSqlExecutor {
    config: Config,
    client: Option<MsSqlClient>,
}

impl MsSqlExecutor {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            client: None,
        }
    }

    pub(crate) fn from_params(p: &ConnParams<'_>) -> Result<Self, CapabilityError> {
        let mut config = Config::new();
        config.host(p.required("host")?);
        config.port(p.port("port")?);
        config.database(p.required("db")?);
        config.authentication(AuthMethod::sql_server(
            p.required("user")?,
            p.secret("pass")?,
        ));
        config.application_name("sealgate");
        if p.flag("trust_cert")? {
            config.trust_cert();
        }
        Ok(Self::new(config))
    }
}

fn bind(query: &mut Query<'_>, param: SqlParam) {
    match param {
        SqlParam::Null => query.bind(None::<String>),
        SqlParam::Bool(b) => query.bind(b),
        SqlParam::Int(i) => query.bind(i),
        SqlParam::Float(f) => query.bind(f),
        SqlParam::Text(s) => query.bind(s),
    }
}

fn column_value(data: &ColumnData<'static>) -> Result<Value, tiberius::error::Error> {
    let v = match data {
        ColumnData::Bit(v) => opt(*v, Value::Bool),
        ColumnData::U8(v) => opt(*v, Value::from),
        ColumnData::I16(v) => opt(*v, Value::from),
        ColumnData::I32(v) => opt(*v, Value::from),
        ColumnData::I64(v) => opt(*v, Value::from),
        ColumnData::F32(v) => opt(*v, |f| value::float(f.into())),
        ColumnData::F64(v) => opt(*v, value::float),
        ColumnData::String(v) => opt(v.as_ref(), |s| Value::String(s.to_string())),
        ColumnData::Guid(v) => opt(v.as_ref(), |u| Value::String(u.to_string())),
        ColumnData::Binary(v) => opt(v.as_ref(), |b| value::bytes(b)),
        ColumnData::Numeric(v) => opt(v.as_ref(), |n| Value::String(n.to_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            opt(NaiveDateTime::from_sql(data)?, value::naive_timestamp)
        }
        ColumnData::Date(_) => opt(NaiveDate::from_sql(data)?, |d| Value::String(d.to_string())),
        ColumnData::Time(_) => opt(NaiveTime::from_sql(data)?, |t| Value::String(t.to_string())),
        ColumnData::DateTimeOffset(_) => opt(DateTime::<FixedOffset>::from_sql(data)?, |dt| {
            Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }),
        _ => Value::Null,
    };
    Ok(v)
}

fn to_row(row: tiberius::Row) -> Result<Row, tiberius::error::Error> {
    let names: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let mut out = Row::new();
    for (name, data) in names.into_iter().zip(row.into_iter()) {
        out.insert(name, column_value(&data)?);
    }
    Ok(out)
}

#[async_trait]
impl Executor for MsSqlExecutor {
    async fn connect(&mut self) -> Result<(), BackendError> {
        let tcp = TcpStream::connect(self.config.get_addr())
            .await
            .map_err(connect_failure)?;
        tcp.set_nodelay(true).map_err(connect_failure)?;
        let client = Client::connect(self.config.clone(), tcp.compat_write())
            .await
            .map_err(connect_failure)?;
        self.client = Some(client);
        Ok(())
    }

    async fn execute(
        &mut self,
        statement: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, BackendError> {
        let query_failure = |e: tiberius::error::Error| BackendError::QueryFailure(e.to_string());
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| BackendError::ConnectFailure("not connected".to_string()))?;

        let mut query = Query::new(statement.to_string());
        for param in value::sql_params(params) {
            bind(&mut query, param);
        }

        let rows = query
            .query(client)
            .await
            .map_err(query_failure)?
            .into_first_result()
            .await
            .map_err(query_failure)?;
        rows.into_iter()
            .map(to_row)
            .collect::<Result<_, _>>()
            .map_err(query_failure)
    }

    async fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.close().await {
                tracing::debug!(event = "executor.close_failed", driver = "mssql", error = %e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::DriverName;
    use super::*;
    use serde_json::json;
    use std::borrow::Cow;
    use std::collections::BTreeMap;

    #[test]
    fn test_from_params_builds_address() {
        let map: BTreeMap<String, Value> = serde_json::from_value(json!({
            "host": "sql.internal", "port": 1433, "user": "sa", "pass": "pw", "db": "app",
            "trust_cert": "true"
        }))
        .unwrap();
        let exec = MsSqlExecutor::from_params(&ConnParams::new(DriverName::MsSql, &map)).unwrap();

        assert_eq!(exec.config.get_addr(), "sql.internal:1433");
    }

    #[test]
    fn test_column_value_mapping() {
        assert_eq!(column_value(&ColumnData::I32(Some(7))).unwrap(), json!(7));
        assert_eq!(column_value(&ColumnData::I32(None)).unwrap(), Value::Null);
        assert_eq!(column_value(&ColumnData::Bit(Some(true))).unwrap(), json!(true));
        assert_eq!(
            column_value(&ColumnData::String(Some(Cow::Borrowed("x")))).unwrap(),
            json!("x")
        );
        assert_eq!(
            column_value(&ColumnData::Binary(Some(Cow::Borrowed(b"hi".as_slice())))).unwrap(),
            json!("aGk=")
        );
    }
}
