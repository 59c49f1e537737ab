//! Backend executors and the driver dispatcher.
//!
//! Every backend implements [`Executor`] (connect, execute, disconnect).
//! [`ExecutorDispatcher`] resolves a [`ConnectionDescriptor`] onto exactly
//! one executor through the closed [`DriverName`] set and runs a single
//! request/response cycle against it. There is no pooling: each call
//! connects, runs one statement and disconnects.

mod cql;
mod mssql;
mod params;
mod sql;
mod value;

pub use cql::CqlExecutor;
pub use mssql::MsSqlExecutor;
pub use sql::{MySqlExecutor, PostgresExecutor};

use crate::error::{BackendError, CapabilityError};
use crate::schema::{ConnectionDescriptor, ExecutionResult, Row};
use async_trait::async_trait;
use params::ConnParams;
use serde_json::Value;
use std::fmt;

/// Registered backend drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverName {
    Postgres,
    CockroachDb,
    MySql,
    MsSql,
    Cassandra,
    Scylla,
}

impl DriverName {
    pub const ALL: [DriverName; 6] = [
        DriverName::Postgres,
        DriverName::CockroachDb,
        DriverName::MySql,
        DriverName::MsSql,
        DriverName::Cassandra,
        DriverName::Scylla,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::CockroachDb => "cockroachdb",
            Self::MySql => "mysql",
            Self::MsSql => "mssql",
            Self::Cassandra => "cassandra",
            Self::Scylla => "scylla",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.as_str() == name)
    }

    /// Like [`DriverName::parse`], failing with `UnsupportedDriver`.
    pub fn resolve(name: &str) -> Result<Self, CapabilityError> {
        Self::parse(name).ok_or_else(|| CapabilityError::UnsupportedDriver {
            driver: name.to_string(),
        })
    }
}

impl fmt::Display for DriverName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One backend connection, used for exactly one statement.
#[async_trait]
pub trait Executor: Send {
    async fn connect(&mut self) -> Result<(), BackendError>;

    async fn execute(&mut self, statement: &str, params: &[Value])
        -> Result<Vec<Row>, BackendError>;

    /// Release the connection. Must be safe to call when not connected.
    async fn disconnect(&mut self);
}

/// Runs authorized statements. The seam between the redemption protocol
/// and the backends; tests substitute a recording implementation.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    /// Resolve the driver and parse its connection parameters without
    /// touching the network.
    fn check(&self, connection: &ConnectionDescriptor) -> Result<(), CapabilityError>;

    /// One request/response cycle. `Err` only for resolution failures;
    /// backend failures come back inside the result.
    async fn execute(
        &self,
        connection: &ConnectionDescriptor,
        statement: &str,
        params: &[Value],
    ) -> Result<ExecutionResult, CapabilityError>;
}

/// Dispatcher over the built-in executors.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutorDispatcher;

impl ExecutorDispatcher {
    fn build(
        &self,
        connection: &ConnectionDescriptor,
    ) -> Result<(DriverName, Box<dyn Executor>), CapabilityError> {
        let driver = DriverName::resolve(&connection.driver_name)?;
        let params = ConnParams::new(driver, &connection.params);
        let executor: Box<dyn Executor> = match driver {
            DriverName::Postgres | DriverName::CockroachDb => {
                Box::new(PostgresExecutor::from_params(&params)?)
            }
            DriverName::MySql => Box::new(MySqlExecutor::from_params(&params)?),
            DriverName::MsSql => Box::new(MsSqlExecutor::from_params(&params)?),
            DriverName::Cassandra | DriverName::Scylla => {
                Box::new(CqlExecutor::from_params(&params)?)
            }
        };
        Ok((driver, executor))
    }
}

#[async_trait]
impl Dispatch for ExecutorDispatcher {
    fn check(&self, connection: &ConnectionDescriptor) -> Result<(), CapabilityError> {
        self.build(connection).map(|_| ())
    }

    async fn execute(
        &self,
        connection: &ConnectionDescriptor,
        statement: &str,
        params: &[Value],
    ) -> Result<ExecutionResult, CapabilityError> {
        let (driver, mut executor) = self.build(connection)?;
        let result = run_cycle(executor.as_mut(), statement, params).await;

        if let Some(err) = &result.error {
            tracing::warn!(
                event = "dispatch.backend_error",
                driver = %driver,
                kind = ?err.kind,
            );
        } else {
            tracing::debug!(
                event = "dispatch.completed",
                driver = %driver,
                rows = result.rows.len(),
            );
        }
        Ok(result)
    }
}

/// Connect, execute, and always disconnect.
pub async fn run_cycle(
    executor: &mut dyn Executor,
    statement: &str,
    params: &[Value],
) -> ExecutionResult {
    let outcome = match executor.connect().await {
        Ok(()) => executor.execute(statement, params).await,
        Err(e) => Err(e),
    };
    executor.disconnect().await;

    match outcome {
        Ok(rows) => ExecutionResult::from_rows(rows),
        Err(e) => ExecutionResult::failed(e),
    }
}
