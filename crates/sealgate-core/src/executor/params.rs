//! Typed access to `connection.params`.

use super::DriverName;
use crate::error::CapabilityError;
use serde_json::Value;
use std::collections::BTreeMap;

pub(crate) struct ConnParams<'a> {
    driver: DriverName,
    params: &'a BTreeMap<String, Value>,
}

impl<'a> ConnParams<'a> {
    pub(crate) fn new(driver: DriverName, params: &'a BTreeMap<String, Value>) -> Self {
        Self { driver, params }
    }

    pub(crate) fn driver(&self) -> DriverName {
        self.driver
    }

    pub(crate) fn invalid(&self, reason: impl Into<String>) -> CapabilityError {
        CapabilityError::InvalidConnectionParams {
            driver: self.driver.to_string(),
            reason: reason.into(),
        }
    }

    /// Strings as-is, numbers and booleans by their JSON text.
    fn scalar(&self, name: &str) -> Result<Option<String>, CapabilityError> {
        match self.params.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(v @ (Value::Number(_) | Value::Bool(_))) => Ok(Some(v.to_string())),
            Some(_) => Err(self.invalid(format!("{name} must be a string"))),
        }
    }

    /// Present and non-empty.
    pub(crate) fn required(&self, name: &str) -> Result<String, CapabilityError> {
        match self.scalar(name)? {
            Some(s) if !s.trim().is_empty() => Ok(s),
            _ => Err(self.invalid(format!("missing {name}"))),
        }
    }

    /// Present; may be empty (passwords).
    pub(crate) fn secret(&self, name: &str) -> Result<String, CapabilityError> {
        self.scalar(name)?
            .ok_or_else(|| self.invalid(format!("missing {name}")))
    }

    pub(crate) fn optional(&self, name: &str) -> Result<Option<String>, CapabilityError> {
        Ok(self.scalar(name)?.filter(|s| !s.trim().is_empty()))
    }

    pub(crate) fn port(&self, name: &str) -> Result<u16, CapabilityError> {
        let raw = self.required(name)?;
        match raw.trim().parse::<u16>() {
            Ok(port) if port > 0 => Ok(port),
            _ => Err(self.invalid(format!("{name} must be a port number"))),
        }
    }

    pub(crate) fn flag(&self, name: &str) -> Result<bool, CapabilityError> {
        match self.optional(name)? {
            None => Ok(false),
            Some(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                _ => Err(self.invalid(format!("{name} must be a boolean"))),
            },
        }
    }
}
