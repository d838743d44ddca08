//! Valve contract — the pluggable handler installed into the host pipeline.
//!
//! A valve is opaque to the lifecycle service except for two capabilities:
//! it can be configured by named string properties, and it can be handed to a
//! [`HostServer`](crate::host::HostServer). Configuration goes through an
//! explicit per-type [`Valve::set_property`] implementation instead of any
//! reflection mechanism.

pub mod builtin;

use std::any::Any;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A handler that can be installed into the host server's processing chain.
///
/// Implementations must be `Send + Sync` so the live instance can be shared
/// with readers through [`ValveService::current_handler`](crate::service::ValveService::current_handler).
pub trait Valve: Any + Send + Sync + fmt::Debug {
    /// Class identifier this instance was created from (e.g. `"builtin.AccessLogValve"`).
    fn class_name(&self) -> &str;

    /// Assign a single named property from its string form.
    ///
    /// Called once per configured property, in declaration order, before the
    /// valve is registered. Unknown names and unparseable values must be
    /// reported, not ignored.
    fn set_property(&mut self, name: &str, value: &str) -> Result<(), PropertyError>;

    /// Downcast support for callers that know the concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// Why a property could not be applied to a valve.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PropertyError {
    #[error("no settable property named '{name}'")]
    Unknown { name: String },

    #[error("invalid value '{value}' for property '{name}': {reason}")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

impl PropertyError {
    pub fn unknown(name: &str) -> Self {
        Self::Unknown {
            name: name.to_string(),
        }
    }

    pub fn invalid(name: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name: name.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Parse a boolean property. Accepts `true/yes/on` and `false/no/off`,
/// case-insensitively.
pub fn parse_bool(name: &str, value: &str) -> Result<bool, PropertyError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => Ok(true),
        "false" | "no" | "off" => Ok(false),
        _ => Err(PropertyError::invalid(name, value, "expected a boolean")),
    }
}

/// Parse any `FromStr` property (integers, mostly).
pub fn parse_value<T>(name: &str, value: &str) -> Result<T, PropertyError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| PropertyError::invalid(name, value, e.to_string()))
}
