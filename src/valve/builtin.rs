//! Valves shipped with the crate.
//!
//! [`register_builtins`] installs them into a [`ValveFactory`] under the
//! default module and mirrors them into the `"builtin"` module, so
//! descriptors may name either.

use std::any::Any;
use std::path::{Path, PathBuf};

use super::{PropertyError, Valve, parse_bool, parse_value};
use crate::factory::ValveFactory;

pub const BUILTIN_MODULE: &str = "builtin";

pub const ACCESS_LOG: &str = "builtin.AccessLogValve";
pub const REMOTE_ADDR: &str = "builtin.RemoteAddrValve";
pub const REQUEST_DUMPER: &str = "builtin.RequestDumperValve";
pub const ERROR_REPORT: &str = "builtin.ErrorReportValve";

/// Register every built-in valve in the default module and in [`BUILTIN_MODULE`].
pub fn register_builtins(factory: &mut ValveFactory) {
    for module in [None, Some(BUILTIN_MODULE)] {
        factory.register_with_path(module, ACCESS_LOG, |path| {
            Ok(Box::new(AccessLogValve::new(path)))
        });
        factory.register(module, REMOTE_ADDR, || Ok(Box::new(RemoteAddrValve::default())));
        factory.register(module, REQUEST_DUMPER, || {
            Ok(Box::new(RequestDumperValve::default()))
        });
        factory.register(module, ERROR_REPORT, || Ok(Box::new(ErrorReportValve::default())));
    }
}

// ── AccessLogValve ────────────────────────────────────────────────────────────

/// Writes one line per request to a log file. Requires a resolved file path.
#[derive(Debug, Clone)]
pub struct AccessLogValve {
    pub path: PathBuf,
    /// Log line pattern name (`"common"`, `"combined"`, or a custom format).
    pub pattern: String,
    pub prefix: String,
    pub suffix: String,
    pub enabled: bool,
    pub rotatable: bool,
}

impl AccessLogValve {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            pattern: "common".to_string(),
            prefix: String::new(),
            suffix: String::new(),
            enabled: true,
            rotatable: true,
        }
    }
}

impl Valve for AccessLogValve {
    fn class_name(&self) -> &str {
        ACCESS_LOG
    }

    fn set_property(&mut self, name: &str, value: &str) -> Result<(), PropertyError> {
        match name {
            "pattern" => {
                if value.trim().is_empty() {
                    return Err(PropertyError::invalid(name, value, "pattern must not be empty"));
                }
                self.pattern = value.to_string();
            }
            "prefix" => self.prefix = value.to_string(),
            "suffix" => self.suffix = value.to_string(),
            "enabled" => self.enabled = parse_bool(name, value)?,
            "rotatable" => self.rotatable = parse_bool(name, value)?,
            _ => return Err(PropertyError::unknown(name)),
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── RemoteAddrValve ───────────────────────────────────────────────────────────

/// Filters requests by client address prefix. Deny rules win over allow rules;
/// an empty allow list admits everything not denied.
#[derive(Debug, Clone)]
pub struct RemoteAddrValve {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub deny_status: u16,
}

impl Default for RemoteAddrValve {
    fn default() -> Self {
        Self {
            allow: Vec::new(),
            deny: Vec::new(),
            deny_status: 403,
        }
    }
}

impl RemoteAddrValve {
    pub fn is_allowed(&self, addr: &str) -> bool {
        if self.deny.iter().any(|p| addr.starts_with(p.as_str())) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|p| addr.starts_with(p.as_str()))
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Valve for RemoteAddrValve {
    fn class_name(&self) -> &str {
        REMOTE_ADDR
    }

    fn set_property(&mut self, name: &str, value: &str) -> Result<(), PropertyError> {
        match name {
            "allow" => self.allow = split_list(value),
            "deny" => self.deny = split_list(value),
            "deny_status" => {
                let status: u16 = parse_value(name, value)?;
                if !(400..600).contains(&status) {
                    return Err(PropertyError::invalid(name, value, "expected a 4xx or 5xx status"));
                }
                self.deny_status = status;
            }
            _ => return Err(PropertyError::unknown(name)),
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── RequestDumperValve ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RequestDumperValve {
    /// Upper bound on dumped body bytes; `0` dumps headers only.
    pub max_body_bytes: usize,
}

impl Valve for RequestDumperValve {
    fn class_name(&self) -> &str {
        REQUEST_DUMPER
    }

    fn set_property(&mut self, name: &str, value: &str) -> Result<(), PropertyError> {
        match name {
            "max_body_bytes" => self.max_body_bytes = parse_value(name, value)?,
            _ => return Err(PropertyError::unknown(name)),
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── ErrorReportValve ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ErrorReportValve {
    pub show_report: bool,
    pub show_server_info: bool,
}

impl Default for ErrorReportValve {
    fn default() -> Self {
        Self {
            show_report: true,
            show_server_info: true,
        }
    }
}

impl Valve for ErrorReportValve {
    fn class_name(&self) -> &str {
        ERROR_REPORT
    }

    fn set_property(&mut self, name: &str, value: &str) -> Result<(), PropertyError> {
        match name {
            "show_report" => self.show_report = parse_bool(name, value)?,
            "show_server_info" => self.show_server_info = parse_bool(name, value)?,
            _ => return Err(PropertyError::unknown(name)),
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
