//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` (or an explicit path), follows any
//! `[meta] base = "..."` inheritance chain, then applies
//! `VALVE_HOST_WORK_DIR` and `VALVE_HOST_LOG_LEVEL` overrides.
//!
//! ```toml
//! [host]
//! name = "localhost"
//! work_dir = "~/.valve-host"
//! log_level = "info"
//!
//! [paths]
//! "host.log.dir" = "log"            # relative bases live under work_dir
//!
//! [[valve]]
//! name = "access-log"
//! class = "builtin.AccessLogValve"
//! path = "access.log"
//! relative_to = "host.log.dir"
//!
//! [valve.params]
//! pattern = "combined"
//! ```

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::AppError;
use crate::logger;
use crate::service::ServiceDescriptor;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Base path name that always resolves to the host work directory.
pub const WORK_DIR_BASE: &str = "host.work.dir";

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub name: String,
    /// Already expanded, no `~`.
    pub work_dir: PathBuf,
    pub log_level: String,
}

/// Fully-resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: HostConfig,
    /// Named base paths in declaration order, absolute. Always includes
    /// [`WORK_DIR_BASE`].
    pub paths: Vec<(String, PathBuf)>,
    /// One descriptor per `[[valve]]`, in file order.
    pub valves: Vec<ServiceDescriptor>,
    /// File the configuration was read from.
    pub source: PathBuf,
}

// ── raw TOML shape ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    host: RawHost,
    #[serde(default)]
    paths: toml::Table,
    #[serde(default, rename = "valve")]
    valves: Vec<RawValve>,
}

#[derive(Deserialize)]
struct RawHost {
    #[serde(default = "default_host_name")]
    name: String,
    #[serde(default = "default_work_dir")]
    work_dir: String,
    #[serde(default = "default_log_level")]
    log_level: String,
}

impl Default for RawHost {
    fn default() -> Self {
        Self {
            name: default_host_name(),
            work_dir: default_work_dir(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Deserialize)]
struct RawValve {
    name: String,
    class: String,
    #[serde(default)]
    module: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    relative_to: Option<String>,
    /// Scalars only; order preserved.
    #[serde(default)]
    params: toml::Table,
}

fn default_host_name() -> String {
    "localhost".to_string()
}

fn default_work_dir() -> String {
    "~/.valve-host".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── loading ───────────────────────────────────────────────────────────────────

/// Deep-merge two TOML values. Tables merge recursively and keep the base's
/// key order; any other overlay value (arrays included) replaces the base.
fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, ov_val) in overlay_tbl {
                match base_tbl.get_mut(&key) {
                    Some(slot) => {
                        let base_val = std::mem::replace(slot, toml::Value::Boolean(false));
                        *slot = merge_toml(base_val, ov_val);
                    }
                    None => {
                        base_tbl.insert(key, ov_val);
                    }
                }
            }
            toml::Value::Table(base_tbl)
        }
        (_, overlay) => overlay,
    }
}

/// Read `path`, follow its `[meta] base` chain and return the merged value.
/// `visited` holds canonical paths already seen so cycles are reported.
fn load_raw_merged(path: &Path, visited: &mut HashSet<PathBuf>) -> Result<toml::Value, AppError> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(canonical) {
        return Err(AppError::Config(format!(
            "circular base reference detected at: {}",
            path.display()
        )));
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let mut overlay: toml::Value = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let base_ref = overlay
        .get("meta")
        .and_then(|m| m.get("base"))
        .and_then(|b| b.as_str())
        .map(str::to_string);

    if let toml::Value::Table(tbl) = &mut overlay {
        tbl.remove("meta");
    }

    match base_ref {
        Some(base) => {
            let base_path = path.parent().unwrap_or(Path::new(".")).join(base);
            let base_val = load_raw_merged(&base_path, visited)?;
            Ok(merge_toml(base_val, overlay))
        }
        None => Ok(overlay),
    }
}

/// Load the config from `path` (default [`DEFAULT_CONFIG_PATH`]) with env
/// overrides applied.
pub fn load(path: Option<&str>) -> Result<Config, AppError> {
    load_path(Path::new(path.unwrap_or(DEFAULT_CONFIG_PATH)))
}

/// Same as [`load`] for an already known file, e.g. [`Config::source`] when
/// re-reading on SIGHUP.
pub fn load_path(path: &Path) -> Result<Config, AppError> {
    let work_dir_override = env::var("VALVE_HOST_WORK_DIR").ok();
    let log_level_override = env::var("VALVE_HOST_LOG_LEVEL").ok();
    load_from(
        path,
        work_dir_override.as_deref(),
        log_level_override.as_deref(),
    )
}

/// Loader with explicit overrides. Tests pass overrides here instead of
/// mutating the environment.
pub fn load_from(
    path: &Path,
    work_dir_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, AppError> {
    let merged = load_raw_merged(path, &mut HashSet::new())?;
    let parsed: RawConfig = merged
        .try_into()
        .map_err(|e| AppError::Config(format!("invalid config in {}: {e}", path.display())))?;

    let work_dir = expand_home(work_dir_override.unwrap_or(&parsed.host.work_dir));
    let log_level = log_level_override
        .unwrap_or(&parsed.host.log_level)
        .to_string();
    logger::parse_level(&log_level)
        .map_err(|e| AppError::Config(format!("host.log_level in {}: {e}", path.display())))?;

    let paths = resolve_bases(&parsed.paths, &work_dir)?;
    let valves = resolve_valves(parsed.valves)?;

    Ok(Config {
        host: HostConfig {
            name: parsed.host.name,
            work_dir,
            log_level,
        },
        paths,
        valves,
        source: path.to_path_buf(),
    })
}

fn resolve_bases(raw: &toml::Table, work_dir: &Path) -> Result<Vec<(String, PathBuf)>, AppError> {
    let mut bases = vec![(WORK_DIR_BASE.to_string(), work_dir.to_path_buf())];
    for (name, value) in raw {
        let Some(s) = value.as_str() else {
            return Err(AppError::Config(format!("paths.{name} must be a string")));
        };
        let expanded = expand_home(s);
        let absolute = if expanded.is_absolute() {
            expanded
        } else {
            work_dir.join(expanded)
        };
        match bases.iter_mut().find(|(n, _)| n.as_str() == name.as_str()) {
            Some(slot) => slot.1 = absolute,
            None => bases.push((name.clone(), absolute)),
        }
    }
    Ok(bases)
}

fn resolve_valves(raw: Vec<RawValve>) -> Result<Vec<ServiceDescriptor>, AppError> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());

    for v in raw {
        if v.name.trim().is_empty() {
            return Err(AppError::Config("valve name must not be empty".into()));
        }
        if !seen.insert(v.name.clone()) {
            return Err(AppError::Config(format!("duplicate valve name: {}", v.name)));
        }
        if v.class.trim().is_empty() {
            return Err(AppError::Config(format!("valve '{}': class must not be empty", v.name)));
        }
        if v.relative_to.is_some() && v.path.is_none() {
            return Err(AppError::Config(format!(
                "valve '{}': relative_to requires path",
                v.name
            )));
        }

        let mut params = Vec::with_capacity(v.params.len());
        for (key, value) in v.params {
            let value = param_string(&value).ok_or_else(|| {
                AppError::Config(format!(
                    "valve '{}': param '{key}' must be a string, number or boolean",
                    v.name
                ))
            })?;
            params.push((key, value));
        }

        out.push(ServiceDescriptor {
            name: v.name,
            class_name: v.class,
            module: v.module,
            file_path: v.path,
            file_relative_to: v.relative_to,
            params,
        });
    }
    Ok(out)
}

fn param_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => None,
    }
}

/// Expand a leading `~` to the user's home directory.
/// Anything else is returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    if path == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home;
    }
    PathBuf::from(path)
}
