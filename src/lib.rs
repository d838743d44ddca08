//! Valve host — installs pluggable valves into a running host pipeline and
//! keeps each one's lifecycle consistent across start/stop cycles and base
//! path changes.
//!
//! - **valve** — the handler contract and the built-in valves.
//! - **factory** — class-name → constructor registry, grouped by module.
//! - **path** — base path resolution and change callbacks.
//! - **host** — the pipeline valves are registered with.
//! - **service** — the per-valve lifecycle service.
//! - **supervisor** — owns the services and applies path reconfiguration.
//! - **config** / **logger** / **error** — ambient plumbing for the binary.

pub mod config;
pub mod error;
pub mod factory;
pub mod host;
pub mod logger;
pub mod path;
pub mod service;
pub mod supervisor;
pub mod valve;
