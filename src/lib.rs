//! tidewatch: a daemon that holds one persistent MQTT session open
//!
//! The session itself lives in the `tidewatch-mqtt` crate. This crate adds what a
//! long-running service needs around it:
//!
//! * `config`: TOML configuration (logger, transport and daemon sections), located
//!   through `TIDEWATCH_CONFIG` or `/etc/tidewatch/config.toml` and validated with
//!   `validator`.
//!
//! * `logger`: `tracing` subscriber setup with console output (compact, pretty,
//!   JSON) and optional systemd journald integration.

pub mod config;
pub mod logger;
