//! pkgproxy: a caching reverse proxy for package and artifact mirrors.

pub mod admin;
pub mod cache;
pub mod config;
pub mod proxy;
pub mod reload;
pub mod telemetry;
