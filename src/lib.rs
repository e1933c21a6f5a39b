//! Secret Injection Agent Library
//!
//! Core functionality for the secret injection agent: annotation parsing,
//! vault record resolution, output rendering, Kubernetes Secret mirroring,
//! and the rotation loop that keeps injected secrets current.
//!
//! Unit tests live in the module files; the end-to-end paths are covered by
//! the integration suites under `tests/`.

pub mod cache;
pub mod config;
pub mod constants;
pub mod error;
pub mod mirror;
pub mod notation;
pub mod notify;
pub mod output;
pub mod render;
pub mod rotation;
pub mod server;
pub mod vault;

pub use error::InjectionError;
