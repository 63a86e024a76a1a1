//! Core library for mockwire: a mock gRPC/Connect server driven by
//! user-supplied `.proto` schemas and per-method YAML/JSON rule files.
//!
//! The pipeline, leaves first: [`schema`] loads protos into a dynamic
//! descriptor registry, [`rules`] indexes rule documents by
//! `package.service.method`, [`validation`] compiles PGV/protovalidate
//! annotations into an IR, [`handler`] runs the shared
//! validate -> match -> select -> render pipeline, and [`server`] exposes it
//! over native gRPC (plaintext and TLS), Connect, and gRPC-Web. [`reload`]
//! rebuilds everything atomically on file-system change.

pub mod codec;
pub mod config;
pub mod error;
pub mod format;
pub mod handler;
pub mod metadata;
pub mod metrics;
pub mod reload;
pub mod report;
pub mod rules;
pub mod schema;
pub mod server;
pub mod state;
pub mod status;
pub mod template;
pub mod validation;

pub use error::{MockwireError, Result};
