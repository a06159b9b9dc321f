//! # Vassago Server
//!
//! HTTP API for document ingestion and organization-scoped question answering.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod server;

pub use api::{ApiError, ErrorResponse};
pub use server::{AppState, Server, ServerConfig};
