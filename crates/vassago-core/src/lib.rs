//! # Vassago Core
//!
//! Core types and traits for the Vassago knowledge pipeline.
//!
//! This crate provides the foundational abstractions shared by every Vassago component:
//! - The error taxonomy and its retry classification
//! - Identifiers for documents, chunks and organizations
//! - The `Document` and `Chunk` data model
//! - Pipeline stages used for failure attribution

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod document;
pub mod error;
pub mod types;

pub use document::{Chunk, Document, DocumentMetadata};
pub use error::{Error, Result};
pub use types::*;
