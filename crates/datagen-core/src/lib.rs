//! `datagen-core`: configuration, errors and generation types shared by
//! every datagen crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::DatagenConfig;
pub use error::{DatagenError, Result};
pub use types::{ExportFormat, FieldSpec, Row};
