//! `datagen-generator`: random test-data generation and export rendering.
//!
//! The scheduler only depends on the [`DataGenerator`] trait; the
//! [`BuiltinGenerator`] is the default implementation used by the server.

pub mod error;
pub mod export;
pub mod generator;

pub use error::{GenerateError, Result};
pub use export::render;
pub use generator::{BuiltinGenerator, DataGenerator};
