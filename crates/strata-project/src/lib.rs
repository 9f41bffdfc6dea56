//! Strata Project
//!
//! Definition loading: the project file, installed packages, model, test and
//! schema files, and generic test generation.

pub mod definition;
pub mod error;
pub mod loader;
pub mod schema_file;

pub use definition::{ColumnSpec, Definition, SourceSpec, TestSpec};
pub use error::LoadError;
pub use generic_tests::{GenericTest, TestParent};
pub use loader::{LoadedProject, Loader, Package};
pub use schema_file::{ColumnEntry, ColumnTest, ModelPatch, SchemaFile, SourceEntry, SourceTable};
