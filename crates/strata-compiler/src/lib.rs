//! Compile pipeline for strata projects
//!
//! Glues the loader, the template resolver and the graph builder together:
//!
//! ```rust,ignore
//! use strata_compiler::{compile, CompileOptions};
//!
//! let compilation = compile(&CompileOptions::new("path/to/project"))?;
//! compilation.manifest.write_to_file(Path::new("target/manifest.json"))?;
//! ```
//!
//! Every node-level problem ends up in one report; a compile only stops
//! early on a dependency cycle.

pub mod error;
pub mod options;
pub mod pipeline;
pub mod relations;

pub use error::{CompileError, CompileFailure};
pub use options::{parse_vars, CompileOptions};
pub use pipeline::{compile, compile_project, Compilation};
