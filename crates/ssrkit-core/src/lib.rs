#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

//! Core of ssrkit: a development harness for a file-system routed,
//! server-rendering framework.
//!
//! The centrepiece is [`module::IncrementalLoader`], which fetches transformed
//! module source from a [`source::SourceServer`], executes it against an
//! injected module environment, caches the result per URL and invalidates the
//! cache transitively through the recorded import graph when files change.

pub mod config;
pub mod error;
pub mod module;
pub mod render;
pub mod routes;
pub mod source;
pub mod version;

pub use config::KitConfig;
pub use error::Error;
pub use module::{IncrementalLoader, LoadError, LoadedModule, ModuleExports};
pub use render::{render, LoadModule, RenderOptions, Rendered, Request};
pub use routes::{create_manifest_data, ManifestData};
pub use source::{FileChange, FileChangeKind, FsSourceServer, Mount, SourceServer};
pub use version::VERSION;
