//! On-demand SSR module system.
//!
//! - [`transform`]: raw source → executable code and dependency metadata
//! - [`executor`]: runs that code against a [`ModuleEnvironment`]
//! - [`loader`]: fetches, links and caches modules by URL
//! - [`cache`] / [`graph`]: memoized loads and reverse dependency edges

pub mod cache;
pub mod environment;
pub mod error;
pub mod executor;
pub mod exports;
pub mod graph;
pub mod loader;
pub mod package;
pub mod transform;

pub use cache::{EntryId, LoadResult, ModuleCache, ModuleStore, PendingLoad};
pub use environment::ModuleEnvironment;
pub use error::LoadError;
pub use executor::{ExecutionError, Executor, ModExecutor};
pub use exports::{Binding, BindingError, ExportCell, ModuleExports};
pub use graph::DependencyGraph;
pub use loader::{
    resolve_specifier, Imported, Importer, IncrementalLoader, Invalidation, LoadedModule,
    LoaderBuilder,
};
pub use package::{PackageRegistry, PackageResolver};
pub use transform::{BindingNames, DeclaredDep, ModTransform, Transform, TransformError, TransformOutput};
