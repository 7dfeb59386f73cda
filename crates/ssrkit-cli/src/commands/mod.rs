pub mod dev;
pub mod routes;
pub mod version;

use miette::{IntoDiagnostic, Result};
use ssrkit_core::config::load_config;
use ssrkit_core::KitConfig;
use std::path::Path;
use tracing::debug;

/// Load and validate the project config, falling back to defaults when the
/// project has no config file.
pub fn project_config(root: &Path, config: Option<&Path>) -> Result<KitConfig> {
    let config = match load_config(root, config).into_diagnostic()? {
        Some((path, config)) => {
            debug!(path = %path.display(), "Loaded config");
            config
        }
        None => KitConfig::default(),
    };
    config.validate().into_diagnostic()?;
    Ok(config)
}
