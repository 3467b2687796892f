//! # inkflow-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`InkflowSettings::default()`]
//! 2. **User file**: `~/.inkflow/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `INKFLOW_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, inkflow_home, load_settings, load_settings_from_path, resolve_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<InkflowSettings> = OnceLock::new();

/// Get the global settings instance, loading it on first access. Falls back
/// to compiled defaults if loading fails.
pub fn get_settings() -> &'static InkflowSettings {
    SETTINGS.get_or_init(|| match load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            InkflowSettings::default()
        }
    })
}

/// Initialize the global settings with a specific value.
///
/// Returns the provided settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: InkflowSettings) -> std::result::Result<(), InkflowSettings> {
    SETTINGS.set(settings)
}
