//! # iterlink-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`SyncSettings::default()`]
//! 2. **User file**: `~/.iterlink/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `ITERLINK_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, iterlink_dir, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::*;
