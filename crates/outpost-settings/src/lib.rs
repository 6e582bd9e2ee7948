//! # outpost-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`OutpostSettings::default()`]
//! 2. **User file**: `~/.outpost/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `OUTPOST_*` overrides (highest priority)
//!
//! Settings are read-only input to the engine; nothing here writes back.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
