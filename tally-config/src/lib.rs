//! Configuration loading for Tally.
//!
//! Settings come from an optional TOML or JSON file, an optional `.env`
//! file and `TALLY_*` environment variables, in increasing precedence. The
//! composed [`Config`] is validated before it is handed to the server, and
//! soft findings are returned as [`ConfigWarnings`].

pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    Config, ConfigMetadata, ConfigSource, DatabaseConfig, RedisConfig, ServiceConfig,
    TenantConfig,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
