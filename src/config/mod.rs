//! The `config` module covers both kinds of configuration the dashboard has:
//!
//! - application `Settings`, layered from `config/default`, a `.env` file and
//!   `POPDASH__*` environment variables over built-in defaults
//! - broker `ConnectionConfig`s, with validation, redaction, saved profiles
//!   and the `ConnectionManager` that ties them to the shared session

pub mod connection;
pub mod manager;
pub mod profiles;
mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use connection::{
    AuthType, ConnectionConfig, ConnectionOptions, REDACTED, ValidationReport, sanitize, validate,
};
pub use manager::{ConnectionInfo, ConnectionManager, test_connection};
pub use profiles::{ProfileStore, SavedProfile};
pub use settings::{CardSettings, LoggingSettings, SessionSettings, Settings, StorageSettings};

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct
pub fn load_config() -> Result<Settings, ConfigError> {
    dotenvy::dotenv().ok();

    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("POPDASH")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}
