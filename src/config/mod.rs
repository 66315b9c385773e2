mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{BrokerSettings, LoggingSettings, Settings};

/// Prefix of environment variables read by [`load_config`], e.g.
/// `TOPICBUS__BROKER__QUEUE_CAPACITY=64`.
pub const ENV_PREFIX: &str = "TOPICBUS";

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct containing the broker and logging configurations
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(environment());

    finish(builder.build()?)
}

/// Loads the configuration from an explicit file, then environment variables.
///
/// Unlike [`load_config`] the file is required.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::from(path.as_ref()).required(true))
        .add_source(environment());

    finish(builder.build()?)
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
}

fn finish(config: Config) -> Result<Settings, ConfigError> {
    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;
    let settings = partial.merge_with_defaults();

    if settings.broker.queue_capacity == 0 {
        return Err(ConfigError::Message(
            "broker.queue_capacity must be greater than zero".to_string(),
        ));
    }

    Ok(settings)
}

#[cfg(test)]
mod tests;
