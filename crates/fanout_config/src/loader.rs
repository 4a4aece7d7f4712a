use config::{Config, File, FileFormat};

use crate::error::ConfigError;
use crate::schema::FanoutConfig;
use crate::validation;

/// Load and validate a configuration document from `path`.
///
/// Returns `Err` on a missing file, malformed JSON, or a validation
/// failure, so the caller can treat a bad configuration as startup-fatal
/// rather than falling back to defaults.
pub fn load(path: &str) -> Result<FanoutConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    load_str(&raw, path)
}

/// Parse and validate a configuration document already read into memory.
/// Split out from `load` so callers that already hold the raw document
/// (e.g. a future in-memory config source) can validate it without a
/// filesystem round-trip.
pub fn load_str(raw: &str, path: &str) -> Result<FanoutConfig, ConfigError> {
    let parsed = Config::builder()
        .add_source(File::from_str(raw, FileFormat::Json))
        .build()
        .map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;

    let cfg: FanoutConfig = parsed.try_deserialize().map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })?;

    validation::validate(&cfg)?;
    Ok(cfg)
}
