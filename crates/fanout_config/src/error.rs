/// Errors surfaced while loading or validating a configuration document.
/// Fatal at startup; ignored (keeping the prior configuration) on
/// hot-reload.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {path} is not valid JSON: {source}")]
    Parse {
        path: String,
        #[source]
        source: config::ConfigError,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
