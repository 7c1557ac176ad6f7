//! Configuration errors shared by the workspace

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_names_the_problem() {
        let err = Error::Config("pool.keys must not be empty".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: pool.keys must not be empty"
        );
    }

    #[test]
    fn io_error_converts() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.to_string().starts_with("I/O error:"), "got: {err}");
    }

    #[test]
    fn toml_error_converts() {
        let parsed: std::result::Result<toml::Table, _> = toml::from_str("= broken");
        let err: Error = parsed.unwrap_err().into();
        assert!(matches!(err, Error::Toml(_)));
    }
}
