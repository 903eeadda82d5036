use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// The isolation unit could not be created.
    #[error("failed to create isolated runtime: {0}")]
    Setup(String),

    /// A configuration value could not be parsed.
    #[error("invalid configuration `{key}`: {reason}")]
    Config { key: &'static str, reason: String },

    /// A message crossing the isolation boundary failed schema validation.
    #[error("protocol fault: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Setup(value.to_string())
    }
}
