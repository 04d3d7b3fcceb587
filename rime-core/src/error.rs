use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("resolve: {0}")]
    Resolve(String),
    #[error("config: {0}")]
    Config(String),
}

impl Error {
    pub fn resolve(msg: impl Into<String>) -> Self {
        Self::Resolve(msg.into())
    }
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
