use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Point chunk error: {0}")]
    Las(#[from] las::Error),

    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Chunk format error in {path}: {details}")]
    ChunkFormat { path: String, details: String },

    #[error("Event bus closed")]
    ChannelClosed,

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl ScanError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<C: Into<String>, M: Into<String>>(component: C, message: M) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn chunk_format<P: Into<String>, D: Into<String>>(path: P, details: D) -> Self {
        Self::ChunkFormat {
            path: path.into(),
            details: details.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
