use std::any::Any;
use thiserror::Error;

/// Failure kinds reported for a feed or image request.
///
/// Every variant carries a rendered message rather than the source error so the
/// value can be cloned and handed to every caller waiting on the same key.
/// All variants are terminal for the request that produced them; nothing in
/// this crate retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// Connection, DNS, TLS or timeout failure while talking to the server
    #[error("Network error: {0}")]
    Network(String),
    /// The body is not a well-formed RSS document
    #[error("Feed format error: {0}")]
    Format(String),
    /// The byte stream failed while it was being read
    #[error("I/O error: {0}")]
    Io(String),
    /// Image bytes could not be decoded
    #[error("Image decode error: {0}")]
    Decode(String),
}

/// Discriminant of [`FeedError`] for consumers that only branch on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Format,
    Io,
    Decode,
}

impl FeedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FeedError::Network(_) => ErrorKind::Network,
            FeedError::Format(_) => ErrorKind::Format,
            FeedError::Io(_) => ErrorKind::Io,
            FeedError::Decode(_) => ErrorKind::Decode,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            FeedError::Network(m)
            | FeedError::Format(m)
            | FeedError::Io(m)
            | FeedError::Decode(m) => m,
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FeedError::Network(format!("request timed out: {e}"))
        } else {
            FeedError::Network(e.to_string())
        }
    }
}

impl From<quick_xml::Error> for FeedError {
    fn from(e: quick_xml::Error) -> Self {
        match e {
            // The reader under the parser failed, not the markup
            quick_xml::Error::Io(io) => FeedError::Io(io.to_string()),
            other => FeedError::Format(other.to_string()),
        }
    }
}

impl From<std::io::Error> for FeedError {
    fn from(e: std::io::Error) -> Self {
        FeedError::Io(e.to_string())
    }
}

impl From<image::ImageError> for FeedError {
    fn from(e: image::ImageError) -> Self {
        match e {
            image::ImageError::IoError(io) => FeedError::Io(io.to_string()),
            other => FeedError::Decode(other.to_string()),
        }
    }
}

/// Renders a caught panic payload for an error message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
