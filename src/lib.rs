//! Fetches a blog's media-RSS feed, parses it into posts, and keeps the
//! decoded feed and its thumbnails in memory.
//!
//! The display layer talks to a [`Session`]: every request returns an id and
//! later yields exactly one [`SessionEvent`]. Under it, [`ResultCache`]
//! answers from memory or runs one fetch-and-decode cycle per key.

pub mod cache;
pub mod config;
pub mod error;
pub mod feed;
pub mod session;

pub use cache::{decode_image, DecodedImage, ResultCache};
pub use config::{Config, ConfigError};
pub use error::{ErrorKind, FeedError};
pub use feed::{parse_feed, FeedItem, FeedItems, Fetcher, HttpFetcher};
pub use session::{Connectivity, NetworkFlag, Session, SessionEvent};
