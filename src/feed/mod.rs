//! Feed retrieval and decoding.
//!
//! - `fetcher`: the [`Fetcher`] trait and its `reqwest` implementation
//! - `parser`: streaming RSS parser producing [`FeedItems`]
//! - `item`: the decoded post record

mod fetcher;
mod item;
mod parser;

pub use fetcher::{Fetcher, HttpFetcher};
pub use item::{FeedItem, FeedItems};
pub use parser::parse_feed;
