//! Keyed cache of decoded feeds and thumbnails.
//!
//! [`ResultCache`] decides per key whether to answer from memory or run one
//! fetch-and-decode cycle, and shares that cycle with every concurrent
//! caller of the same key.

mod coordinator;
mod thumbnail;

pub use coordinator::ResultCache;
pub use thumbnail::{decode_image, DecodedImage};
