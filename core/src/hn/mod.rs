//! Reference data source: the Hacker News item API.
//!
//! Items occupy a dense, monotonically assigned id space `[1, maxitem]`,
//! which is what makes the range-sweep downloader work: every id is either
//! an item or a `null` tombstone, so a fetched range is fetched forever.

mod client;
mod downloader;
mod source;

pub use client::HnClient;
pub use source::HackerNewsSource;

/// Public Hacker News API, version 0.
pub const DEFAULT_BASE_URL: &str = "https://hacker-news.firebaseio.com/v0";

/// Metadata key recording the highest remote id observed.
pub(crate) const META_MAX_ID: &str = "max_id";
