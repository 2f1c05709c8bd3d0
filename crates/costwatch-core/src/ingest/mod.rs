//! Billing feed ingestion

mod feed;

pub use feed::{FeedClient, FeedPage, FeedSync};
