pub mod trade_stream;

pub use trade_stream::{spawn_price_feed, FeedSettings};
