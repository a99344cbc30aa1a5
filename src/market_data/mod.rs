pub mod aggregator;
pub mod candle;
pub mod error;
pub mod heikin_ashi;
pub mod interval_buffer;
pub mod stream;

// Re-export the core pipeline types for convenient access
// (e.g. `use crate::market_data::Aggregator`).
pub use aggregator::Aggregator;
pub use candle::{Candle, CandleKey, DeltaEvent};
pub use error::FeedError;
pub use stream::{StreamCommand, StreamHealth, StreamHealthFlag, StreamSubscriber};
