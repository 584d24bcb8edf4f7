pub mod aggregator;
pub mod kline_stream;

pub use aggregator::SymbolAggregator;
pub use kline_stream::{FeedConnector, TungsteniteTransport};
