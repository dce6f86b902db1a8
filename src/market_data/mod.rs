pub mod candles;
pub mod depth_stream;
pub mod kline_stream;

// Re-export the core market-data types (e.g. `use crate::market_data::Candle`).
pub use candles::{parse_str_f64, Candle, CandleKey};
