pub mod broadcast;
pub mod candle;
pub mod orderbook;

pub use broadcast::LossyBroadcast;
pub use candle::{roll_over_idle, update_candle, CandleSize, CandleUpdate};
pub use orderbook::OrderBookStore;
