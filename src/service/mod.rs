pub mod storage;
pub mod stream;
pub mod token;

pub use storage::TradeStorage;
pub use stream::{CandleStreamer, StreamCredentials};
