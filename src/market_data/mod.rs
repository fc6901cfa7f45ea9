pub mod bars;
pub mod stream;
pub mod ticks;

// Re-export the core types for convenient access (e.g. `use crate::market_data::Bar`).
pub use bars::{Bar, BarSeries};
pub use stream::{run_trade_stream, StreamExit};
pub use ticks::TickBuffer;
