pub mod client;
pub mod error;

pub use client::{
    BookTicker, ConditionalKind, ExchangeGateway, OpenOrder, OrderAck, PositionRisk,
    SymbolFilters, Ticker24h, UserTrade,
};
pub use error::GatewayError;
