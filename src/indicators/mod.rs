pub mod atr;
pub mod impulse;

pub use atr::{calculate_atr, calculate_atr_pct};
pub use impulse::impulse_return_pct;
