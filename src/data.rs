pub mod alert;
pub mod candle;
pub mod domain;
pub mod snapshot;
pub mod strategy;
