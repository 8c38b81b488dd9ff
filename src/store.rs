pub mod candles;
pub mod relational;
