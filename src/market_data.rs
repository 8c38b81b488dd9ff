pub mod budget;
pub mod cache;
pub mod client;
pub mod metadata;
pub mod provider;
