pub mod handler;
pub mod leaderboard;
pub mod metrics;
pub mod ports;
pub mod projection;
pub mod replay;
