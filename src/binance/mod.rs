pub mod client;
pub mod filters;
pub mod gateway;

pub use client::BinanceClient;
pub use gateway::BinanceGateway;
