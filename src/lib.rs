pub mod chat;
pub mod config;
pub mod filter;
pub mod interface;
pub mod manager;
pub mod relay;
pub mod session;
pub mod store;
