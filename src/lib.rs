pub mod config;
pub mod error;
pub mod session;
pub mod repository;
pub mod rpc;
pub mod server;
