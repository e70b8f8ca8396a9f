pub mod agent;
pub mod api;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod hub;
pub mod idle;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod session;
