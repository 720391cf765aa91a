pub mod connection;
pub mod http_handler;
pub mod server;
