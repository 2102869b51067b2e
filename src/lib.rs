pub mod gateway;
pub mod server;
