pub mod client_handler;
pub mod redis;
pub mod resp;
