pub mod client;
pub mod client_data;
pub mod config;
pub mod messaging;
pub mod server;
pub mod util;
