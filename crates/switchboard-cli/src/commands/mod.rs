pub mod providers;
pub mod server;
