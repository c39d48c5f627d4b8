pub mod config;
pub mod crypto;
pub mod debug_log;
pub mod net;
