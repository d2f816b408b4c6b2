pub mod config;
pub mod error;
pub mod model;
pub mod peer;
pub mod server;
pub mod util;
