pub mod config;
pub mod messages;
pub mod services;

pub use config::*;
pub use messages::*;
pub use services::*;
