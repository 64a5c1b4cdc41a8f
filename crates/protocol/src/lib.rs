pub mod config;
pub mod messages;
pub mod session;

pub use config::*;
pub use messages::*;
pub use session::*;
