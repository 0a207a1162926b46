//! Process wiring: bootstrap, HTTP server, health and shutdown.

mod bootstrap;
mod health;
mod server;
mod shutdown;

pub use bootstrap::*;
pub use health::*;
pub use server::*;
pub use shutdown::*;
