pub mod background;
pub mod cache;
pub mod config;
pub mod scheduler;
pub mod shared;
pub mod upstream;
