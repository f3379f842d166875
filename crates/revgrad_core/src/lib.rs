pub mod config;
pub mod device;
pub mod dtype;
pub mod error;
pub mod layout;
