pub mod authorization;
pub mod config;
pub mod core;
pub mod health;
#[cfg(feature = "lnd")]
pub mod lnd_adapters;
pub mod primitives;
