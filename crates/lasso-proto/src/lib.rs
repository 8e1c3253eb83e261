//! Shared types for the lasso daemon and its clients: session wire types,
//! the framed command/broadcast protocol, configuration and platform paths.

pub mod config;
pub mod platform;
pub mod protocol;
