//! The lasso session engine.
//!
//! A session follows one target account: it polls the target's recent plays,
//! filters out anything already relayed, and re-submits the rest as scrobbles
//! for the authenticated follower.  [`SessionEngine`] is the entry point; the
//! source and sink are pluggable through [`ScrobbleSource`] / [`ScrobbleSink`],
//! with a Last.fm implementation in [`lastfm`].

pub mod client;
pub mod engine;
pub mod error;
pub mod feed;
pub mod lastfm;
pub mod ledger;
mod poller;
pub mod session;

pub use client::{PlayRecord, ScrobbleSink, ScrobbleSource, SinkError, SourceError, TrackId};
pub use engine::{EngineConfig, EngineEvent, SessionEngine};
pub use error::EngineError;
