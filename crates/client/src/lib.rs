//! Meshroom participant: joins a room through the relay and keeps one
//! media transport per remote participant.

pub mod ancillary;
pub mod capture;
pub mod error;
pub mod peer;
pub mod services;
pub mod session;
pub mod signaling;
pub mod stats;
