#![forbid(unsafe_code)]

// Huddle - signaling server for a small self-hosted video meeting service

pub mod config;
pub mod janitor;
pub mod metrics;
pub mod room;
pub mod signaling;
pub mod turn;
