//! Local filesystem helpers: scanning and fingerprinting.

pub mod fingerprint;
pub mod walker;
