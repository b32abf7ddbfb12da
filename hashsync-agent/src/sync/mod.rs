//! Content addressing and stored-object encoding.

pub mod compress;
pub mod fingerprint;
