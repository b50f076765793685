//! Client for the upstream transit feed api: url construction, the
//! byte-for-byte xml decoders and the decoded document models.

pub mod api;
pub mod models;
pub mod xml;
