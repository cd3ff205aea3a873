//! The clips provider: authentication, its REST API, and clip selection.

pub mod auth;
pub mod client;
pub mod clips;
pub mod games;
pub mod types;
