//! Network surfaces

pub mod http;
