//! Capture record and query types

pub mod capture;
pub mod filter;
pub mod output;
pub mod query;
