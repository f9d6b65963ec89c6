//! # dagflow-core
//! Foundation types and collaborator traits for the dagflow sync core.

pub mod constants;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
