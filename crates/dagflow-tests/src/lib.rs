//! Integration test suite for the dagflow sync core.
//!
//! Nodes run real dispatchers and flows over the in-memory transport, backed
//! by the in-memory consensus and mempool doubles.

pub mod helpers;
