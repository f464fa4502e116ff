//! Integration tests for the DogeNet node.
//!
//! The harness spins up real services on loopback sockets; the test
//! modules cover the cross-crate scenarios the unit tests cannot.

pub mod harness;

#[cfg(test)]
mod gossip_tests;
#[cfg(test)]
mod handler_tests;
#[cfg(test)]
mod store_tests;
