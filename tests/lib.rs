//! Shared fixtures for PeerLink integration tests.

pub mod fixtures;

pub use fixtures::{TwoPeerFixture, identity_a, identity_b, identity_c};
