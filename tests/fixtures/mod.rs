//! Test fixtures.
//!
//! RSA key generation dominates test time, so identities are generated once
//! per test binary and shared.

mod two_peer;

pub use two_peer::{Peer, TwoPeerFixture};

use peerlink_core::Identity;
use std::sync::{Arc, OnceLock};

fn fixture(cell: &'static OnceLock<Arc<Identity>>, username: &str) -> Arc<Identity> {
    cell.get_or_init(|| Arc::new(Identity::generate(username).expect("identity generation")))
        .clone()
}

/// Shared identity named `alice`.
pub fn identity_a() -> Arc<Identity> {
    static CELL: OnceLock<Arc<Identity>> = OnceLock::new();
    fixture(&CELL, "alice")
}

/// Shared identity named `bob`.
pub fn identity_b() -> Arc<Identity> {
    static CELL: OnceLock<Arc<Identity>> = OnceLock::new();
    fixture(&CELL, "bob")
}

/// Shared identity named `carol`.
pub fn identity_c() -> Arc<Identity> {
    static CELL: OnceLock<Arc<Identity>> = OnceLock::new();
    fixture(&CELL, "carol")
}
