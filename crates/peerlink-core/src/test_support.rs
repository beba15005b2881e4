//! Shared fixtures for unit tests. RSA generation is slow, so each identity
//! is created once per test binary.

use crate::identity::Identity;
use std::sync::OnceLock;

fn fixture(cell: &'static OnceLock<Identity>, username: &str) -> &'static Identity {
    cell.get_or_init(|| Identity::generate(username).expect("identity generation"))
}

pub(crate) fn identity_a() -> &'static Identity {
    static CELL: OnceLock<Identity> = OnceLock::new();
    fixture(&CELL, "alice")
}

pub(crate) fn identity_b() -> &'static Identity {
    static CELL: OnceLock<Identity> = OnceLock::new();
    fixture(&CELL, "bob")
}

pub(crate) fn identity_c() -> &'static Identity {
    static CELL: OnceLock<Identity> = OnceLock::new();
    fixture(&CELL, "carol")
}
