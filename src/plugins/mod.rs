//! Investigation subsystems built on the core store.

pub mod boundary;
pub mod collect;
pub mod ledger;
pub mod patterns;
pub mod session;
