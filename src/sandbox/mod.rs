//! Per-child filesystem sandbox: jail construction and privilege drop.

pub mod capabilities;
pub mod jail;
