//! Status Module
//!
//! Read-only HTTP telemetry for operators: adaptive controller snapshots,
//! active instances, queue counts and in-flight handoffs. Nothing here
//! changes engine state.

pub mod handlers;
pub mod protocol;

#[cfg(test)]
mod tests;
