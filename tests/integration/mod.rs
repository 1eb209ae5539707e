//! Integration test suite for forge.
//!
//! These tests drive the orchestrator actor, real workers and the message
//! bus together, from a request through to delivery or a blocked project.
//!
//! # Test Categories
//!
//! - `pipeline`: Request to delivery, review loops, persistence
//! - `scheduling`: Dependency ordering and assignment exclusivity
//! - `recovery`: Retries, deadlines, heartbeats and cancellation
//! - `bus_delivery`: Ordering, isolation and backpressure under load
//!
//! # CI Compatibility
//!
//! Capability providers are scripted in-process; nothing leaves the test.

mod fixtures;

mod bus_delivery;
mod recovery;
mod scheduling;
