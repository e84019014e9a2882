//! Shared test utilities for integration, property and chaos tests.
//!
//! This module provides:
//! - A recording transport for asserting what the coordinator sends
//! - Helpers to wire real connectors to a coordinator over memory links
//! - Polling helpers for eventually-consistent assertions

#![allow(dead_code)]

pub mod harness;
pub mod recording;

pub use harness::*;
pub use recording::*;
