//! Integration test suite for weave.
//!
//! These tests drive real processes and real git repositories. Agents and
//! validators are scripted, so no model is ever called.
//!
//! # Test Categories
//!
//! - `sandbox`: background command execution, timeouts and shutdown
//! - `collaboration`: multi-agent integration onto the delivery line
//! - `execution`: multi-round plan execution

mod fixtures;

mod collaboration;
mod execution;
mod sandbox;
