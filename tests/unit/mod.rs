// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for the sidecar injector
//!
//! This module contains tests for:
//! - The injection pipeline against recording collaborators
//! - Admission review handling
//! - Bootstrap resources built from captured probes
//! - The event bus

#[path = "../common/mod.rs"]
mod common;

mod events;
mod orchestrator;
