// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared test doubles and fixtures for Ensemble crates.
#![forbid(unsafe_code)]
//!
//! # Modules
//!
//! - [`config`] - In-memory config store fake for testing without filesystem
//! - [`executor`] - Scripted executor with a gate for holding tasks
//! - [`fixtures`] - Canned simulation requests and a coordinator harness

pub mod config;
pub mod executor;
pub mod fixtures;

pub use config::InMemoryConfigStore;
pub use executor::{ScriptedExecutor, Step};
pub use fixtures::{decay_request, dimer_request, test_config, CoordinatorHarness};
