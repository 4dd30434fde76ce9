// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared application services for Ensemble tools (config, daemon settings).
//! Keeps the binaries thin and storage-agnostic.
#![forbid(unsafe_code)]

pub mod config;
pub mod settings;
