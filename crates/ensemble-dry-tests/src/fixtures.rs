// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Canned requests and a ready-to-use coordinator harness.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ensemble_cache::{MemoryTier, Signature};
use ensemble_fingerprint::SimulationRequest;
use ensemble_jobs::{
    Coordinator, CoordinatorConfig, CoordinatorError, Reservation, RetryPolicy, WorkspaceRoot,
};
use serde_json::json;
use tempfile::TempDir;

use crate::executor::ScriptedExecutor;

/// Single-species decay model, the smallest model the worker accepts.
pub fn decay_model() -> serde_json::Value {
    json!({
        "name": "decay",
        "species": [{"name": "A", "initial_value": 100, "mode": "discrete"}],
        "parameters": [{"name": "k", "expression": 0.5}],
        "reactions": [{"name": "r1", "reactants": {"A": 1}, "products": {}, "rate": "k"}],
        "timespan": [0.0, 0.5, 1.0, 1.5, 2.0]
    })
}

/// Reversible dimerization model.
pub fn dimer_model() -> serde_json::Value {
    json!({
        "name": "dimerization",
        "species": [
            {"name": "M", "initial_value": 30},
            {"name": "D", "initial_value": 0}
        ],
        "parameters": [
            {"name": "k_c", "expression": 0.005},
            {"name": "k_d", "expression": 0.08}
        ],
        "reactions": [
            {"name": "dimerize", "reactants": {"M": 2}, "products": {"D": 1}, "rate": "k_c"},
            {"name": "dissociate", "reactants": {"D": 1}, "products": {"M": 2}, "rate": "k_d"}
        ],
        "timespan": [0.0, 10.0, 20.0]
    })
}

/// Decay request for `n` trajectories with the SSA solver.
pub fn decay_request(n: u64) -> SimulationRequest {
    SimulationRequest::new(decay_model())
        .with_kwarg("algorithm", json!("SSA"))
        .with_trajectories(n)
}

/// Dimerization request for `n` trajectories.
pub fn dimer_request(n: u64) -> SimulationRequest {
    SimulationRequest::new(dimer_model()).with_trajectories(n)
}

/// Coordinator tuned for tests: immediate retries, short task timeout.
pub fn test_config(max_retries: u32) -> CoordinatorConfig {
    CoordinatorConfig {
        retry: RetryPolicy::immediate(max_retries),
        task_timeout: Duration::from_secs(5),
        finished_retention: 64,
    }
}

/// A coordinator over a [`MemoryTier`] and a [`ScriptedExecutor`], with its
/// workspace root in a temporary directory.
pub struct CoordinatorHarness {
    /// The coordinator under test.
    pub coordinator: Coordinator<Arc<MemoryTier>, ScriptedExecutor>,
    /// The cache it commits to.
    pub cache: Arc<MemoryTier>,
    /// The executor it dispatches through (shares state with the coordinator's).
    pub executor: ScriptedExecutor,
    /// Workspace root.
    pub workspaces: PathBuf,
    _dir: TempDir,
}

impl CoordinatorHarness {
    /// Harness with [`test_config`]`(2)`.
    pub fn new(executor: ScriptedExecutor) -> Self {
        Self::with_config(executor, test_config(2))
    }

    /// Harness with an explicit config.
    #[allow(clippy::expect_used)]
    pub fn with_config(executor: ScriptedExecutor, config: CoordinatorConfig) -> Self {
        let dir = tempfile::tempdir().expect("temp dir for workspaces");
        let workspaces = dir.path().join("jobs");
        let root = WorkspaceRoot::open(&workspaces).expect("workspace root");
        let cache = Arc::new(MemoryTier::new());
        let coordinator = Coordinator::new(Arc::clone(&cache), executor.clone(), root, config);
        Self {
            coordinator,
            cache,
            executor,
            workspaces,
            _dir: dir,
        }
    }

    /// Reserve for `request` using its own signature and count.
    #[allow(clippy::expect_used)]
    pub fn reserve(
        &self,
        request: &SimulationRequest,
    ) -> Result<(Signature, Reservation), CoordinatorError> {
        let signature = request.signature().expect("fixture requests are canonical");
        let n = request.trajectories().expect("fixture requests carry a count");
        let reservation = self.coordinator.reserve_delta(signature, n, request)?;
        Ok((signature, reservation))
    }

    /// Workspace directories currently on disk.
    pub fn workspace_dirs(&self) -> usize {
        std::fs::read_dir(&self.workspaces)
            .map(|entries| entries.filter_map(Result::ok).count())
            .unwrap_or(0)
    }
}
