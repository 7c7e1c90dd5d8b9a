//! Health checks for tributary components.
//!
//! Components register named checks with a [`HealthChecks`] registry.
//! The sync coordinator runs the registry on its health loop and reports
//! the results as part of the system status.
use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Reported health of a single component.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The component is operating normally.
    Healthy,

    /// The component is operating but in a reduced or at-risk capacity.
    Degraded(String),

    /// The component is not operating.
    Failed(String),
}

impl HealthStatus {
    /// True unless the check reported a failure.
    pub fn is_healthy(&self) -> bool {
        !matches!(self, HealthStatus::Failed(_))
    }
}

/// Generic health check for a component.
pub trait HealthCheck: Send + Sync {
    /// Execute the status check.
    fn check(&self) -> HealthStatus;
}

impl<CheckFn> HealthCheck for CheckFn
where
    CheckFn: Fn() -> HealthStatus + Send + Sync + 'static,
{
    fn check(&self) -> HealthStatus {
        self()
    }
}

/// Registry of named health checks.
#[derive(Default)]
pub struct HealthChecks {
    checks: BTreeMap<String, Box<dyn HealthCheck>>,
}

impl HealthChecks {
    pub fn new() -> HealthChecks {
        HealthChecks {
            checks: BTreeMap::new(),
        }
    }

    /// Register a named health check.
    ///
    /// Check names are exposed to operators and should be meaningful to them.
    /// If a check with the given name already exists it is replaced.
    pub fn register<C, S>(&mut self, name: S, check: C)
    where
        C: HealthCheck + 'static,
        S: Into<String>,
    {
        self.checks.insert(name.into(), Box::new(check));
    }

    /// Run all registered checks and report the results.
    pub fn run(&self) -> HealthResults {
        let mut results = HealthResults::new();
        for (name, check) in self.checks.iter() {
            results.insert(name.clone(), check.check());
        }
        results
    }
}

/// Map of health check results by check name.
pub type HealthResults = BTreeMap<String, HealthStatus>;

#[cfg(test)]
mod tests {
    use super::HealthChecks;
    use super::HealthStatus;

    #[test]
    fn run_reports_all_checks() {
        let mut checks = HealthChecks::new();
        checks.register("queue", || HealthStatus::Healthy);
        checks.register("source", || {
            HealthStatus::Failed("connection refused".into())
        });
        let results = checks.run();
        assert_eq!(results.len(), 2);
        assert_eq!(results["queue"], HealthStatus::Healthy);
        assert!(!results["source"].is_healthy());
    }

    #[test]
    fn register_replaces_by_name() {
        let mut checks = HealthChecks::new();
        checks.register("queue", || HealthStatus::Healthy);
        checks.register("queue", || HealthStatus::Degraded("backlog".into()));
        let results = checks.run();
        assert_eq!(results.len(), 1);
        assert_eq!(results["queue"], HealthStatus::Degraded("backlog".into()));
    }
}
