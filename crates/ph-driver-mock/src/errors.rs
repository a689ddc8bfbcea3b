//! Error injection for mock handlers.
//!
//! Scenarios are counted per operation name (`"get_start"`, `"bin"`, ...).
//! Random failures apply to every operation unless a rate is given for the
//! operation itself.

use crate::rng::MockRng;
use parking_lot::Mutex;
use ph_core::{FuncError, FuncResult};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorScenario {
    /// Every call after the first `count` fails with `Answer`.
    FailAfterN { operation: &'static str, count: u32 },
    /// The operation never completes in time.
    Timeout { operation: &'static str },
    /// The call after `count` device requests reports a jam, once.
    Jam { after: u32 },
    /// After `count` device requests the handler stops answering for good.
    CommunicationLoss { after: u32 },
}

#[derive(Default, Debug)]
struct ErrorState {
    counts: HashMap<&'static str, u32>,
    communication_lost: bool,
    jammed: bool,
}

/// Injected failures of one mock handler.
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    rates: Arc<HashMap<&'static str, f64>>,
    scenarios: Arc<Vec<ErrorScenario>>,
    rng: Arc<MockRng>,
    state: Arc<Mutex<ErrorState>>,
}

impl ErrorConfig {
    /// No failures.
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), Arc::new(MockRng::new(None)))
    }

    /// Uniform random `Answer` failures drawn from `rng`.
    pub fn random_failures(rate: f64, rng: Arc<MockRng>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), rng)
    }

    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, Arc::new(MockRng::new(None)))
    }

    /// Random failures and scenarios together.
    pub fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        rng: Arc<MockRng>,
    ) -> Self {
        Self {
            rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng,
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rates.values().all(|r| *r <= 0.0) && self.scenarios.is_empty()
    }

    /// Count one call of `operation` and return the failure injected for it.
    pub fn check_operation(&self, operation: &'static str) -> FuncResult {
        let mut state = self.state.lock();
        if state.communication_lost {
            return Err(FuncError::Lan);
        }
        let count = {
            let count = state.counts.entry(operation).or_insert(0);
            *count += 1;
            *count
        };
        let device_requests = state.counts.get("get_start").copied().unwrap_or(0);

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN {
                    operation: op,
                    count: n,
                } if *op == operation && count > *n => {
                    return Err(FuncError::Answer);
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(FuncError::Timeout);
                }
                ErrorScenario::Jam { after }
                    if operation == "get_start" && !state.jammed && device_requests > *after =>
                {
                    state.jammed = true;
                    return Err(FuncError::Jam);
                }
                ErrorScenario::CommunicationLoss { after }
                    if operation == "get_start" && device_requests > *after =>
                {
                    state.communication_lost = true;
                    return Err(FuncError::Lan);
                }
                _ => {}
            }
        }

        let rate = self
            .rates
            .get(operation)
            .or_else(|| self.rates.get("*"))
            .copied()
            .unwrap_or(0.0);
        if self.rng.chance(rate) {
            tracing::debug!(operation, "injected random failure");
            return Err(FuncError::Answer);
        }
        Ok(())
    }

    /// Clear counters and a lost connection.
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_errors() {
        let errors = ErrorConfig::none();
        assert!(errors.is_empty());
        for _ in 0..100 {
            assert_eq!(errors.check_operation("get_start"), Ok(()));
        }
    }

    #[test]
    fn random_failures_are_reproducible() {
        let run = || {
            let errors = ErrorConfig::random_failures(0.5, Arc::new(MockRng::new(Some(3))));
            (0..200)
                .map(|_| errors.check_operation("bin").is_err())
                .collect::<Vec<_>>()
        };
        let first = run();
        assert_eq!(first, run());
        let failures = first.iter().filter(|f| **f).count();
        assert!((60..140).contains(&failures), "got {} failures", failures);
    }

    #[test]
    fn fail_after_n() {
        let errors = ErrorConfig::scenarios(vec![ErrorScenario::FailAfterN {
            operation: "bin",
            count: 3,
        }]);
        for _ in 0..3 {
            assert_eq!(errors.check_operation("bin"), Ok(()));
        }
        assert_eq!(errors.check_operation("get_start"), Ok(()));
        assert_eq!(errors.check_operation("bin"), Err(FuncError::Answer));
        errors.reset();
        assert_eq!(errors.check_operation("bin"), Ok(()));
    }

    #[test]
    fn jam_happens_once() {
        let errors = ErrorConfig::scenarios(vec![ErrorScenario::Jam { after: 2 }]);
        assert_eq!(errors.check_operation("get_start"), Ok(()));
        assert_eq!(errors.check_operation("get_start"), Ok(()));
        assert_eq!(errors.check_operation("get_start"), Err(FuncError::Jam));
        assert_eq!(errors.check_operation("get_start"), Ok(()));
    }

    #[test]
    fn communication_loss_is_permanent() {
        let errors = ErrorConfig::scenarios(vec![ErrorScenario::CommunicationLoss { after: 1 }]);
        assert_eq!(errors.check_operation("get_start"), Ok(()));
        assert_eq!(errors.check_operation("get_start"), Err(FuncError::Lan));
        assert_eq!(errors.check_operation("bin"), Err(FuncError::Lan));
        errors.reset();
        assert_eq!(errors.check_operation("bin"), Ok(()));
    }

    #[test]
    fn timeout_only_hits_its_operation() {
        let errors = ErrorConfig::scenarios(vec![ErrorScenario::Timeout {
            operation: "comm_test",
        }]);
        assert_eq!(errors.check_operation("comm_test"), Err(FuncError::Timeout));
        assert_eq!(errors.check_operation("get_start"), Ok(()));
    }
}
