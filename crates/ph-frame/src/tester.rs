//! Access to the tester's system flags and per-site results.
//!
//! The framework never talks to the test cell client directly. It reads the
//! operator flags (abort, pause, retest, ...) and the per-site test results
//! through [`Tester`], so the same dispatch logic runs against SmarTest, the
//! command line simulator or a unit test.

use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;

/// Site setup value for a site holding a device under test.
pub const SITE_INSERTED_TO_TEST: i64 = 1;
/// Site setup value for a site without a device.
pub const SITE_NOT_INSERTED: i64 = 0;

/// System wide flags of the test cell client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemFlag {
    Abort,
    Reset,
    Quit,
    Pause,
    Retest,
    CheckDevice,
    Skip,
    /// Leave the current application model level.
    LevelEnd,
}

/// Flags kept per SmarTest site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteFlag {
    /// Non-zero when the device passed.
    GoodPart,
    /// Non-zero when the device should be reprobed.
    Reprobe,
    /// [`SITE_INSERTED_TO_TEST`] or [`SITE_NOT_INSERTED`].
    SiteSetup,
}

/// Bin result of one SmarTest site.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SmartestBin {
    /// Soft bin code.
    pub code: String,
    /// Hard bin number, `-1` for retest.
    pub number: i64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TesterError {
    #[error("tester flag {0:?} not available")]
    FlagUnavailable(SystemFlag),

    #[error("{flag:?} not available for SmarTest site {site}")]
    SiteFlagUnavailable { flag: SiteFlag, site: i64 },

    #[error("no bin result for SmarTest site {0}")]
    NoBin(i64),
}

/// Test cell client as seen by the framework.
///
/// Sites are SmarTest site numbers, not handler site indices.
pub trait Tester: Send + Sync {
    fn system_flag(&self, flag: SystemFlag) -> Result<i64, TesterError>;

    fn set_system_flag(&self, flag: SystemFlag, value: i64) -> Result<(), TesterError>;

    fn site_flag(&self, flag: SiteFlag, site: i64) -> Result<i64, TesterError>;

    fn set_site_flag(&self, flag: SiteFlag, site: i64, value: i64) -> Result<(), TesterError>;

    fn bin_of_site(&self, site: i64) -> Result<SmartestBin, TesterError>;

    /// Whether `flag` is set; an unreadable flag counts as clear.
    fn is_set(&self, flag: SystemFlag) -> bool {
        self.system_flag(flag).map(|v| v != 0).unwrap_or(false)
    }

    /// Set or clear `flag`, logging a failure.
    fn raise(&self, flag: SystemFlag, on: bool) {
        if let Err(e) = self.set_system_flag(flag, i64::from(on)) {
            tracing::warn!("{}", e);
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    system: HashMap<SystemFlag, i64>,
    sites: HashMap<(SiteFlag, i64), i64>,
    bins: HashMap<i64, SmartestBin>,
}

/// In-memory tester.
///
/// All system flags start cleared. Site flags read as zero until set. A site
/// without a recorded bin result reports [`TesterError::NoBin`].
#[derive(Debug, Default)]
pub struct SimulatedTester {
    state: Mutex<SimState>,
}

impl SimulatedTester {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the test result of one SmarTest site.
    pub fn set_result(&self, site: i64, number: i64, code: &str, passed: bool) {
        let mut state = self.state.lock();
        state.bins.insert(
            site,
            SmartestBin {
                code: code.to_string(),
                number,
            },
        );
        state.sites.insert((SiteFlag::GoodPart, site), i64::from(passed));
    }

    /// Forget all bin results, as after a device cycle.
    pub fn clear_results(&self) {
        let mut state = self.state.lock();
        state.bins.clear();
        state
            .sites
            .retain(|(flag, _), _| *flag == SiteFlag::SiteSetup);
    }
}

impl Tester for SimulatedTester {
    fn system_flag(&self, flag: SystemFlag) -> Result<i64, TesterError> {
        Ok(self.state.lock().system.get(&flag).copied().unwrap_or(0))
    }

    fn set_system_flag(&self, flag: SystemFlag, value: i64) -> Result<(), TesterError> {
        self.state.lock().system.insert(flag, value);
        Ok(())
    }

    fn site_flag(&self, flag: SiteFlag, site: i64) -> Result<i64, TesterError> {
        Ok(self
            .state
            .lock()
            .sites
            .get(&(flag, site))
            .copied()
            .unwrap_or(0))
    }

    fn set_site_flag(&self, flag: SiteFlag, site: i64, value: i64) -> Result<(), TesterError> {
        self.state.lock().sites.insert((flag, site), value);
        Ok(())
    }

    fn bin_of_site(&self, site: i64) -> Result<SmartestBin, TesterError> {
        self.state
            .lock()
            .bins
            .get(&site)
            .cloned()
            .ok_or(TesterError::NoBin(site))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_default_to_clear() {
        let tester = SimulatedTester::new();
        assert!(!tester.is_set(SystemFlag::Abort));
        tester.raise(SystemFlag::Abort, true);
        assert!(tester.is_set(SystemFlag::Abort));
        tester.raise(SystemFlag::Abort, false);
        assert!(!tester.is_set(SystemFlag::Abort));
    }

    #[test]
    fn results_are_per_site() {
        let tester = SimulatedTester::new();
        tester.set_result(2, 5, "5", false);
        assert_eq!(tester.bin_of_site(2).unwrap().number, 5);
        assert_eq!(tester.site_flag(SiteFlag::GoodPart, 2), Ok(0));
        assert_eq!(tester.bin_of_site(1), Err(TesterError::NoBin(1)));

        tester.set_site_flag(SiteFlag::SiteSetup, 2, SITE_INSERTED_TO_TEST).unwrap();
        tester.clear_results();
        assert!(tester.bin_of_site(2).is_err());
        assert_eq!(tester.site_flag(SiteFlag::SiteSetup, 2), Ok(SITE_INSERTED_TO_TEST));
    }
}
