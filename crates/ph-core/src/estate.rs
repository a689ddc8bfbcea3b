//! Equipment state: site population, pause and lot flags.
//!
//! The plugin writes the site population during `get_start` and after
//! binning; the framework reads it to tell the tester which sites hold
//! devices. Both sides share one [`Estate`] handle.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Maximum number of handler sites.
pub const MAX_SITES: usize = 1024;

/// Population state of one handler site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SiteUsage {
    /// A device is inserted and will be tested.
    Populated,
    /// No device is present.
    #[default]
    Empty,
    /// The site is switched off and holds no device.
    Deactivated,
    /// The site is switched off but a device is present.
    PopDeact,
}

impl SiteUsage {
    /// Whether a device is physically present.
    pub fn holds_device(self) -> bool {
        matches!(self, SiteUsage::Populated | SiteUsage::PopDeact)
    }

    /// State after the device at this site was binned.
    pub fn after_binning(self) -> SiteUsage {
        match self {
            SiteUsage::Populated => SiteUsage::Empty,
            SiteUsage::PopDeact => SiteUsage::Deactivated,
            other => other,
        }
    }

    fn as_char(self) -> char {
        match self {
            SiteUsage::Populated => 'P',
            SiteUsage::Empty => 'E',
            SiteUsage::Deactivated => 'D',
            SiteUsage::PopDeact => 'p',
        }
    }
}

/// Errors raised when updating the equipment state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EstateError {
    /// The site array is empty or exceeds [`MAX_SITES`].
    #[error("invalid site population: {0} entries requested")]
    InvalidSiteCount(usize),

    /// The site array does not match the configured number of sites.
    #[error("site population has {requested} entries, {configured} sites configured")]
    SiteCountMismatch { requested: usize, configured: usize },
}

/// Snapshot of the handler equipment state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EquipmentState {
    sites: Vec<SiteUsage>,
    paused: bool,
    lot_started: bool,
}

impl EquipmentState {
    /// Current site population.
    pub fn sites(&self) -> &[SiteUsage] {
        &self.sites
    }

    /// Whether the handler is paused.
    pub fn paused(&self) -> bool {
        self.paused
    }

    /// Whether the handler reported a started lot.
    pub fn lot_started(&self) -> bool {
        self.lot_started
    }
}

/// Compact rendering like `[PPEDp]`, used in log lines.
pub struct SiteSummary<'a>(pub &'a [SiteUsage]);

impl fmt::Display for SiteSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for s in self.0 {
            write!(f, "{}", s.as_char())?;
        }
        f.write_str("]")
    }
}

/// Shared, thread-safe equipment state handle.
#[derive(Debug, Clone, Default)]
pub struct Estate {
    inner: Arc<RwLock<EquipmentState>>,
}

impl Estate {
    /// Create a state with `sites` empty sites.
    pub fn new(sites: usize) -> Self {
        let state = EquipmentState {
            sites: vec![SiteUsage::Empty; sites.min(MAX_SITES)],
            ..Default::default()
        };
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> EquipmentState {
        self.inner.read().clone()
    }

    /// Copy of the current site population.
    pub fn sites(&self) -> Vec<SiteUsage> {
        self.inner.read().sites.clone()
    }

    /// Number of configured sites.
    pub fn site_count(&self) -> usize {
        self.inner.read().sites.len()
    }

    /// Replace the site population.
    ///
    /// The length must equal the site count the state was created with.
    pub fn set_sites(&self, sites: &[SiteUsage]) -> Result<(), EstateError> {
        if sites.is_empty() || sites.len() > MAX_SITES {
            tracing::error!(entries = sites.len(), "invalid site population");
            return Err(EstateError::InvalidSiteCount(sites.len()));
        }
        let mut state = self.inner.write();
        if !state.sites.is_empty() && state.sites.len() != sites.len() {
            tracing::error!(
                requested = sites.len(),
                configured = state.sites.len(),
                "number of sites does not match configuration"
            );
            return Err(EstateError::SiteCountMismatch {
                requested: sites.len(),
                configured: state.sites.len(),
            });
        }
        state.sites = sites.to_vec();
        tracing::debug!(sites = %SiteSummary(&state.sites), "site usage set");
        Ok(())
    }

    /// Apply the post-binning transition to every site.
    pub fn mark_binned(&self) {
        let mut state = self.inner.write();
        for s in state.sites.iter_mut() {
            *s = s.after_binning();
        }
        tracing::debug!(sites = %SiteSummary(&state.sites), "sites emptied after binning");
    }

    /// Whether the handler is paused.
    pub fn paused(&self) -> bool {
        self.inner.read().paused
    }

    /// Record the handler pause state.
    pub fn set_paused(&self, paused: bool) {
        self.inner.write().paused = paused;
    }

    /// Whether a lot is started.
    pub fn lot_started(&self) -> bool {
        self.inner.read().lot_started
    }

    /// Record the lot state.
    pub fn set_lot_started(&self, started: bool) {
        self.inner.write().lot_started = started;
    }
}

/// Derive the site population from the handler's "device pending" flags.
///
/// With `mask_pending` the configured site mask decides: an active site with a
/// pending device is populated, an active site without one is empty, and an
/// inactive site is deactivated. A device reported on an inactive site is an
/// error on the handler side and only logged.
///
/// Without masking every pending site is populated and all others are empty.
pub fn population_from_pending(
    pending: &[bool],
    active: &[bool],
    mask_pending: bool,
) -> Vec<SiteUsage> {
    pending
        .iter()
        .enumerate()
        .map(|(site, &is_pending)| {
            if !mask_pending {
                return if is_pending {
                    SiteUsage::Populated
                } else {
                    SiteUsage::Empty
                };
            }
            let is_active = active.get(site).copied().unwrap_or(true);
            match (is_active, is_pending) {
                (true, true) => SiteUsage::Populated,
                (true, false) => SiteUsage::Empty,
                (false, pending) => {
                    if pending {
                        tracing::error!(
                            site,
                            "device present at deactivated site, will not be tested"
                        );
                    }
                    SiteUsage::Deactivated
                }
            }
        })
        .collect()
}

/// Population after a reprobe. Only devices that were present before take
/// part; a device showing up on a site that was empty waits for the next
/// device cycle. Sites that were binned instead of reprobed are emptied.
pub fn population_after_reprobe(
    old: &[SiteUsage],
    active: &[bool],
    to_reprobe: &[bool],
    pending: &[bool],
) -> Vec<SiteUsage> {
    old.iter()
        .enumerate()
        .map(|(site, &before)| {
            let pending = pending.get(site).copied().unwrap_or(false);
            if !active.get(site).copied().unwrap_or(true) {
                if pending {
                    tracing::error!(site, "received device for deactivated site");
                }
                return SiteUsage::Deactivated;
            }
            if to_reprobe.get(site).copied().unwrap_or(false) {
                if pending && !before.holds_device() {
                    tracing::warn!(
                        site,
                        "new device will not be tested during reprobe action (delayed)"
                    );
                }
                if !pending && before.holds_device() {
                    tracing::error!(site, "did not receive device that was scheduled for reprobe");
                    return SiteUsage::Empty;
                }
                return before;
            }
            if pending {
                tracing::warn!(
                    site,
                    "new device will not be tested during reprobe action (delayed)"
                );
            }
            match before {
                SiteUsage::PopDeact | SiteUsage::Deactivated => SiteUsage::Deactivated,
                _ => SiteUsage::Empty,
            }
        })
        .collect()
}
