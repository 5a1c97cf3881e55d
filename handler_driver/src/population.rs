//! Site population and device-pending tracking.
//!
//! [`SitePopulation`] is the test executor's view of each site. The driver
//! reads it when binning and updates it after a reprobe; the executor owns
//! activation. [`DevicePendingSet`] is the driver's own record of which
//! active sites the handler reported as loaded.

use handler_common::consts::MAX_SITES;
use heapless::Vec as HVec;
use serde::Serialize;

/// State of one test site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SiteState {
    /// Active, no device.
    Empty,
    /// Active, device present.
    Populated,
    /// Deactivated while holding a device; the device still has to be binned.
    PopulatedDeactivated,
    /// Deactivated, no device.
    Deactivated,
}

impl SiteState {
    /// True if a device sits in the socket.
    #[inline]
    pub const fn holds_device(self) -> bool {
        matches!(self, SiteState::Populated | SiteState::PopulatedDeactivated)
    }

    /// True if the site is deactivated.
    #[inline]
    pub const fn is_deactivated(self) -> bool {
        matches!(self, SiteState::Deactivated | SiteState::PopulatedDeactivated)
    }
}

/// Population of all configured sites, site 1 at index 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitePopulation {
    sites: HVec<SiteState, MAX_SITES>,
}

impl SitePopulation {
    /// Every active site empty, every inactive site deactivated.
    pub fn new(active: &[bool]) -> Self {
        let sites = active
            .iter()
            .take(MAX_SITES)
            .map(|&on| if on { SiteState::Empty } else { SiteState::Deactivated })
            .collect();
        Self { sites }
    }

    /// Build from explicit states.
    pub fn from_states(states: &[SiteState]) -> Self {
        Self {
            sites: states.iter().take(MAX_SITES).copied().collect(),
        }
    }

    /// Number of sites.
    #[inline]
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// True if no sites are configured.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// State of site `index`.
    pub fn get(&self, index: usize) -> Option<SiteState> {
        self.sites.get(index).copied()
    }

    /// Overwrite the state of site `index`.
    pub fn set(&mut self, index: usize, state: SiteState) {
        if let Some(slot) = self.sites.get_mut(index) {
            *slot = state;
        }
    }

    /// All states.
    pub fn states(&self) -> &[SiteState] {
        &self.sites
    }

    /// Bitmask of sites holding a device.
    pub fn device_mask(&self) -> u64 {
        self.sites
            .iter()
            .enumerate()
            .filter(|(_, s)| s.holds_device())
            .fold(0, |mask, (i, _)| mask | (1u64 << i))
    }

    /// Mark devices arriving at every active site set in `pending`.
    /// Deactivated sites are never populated this way.
    pub fn load_from(&mut self, pending: &DevicePendingSet) {
        for (i, slot) in self.sites.iter_mut().enumerate() {
            if *slot == SiteState::Empty && pending.is_pending(i) {
                *slot = SiteState::Populated;
            }
        }
    }

    /// Sites in `binned` gave up their device.
    pub fn complete_binning(&mut self, binned: u64) {
        for (i, slot) in self.sites.iter_mut().enumerate() {
            if binned & (1u64 << i) == 0 {
                continue;
            }
            *slot = match *slot {
                SiteState::Populated => SiteState::Empty,
                SiteState::PopulatedDeactivated => SiteState::Deactivated,
                other => other,
            };
        }
    }

    /// Deactivate a site, keeping its device if it holds one.
    pub fn deactivate(&mut self, index: usize) {
        if let Some(slot) = self.sites.get_mut(index) {
            *slot = match *slot {
                SiteState::Populated => SiteState::PopulatedDeactivated,
                SiteState::Empty => SiteState::Deactivated,
                other => other,
            };
        }
    }

    /// Reactivate a site.
    pub fn reactivate(&mut self, index: usize) {
        if let Some(slot) = self.sites.get_mut(index) {
            *slot = match *slot {
                SiteState::PopulatedDeactivated => SiteState::Populated,
                SiteState::Deactivated => SiteState::Empty,
                other => other,
            };
        }
    }
}

/// Which active sites the handler reported as loaded.
///
/// `any()` is kept equal to the OR of all entries by every mutator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePendingSet {
    pending: HVec<bool, MAX_SITES>,
    ored: bool,
}

impl DevicePendingSet {
    /// Nothing pending for `site_count` sites.
    pub fn new(site_count: usize) -> Self {
        Self {
            pending: (0..site_count.min(MAX_SITES)).map(|_| false).collect(),
            ored: false,
        }
    }

    fn recompute(&mut self) {
        self.ored = self.pending.iter().any(|&p| p);
    }

    /// Replace the whole set from a handler population mask.
    ///
    /// Sites not active in `active` never become pending.
    pub fn assign(&mut self, mask: u64, active: &[bool]) {
        for (i, slot) in self.pending.iter_mut().enumerate() {
            let reported = mask & (1u64 << i) != 0;
            *slot = reported && active.get(i).copied().unwrap_or(false);
        }
        self.recompute();
    }

    /// Set one site.
    pub fn set(&mut self, index: usize, value: bool) {
        if let Some(slot) = self.pending.get_mut(index) {
            *slot = value;
            self.recompute();
        }
    }

    /// Clear every site.
    pub fn clear(&mut self) {
        self.pending.iter_mut().for_each(|p| *p = false);
        self.ored = false;
    }

    /// True if site `index` is pending.
    #[inline]
    pub fn is_pending(&self, index: usize) -> bool {
        self.pending.get(index).copied().unwrap_or(false)
    }

    /// True if any site is pending.
    #[inline]
    pub fn any(&self) -> bool {
        self.ored
    }

    /// Pending sites as a bitmask.
    pub fn mask(&self) -> u64 {
        self.pending
            .iter()
            .enumerate()
            .filter(|(_, p)| **p)
            .fold(0, |mask, (i, _)| mask | (1u64 << i))
    }

    /// Per-site flags.
    pub fn as_slice(&self) -> &[bool] {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_population_follows_activation() {
        let pop = SitePopulation::new(&[true, false, true]);
        assert_eq!(
            pop.states(),
            &[SiteState::Empty, SiteState::Deactivated, SiteState::Empty]
        );
    }

    #[test]
    fn ored_matches_entries() {
        let mut set = DevicePendingSet::new(4);
        assert!(!set.any());
        set.assign(0b0101, &[true; 4]);
        assert!(set.any());
        assert_eq!(set.mask(), 0b0101);
        set.set(0, false);
        assert!(set.any());
        set.set(2, false);
        assert!(!set.any());
        set.set(3, true);
        assert_eq!(set.any(), set.as_slice().iter().any(|&p| p));
        set.clear();
        assert!(!set.any());
    }

    #[test]
    fn deactivated_sites_never_pending() {
        let mut set = DevicePendingSet::new(4);
        set.assign(0b1111, &[true, false, true, false]);
        assert_eq!(set.mask(), 0b0101);
        set.assign(0b0010, &[true, false, true, false]);
        assert!(!set.any());
    }

    #[test]
    fn out_of_range_index_is_ignored() {
        let mut set = DevicePendingSet::new(2);
        set.set(5, true);
        assert!(!set.any());
        assert!(!set.is_pending(5));
        set.assign(u64::MAX, &[true, true]);
        assert_eq!(set.mask(), 0b11);
    }

    #[test]
    fn load_and_complete_binning() {
        let mut pop = SitePopulation::new(&[true, true, false]);
        let mut set = DevicePendingSet::new(3);
        set.assign(0b111, &[true, true, true]);
        pop.load_from(&set);
        assert_eq!(
            pop.states(),
            &[SiteState::Populated, SiteState::Populated, SiteState::Deactivated]
        );
        pop.deactivate(1);
        assert_eq!(pop.get(1), Some(SiteState::PopulatedDeactivated));
        assert_eq!(pop.device_mask(), 0b011);

        pop.complete_binning(0b011);
        assert_eq!(
            pop.states(),
            &[SiteState::Empty, SiteState::Deactivated, SiteState::Deactivated]
        );
        pop.reactivate(1);
        assert_eq!(pop.get(1), Some(SiteState::Empty));
    }
}
