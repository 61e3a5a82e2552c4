use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use uuid::Uuid;

use crate::common::PeripheralId;
use crate::peripheral::Peripheral;

#[derive(Default)]
pub struct ScanOptions {
    /// Only report peripherals advertising one of these services. Forwarded to the radio.
    services: Vec<Uuid>,
    /// Let the radio report every advertisement instead of one per device.
    allow_duplicates: bool,
    /// Only report peripherals whose name is exactly one of these.
    exact_names: Vec<String>,
    /// Filters the found devices based on device identifier.
    address_filter: Option<Box<dyn Fn(&PeripheralId) -> bool + Send>>,
    /// Filters the found devices based on local name.
    name_filter: Option<Box<dyn Fn(&str) -> bool + Send + Sync>>,
    /// Maximum results before the scan is stopped.
    max_results: Option<usize>,
    /// The scan is stopped when timeout duration is reached.
    timeout: Option<Duration>,
}

impl fmt::Debug for ScanOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanOptions")
            .field("services", &self.services)
            .field("allow_duplicates", &self.allow_duplicates)
            .field("exact_names", &self.exact_names)
            .field("address_filter", &self.address_filter.is_some())
            .field("name_filter", &self.name_filter.is_some())
            .field("max_results", &self.max_results)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ScanOptions {
    /// Only scan for peripherals advertising the given services
    pub fn filter_by_services(mut self, services: impl IntoIterator<Item = Uuid>) -> Self {
        self.services = services.into_iter().collect();
        self
    }

    /// Report repeated advertisements of the same device
    pub fn allow_duplicates(mut self) -> Self {
        self.allow_duplicates = true;
        self
    }

    /// Only report peripherals whose name (or advertised local name) is one of the given names
    pub fn exact_advertising_name<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.exact_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Filter scanned devices based on the device identifier
    pub fn filter_by_address(mut self, func: impl Fn(&PeripheralId) -> bool + Send + 'static) -> Self {
        self.address_filter = Some(Box::new(func));
        self
    }

    /// Filter scanned devices based on the device name
    pub fn filter_by_name(mut self, func: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.name_filter = Some(Box::new(func));
        self
    }

    /// Stop the scan after given number of matches
    pub fn stop_after_matches(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    /// Stop the scan after the first match
    pub fn stop_after_first_match(self) -> Self {
        self.stop_after_matches(1)
    }

    /// Stop the scan after given duration
    pub fn stop_after_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Require that the scanned devices have a name
    pub fn require_name(self) -> Self {
        if self.name_filter.is_none() {
            self.filter_by_name(|name| !name.is_empty())
        } else {
            self
        }
    }

    pub fn services(&self) -> &[Uuid] {
        &self.services
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn duplicates_allowed(&self) -> bool {
        self.allow_duplicates
    }
}

/// Bookkeeping for the scan currently running.
#[derive(Debug)]
pub(crate) struct ScanState {
    options: ScanOptions,
    /// Distinguishes this scan's timer from ones of earlier scans
    pub(crate) generation: u64,
    /// Set of devices that matched the filters
    matched: HashSet<PeripheralId>,
}

impl ScanState {
    pub(crate) fn new(options: ScanOptions, generation: u64) -> Self {
        Self {
            options,
            generation,
            matched: HashSet::new(),
        }
    }

    /// Checks the peripheral against the filters the radio cannot apply.
    pub(crate) fn passes_filters(&self, peripheral: &Peripheral) -> bool {
        if let Some(filter_by_addr) = self.options.address_filter.as_ref() {
            if !filter_by_addr(&peripheral.id) {
                return false;
            }
        }

        if !self.options.exact_names.is_empty() {
            let matches_exactly = [peripheral.name.as_deref(), peripheral.advertisement.local_name.as_deref()]
                .into_iter()
                .flatten()
                .any(|name| self.options.exact_names.iter().any(|n| n == name));
            if !matches_exactly {
                return false;
            }
        }

        if let Some(filter_by_name) = self.options.name_filter.as_ref() {
            // Without a name the device may still pass on a later advertisement.
            match peripheral.local_name() {
                Some(name) if filter_by_name(name) => {}
                _ => return false,
            }
        }

        true
    }

    /// Records a reported peripheral. Returns `true` once the configured
    /// number of distinct matches has been reached.
    pub(crate) fn record_match(&mut self, id: &PeripheralId) -> bool {
        self.matched.insert(id.clone());

        self.options
            .max_results
            .filter(|max_results| self.matched.len() >= *max_results)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripheral::AdvertisementData;

    fn peripheral(id: &str, name: Option<&str>, local_name: Option<&str>) -> Peripheral {
        let mut p = Peripheral::new(PeripheralId::from(id));
        p.name = name.map(str::to_string);
        p.advertisement = AdvertisementData {
            local_name: local_name.map(str::to_string),
            ..Default::default()
        };
        p
    }

    #[test]
    fn exact_name_matches_name_or_local_name() {
        let state = ScanState::new(ScanOptions::default().exact_advertising_name(["Sensor"]), 0);

        assert!(state.passes_filters(&peripheral("a", Some("Sensor"), None)));
        assert!(state.passes_filters(&peripheral("b", Some("Other"), Some("Sensor"))));
        assert!(!state.passes_filters(&peripheral("c", Some("Sensor 2"), None)));
        assert!(!state.passes_filters(&peripheral("d", None, None)));
    }

    #[test]
    fn name_filter_needs_a_name() {
        let state = ScanState::new(ScanOptions::default().require_name(), 0);

        assert!(!state.passes_filters(&peripheral("a", None, None)));
        assert!(state.passes_filters(&peripheral("a", None, Some("x"))));
    }

    #[test]
    fn address_filter() {
        let state = ScanState::new(
            ScanOptions::default().filter_by_address(|id| id.as_str().starts_with("AA")),
            0,
        );

        assert!(state.passes_filters(&peripheral("AA:BB", None, None)));
        assert!(!state.passes_filters(&peripheral("CC:DD", None, None)));
    }

    #[test]
    fn match_limit_counts_distinct_devices() {
        let mut state = ScanState::new(ScanOptions::default().stop_after_matches(2), 0);
        let a = PeripheralId::from("a");

        assert!(!state.record_match(&a));
        assert!(!state.record_match(&a));
        assert!(state.record_match(&PeripheralId::from("b")));
    }

    #[test]
    fn unlimited_scan_never_hits_the_limit() {
        let mut state = ScanState::new(ScanOptions::default(), 0);
        for i in 0..100 {
            assert!(!state.record_match(&PeripheralId::new(i.to_string())));
        }
    }
}
