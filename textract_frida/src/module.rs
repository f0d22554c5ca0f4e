//! Locating the target module in the address space of the current process.

use std::{
    fmt,
    time::{Duration, Instant, SystemTime},
};

use textract_bolts::{os::find_module_base, tasks::CancellationToken};

/// How often [`wait_for_module`] looks for the module
pub const MODULE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Resolves module names to load addresses
pub trait ModuleLocator: Send + Sync {
    /// The load address of the first mapping backed by `name`, or 0 if it is not loaded
    fn resolve_base(&self, name: &str) -> usize;
}

/// Finds modules by scanning `/proc/self/maps`
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcMapsLocator;

impl ModuleLocator for ProcMapsLocator {
    fn resolve_base(&self, name: &str) -> usize {
        find_module_base(name)
    }
}

/// A module resolved in the current process
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetModule {
    name: String,
    base: usize,
    resolved_at: SystemTime,
}

impl TargetModule {
    /// A module `name` loaded at `base`, resolved now
    #[must_use]
    pub fn new(name: &str, base: usize) -> Self {
        Self {
            name: name.to_string(),
            base,
            resolved_at: SystemTime::now(),
        }
    }

    /// The module name as it was looked up
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The load address
    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    /// When the module was found
    #[must_use]
    pub fn resolved_at(&self) -> SystemTime {
        self.resolved_at
    }

    /// The absolute address of `offset`, or `None` on overflow
    #[must_use]
    pub fn address_of(&self, offset: usize) -> Option<usize> {
        self.base.checked_add(offset)
    }
}

impl fmt::Display for TargetModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {:#x}", self.name, self.base)
    }
}

/// Poll `locator` every [`MODULE_POLL_INTERVAL`] until `name` is loaded.
///
/// Returns `None` if the module did not show up within `timeout` or `token` got cancelled.
pub fn wait_for_module(
    locator: &dyn ModuleLocator,
    name: &str,
    timeout: Duration,
    token: &CancellationToken,
) -> Option<TargetModule> {
    let deadline = Instant::now() + timeout;
    loop {
        let base = locator.resolve_base(name);
        if base != 0 {
            return Some(TargetModule::new(name, base));
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        if token.sleep(MODULE_POLL_INTERVAL.min(deadline - now)) {
            log::debug!("Stopped waiting for {name}: cancelled");
            return None;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, Instant},
    };

    use textract_bolts::tasks::CancellationToken;

    use super::{wait_for_module, ModuleLocator, ProcMapsLocator, TargetModule};

    /// Reports `base` once it was asked `after` times
    #[derive(Debug)]
    pub(crate) struct DelayedLocator {
        pub(crate) base: usize,
        pub(crate) after: usize,
        pub(crate) calls: AtomicUsize,
    }

    impl DelayedLocator {
        pub(crate) fn new(base: usize, after: usize) -> Self {
            Self {
                base,
                after,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ModuleLocator for DelayedLocator {
        fn resolve_base(&self, _name: &str) -> usize {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.after {
                self.base
            } else {
                0
            }
        }
    }

    #[test]
    fn test_address_of() {
        let module = TargetModule::new("libil2cpp.so", 0x7000_0000);
        assert_eq!(module.address_of(0x1000), Some(0x7000_1000));
        assert_eq!(module.address_of(usize::MAX), None);
        assert_eq!(module.to_string(), "libil2cpp.so @ 0x70000000");
    }

    #[test]
    fn test_wait_succeeds_after_polls() {
        let locator = DelayedLocator::new(0x7000_0000, 2);
        let module = wait_for_module(
            &locator,
            "libil2cpp.so",
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(module.base(), 0x7000_0000);
        assert_eq!(locator.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_wait_times_out() {
        let locator = DelayedLocator::new(0x7000_0000, usize::MAX);
        let start = Instant::now();
        let module = wait_for_module(
            &locator,
            "libil2cpp.so",
            Duration::from_millis(350),
            &CancellationToken::new(),
        );
        assert!(module.is_none());
        assert!(start.elapsed() >= Duration::from_millis(350));
        // polled at a 100ms cadence
        assert!(locator.calls.load(Ordering::SeqCst) >= 4);
    }

    #[test]
    fn test_wait_cancelled() {
        let locator = DelayedLocator::new(1, usize::MAX);
        let token = CancellationToken::new();
        token.cancel();
        let start = Instant::now();
        assert!(wait_for_module(&locator, "x", Duration::from_secs(30), &token).is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn test_proc_maps_locator() {
        assert_eq!(ProcMapsLocator.resolve_base("definitely-not-mapped.so"), 0);
    }
}
