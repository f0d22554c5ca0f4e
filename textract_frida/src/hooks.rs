//! Hook orchestration: turns the configured offsets into installed interceptors and keeps the
//! address → offset registry the interception callback reads.
//!
//! Mutation (reconfigure, install, teardown) is serialized by one lock. The registry the
//! callback sees is an immutable snapshot behind an [`Arc`]; a new snapshot is published with a
//! single pointer swap and a retired one is freed once the last in-flight callback drops it.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
};

use hashbrown::HashMap;

use crate::{
    arch::{ArgumentAccessor, CallingConvention, RegisterContext},
    decoder::{describe, ManagedString},
    engine::{InterceptCallback, InterceptorEngine},
    filter::TextFilter,
    module::TargetModule,
    options::format_offset,
    store::TextStore,
};

/// Maps installed absolute addresses back to the configured offsets
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HookRegistry {
    targets: HashMap<usize, usize>,
}

impl HookRegistry {
    /// The offset hooked at `address`
    #[must_use]
    pub fn offset_of(&self, address: usize) -> Option<usize> {
        self.targets.get(&address).copied()
    }

    /// Number of hooked addresses
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// `true` if nothing is hooked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// `true` if `address` is hooked
    #[must_use]
    pub fn contains(&self, address: usize) -> bool {
        self.targets.contains_key(&address)
    }
}

/// The currently published [`HookRegistry`]
#[derive(Debug, Default)]
pub struct LiveRegistry(RwLock<Arc<HookRegistry>>);

impl LiveRegistry {
    /// A snapshot of the live registry. Holding it keeps it alive, even across a republish.
    #[must_use]
    pub fn load(&self) -> Arc<HookRegistry> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the live registry, returning the previous one
    pub fn publish(&self, registry: Arc<HookRegistry>) -> Arc<HookRegistry> {
        let mut live = self.0.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *live, registry)
    }
}

fn describe_offset(offset: Option<usize>) -> String {
    offset.map_or_else(|| "unknown".to_string(), format_offset)
}

/// The interception callback: decodes the string passed to a hooked setter and stores it.
#[derive(Debug)]
pub struct TextHook {
    live: Arc<LiveRegistry>,
    accessor: ArgumentAccessor,
    filter: TextFilter,
    store: Arc<TextStore>,
}

impl TextHook {
    /// Create the callback. `live` must be the registry the orchestrator publishes to.
    #[must_use]
    pub fn new(
        live: Arc<LiveRegistry>,
        accessor: ArgumentAccessor,
        filter: TextFilter,
        store: Arc<TextStore>,
    ) -> Self {
        Self {
            live,
            accessor,
            filter,
            store,
        }
    }
}

impl InterceptCallback for TextHook {
    fn on_call(&self, address: usize, registers: &mut dyn RegisterContext) {
        let offset = self.live.load().offset_of(address);

        let Some(argument) = self.accessor.second_argument(registers) else {
            log::trace!(
                "[Setter] offset {}: argument register unavailable",
                describe_offset(offset)
            );
            return;
        };

        // The engine hands us the live argument of a setter taking a managed string.
        let text = unsafe { describe(argument as *const ManagedString) };
        if text.is_empty() {
            return;
        }

        let decoded = self.filter.judge(text);
        if !decoded.accepted {
            log::info!(
                "[Setter] offset {} filtered: #{}#",
                describe_offset(offset),
                decoded.text
            );
            return;
        }

        log::info!("[Setter] offset {} {}", describe_offset(offset), decoded.text);
        if let Err(err) = self.store.insert_if_needed(&decoded.text) {
            log::error!("Dropping text {:?}: {err}", decoded.text);
        }
    }
}

struct HookState<E> {
    engine: E,
    offsets: Vec<usize>,
    installed: Vec<usize>,
    module: Option<TargetModule>,
    shut_down: bool,
}

/// Owns the offsets, the installed interceptors and the published registry
pub struct HookOrchestrator<E> {
    state: Mutex<HookState<E>>,
    live: Arc<LiveRegistry>,
    callback: Arc<dyn InterceptCallback>,
    convention: CallingConvention,
    unsupported_logged: AtomicBool,
}

impl<E> fmt::Debug for HookOrchestrator<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("HookOrchestrator")
            .field("offsets", &state.offsets)
            .field("installed", &state.installed)
            .field("module", &state.module)
            .field("shut_down", &state.shut_down)
            .field("convention", &self.convention)
            .finish_non_exhaustive()
    }
}

impl<E> HookOrchestrator<E>
where
    E: InterceptorEngine,
{
    /// Create a new orchestrator installing `callback` through `engine` and publishing to
    /// `live`
    pub fn new(
        engine: E,
        callback: Arc<dyn InterceptCallback>,
        live: Arc<LiveRegistry>,
        convention: CallingConvention,
    ) -> Self {
        Self {
            state: Mutex::new(HookState {
                engine,
                offsets: Vec::new(),
                installed: Vec::new(),
                module: None,
                shut_down: false,
            }),
            live,
            callback,
            convention,
            unsupported_logged: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HookState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the offsets. If the module is already resolved, the hooks are reinstalled right
    /// away and `true` is returned; otherwise they are installed once it resolves.
    pub fn reconfigure(&self, offsets: &[usize]) -> bool {
        let mut state = self.lock();
        state.offsets = offsets.to_vec();
        log::info!("Updated offset list, {} entries", state.offsets.len());

        if state.module.is_none() || state.shut_down {
            return false;
        }
        self.install_locked(&mut state);
        true
    }

    /// Remember the resolved module and install the configured offsets
    pub fn on_module_resolved(&self, module: TargetModule) {
        let mut state = self.lock();
        state.module = Some(module);
        self.install_locked(&mut state);
    }

    /// Tear down and reinstall every configured offset
    pub fn install(&self) {
        let mut state = self.lock();
        self.install_locked(&mut state);
    }

    /// Remove every installed interceptor
    pub fn teardown(&self) {
        let mut state = self.lock();
        self.teardown_locked(&mut state);
    }

    /// Remove every installed interceptor for good. Later installs, reconfigurations and
    /// module resolutions only update the state and hook nothing.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shut_down = true;
        self.teardown_locked(&mut state);
    }

    /// `true` once [`HookOrchestrator::shutdown`] ran
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    /// The currently configured offsets
    #[must_use]
    pub fn offsets(&self) -> Vec<usize> {
        self.lock().offsets.clone()
    }

    /// The addresses currently hooked, in installation order
    #[must_use]
    pub fn installed_targets(&self) -> Vec<usize> {
        self.lock().installed.clone()
    }

    /// The resolved module, if any
    #[must_use]
    pub fn module(&self) -> Option<TargetModule> {
        self.lock().module.clone()
    }

    /// A snapshot of the live registry
    #[must_use]
    pub fn registry(&self) -> Arc<HookRegistry> {
        self.live.load()
    }

    fn teardown_locked(&self, state: &mut HookState<E>) {
        // Retire the registry first, so no published address lacks an interceptor.
        self.live.publish(Arc::default());

        for address in state.installed.drain(..) {
            if let Err(err) = state.engine.uninstall(address) {
                log::error!("Removing hook @ {address:#x} failed: {err}");
            }
        }
    }

    fn install_locked(&self, state: &mut HookState<E>) {
        self.teardown_locked(state);

        if state.shut_down {
            log::debug!("Shut down, not installing hooks");
            return;
        }

        if !self.convention.is_supported() {
            if !self.unsupported_logged.swap(true, Ordering::Relaxed) {
                log::error!("Text interception is not supported on {:?}", self.convention);
            }
            return;
        }

        let Some(module) = state.module.clone() else {
            log::info!("Target module not resolved yet, skipping hook installation");
            return;
        };

        if state.offsets.is_empty() {
            log::info!("No offsets configured, skipping hook installation");
            return;
        }

        let mut registry = HookRegistry::default();
        let offsets = state.offsets.clone();
        for offset in offsets {
            let Some(address) = module.address_of(offset) else {
                log::error!("Offset {offset:#x} overflows the base of {module}");
                continue;
            };
            if registry.contains(address) {
                log::debug!("Offset {offset:#x} is configured twice");
                continue;
            }
            match state.engine.install(address, self.callback.clone()) {
                Ok(()) => {
                    state.installed.push(address);
                    registry.targets.insert(address, offset);
                    log::info!("Hooked offset {offset:#x} @ {address:#x}");
                }
                Err(err) => log::error!("Hooking offset {offset:#x} failed: {err}"),
            }
        }

        self.live.publish(Arc::new(registry));
    }
}
