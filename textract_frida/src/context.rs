//! The per-attach lifecycle: one [`TextractContext`] ties the locator, the store, the hook
//! orchestrator and the dump machinery together and runs their slow parts on workers.

use std::{
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
};

use textract_bolts::{
    tasks::{CancellationToken, TaskHandle, WorkerPool},
    Error,
};

use crate::{
    arch::{ArgumentAccessor, CallingConvention},
    dump::{DumpJob, DumpNotifier, MetadataDumper, NoDumper},
    engine::InterceptorEngine,
    filter::TextFilter,
    hooks::{HookOrchestrator, LiveRegistry, TextHook},
    module::{wait_for_module, ModuleLocator, ProcMapsLocator},
    options::TextractOptions,
    store::TextStore,
    symbols::{ModulePreparer, StringFactoryResolver},
};

/// Builds a [`TextractContext`]. Only the engine is mandatory; everything else defaults to the
/// in-process implementations.
pub struct TextractContextBuilder {
    options: TextractOptions,
    engine: Box<dyn InterceptorEngine>,
    locator: Option<Arc<dyn ModuleLocator>>,
    preparer: Option<Arc<dyn ModulePreparer>>,
    dumper: Option<Arc<dyn MetadataDumper>>,
    notifier: Option<DumpNotifier>,
    convention: CallingConvention,
}

impl fmt::Debug for TextractContextBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextractContextBuilder")
            .field("options", &self.options)
            .field("convention", &self.convention)
            .finish_non_exhaustive()
    }
}

impl TextractContextBuilder {
    /// Start building a context hooking through `engine`
    #[must_use]
    pub fn new(options: TextractOptions, engine: Box<dyn InterceptorEngine>) -> Self {
        Self {
            options,
            engine,
            locator: None,
            preparer: None,
            dumper: None,
            notifier: None,
            convention: CallingConvention::host(),
        }
    }

    /// Find modules with `locator` instead of `/proc/self/maps`
    #[must_use]
    pub fn locator(mut self, locator: Arc<dyn ModuleLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Replace the string factory resolver
    #[must_use]
    pub fn preparer(mut self, preparer: Arc<dyn ModulePreparer>) -> Self {
        self.preparer = Some(preparer);
        self
    }

    /// The dumper used by [`TextractContext::request_dump`]
    #[must_use]
    pub fn dumper(mut self, dumper: Arc<dyn MetadataDumper>) -> Self {
        self.dumper = Some(dumper);
        self
    }

    /// Who hears about finished dumps
    #[must_use]
    pub fn notifier(mut self, notifier: DumpNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Override the calling convention of the host
    #[must_use]
    pub fn convention(mut self, convention: CallingConvention) -> Self {
        self.convention = convention;
        self
    }

    /// Build the context. Fails if a filter pattern does not compile.
    pub fn build(self) -> Result<Arc<TextractContext>, Error> {
        let filter = TextFilter::with_patterns(&self.options.filter_patterns)?;
        let store = Arc::new(TextStore::new(&self.options.store_root));
        let live = Arc::new(LiveRegistry::default());
        let callback = Arc::new(TextHook::new(
            live.clone(),
            ArgumentAccessor::new(self.convention),
            filter,
            store.clone(),
        ));
        let orchestrator = HookOrchestrator::new(self.engine, callback, live, self.convention);
        if !self.options.offsets.is_empty() {
            orchestrator.reconfigure(&self.options.offsets);
        }

        let preparer = self.preparer.unwrap_or_else(|| {
            Arc::new(StringFactoryResolver::new(&self.options.string_factory))
        });

        Ok(Arc::new(TextractContext {
            pool: WorkerPool::new(self.options.max_workers),
            locator: self.locator.unwrap_or_else(|| Arc::new(ProcMapsLocator)),
            preparer,
            dumper: RwLock::new(self.dumper.unwrap_or_else(|| Arc::new(NoDumper))),
            notifier: RwLock::new(self.notifier),
            options: self.options,
            orchestrator,
            store,
            process_name: Mutex::new(None),
            attached: AtomicBool::new(false),
            dump_started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

/// Everything one attached process needs
pub struct TextractContext {
    options: TextractOptions,
    locator: Arc<dyn ModuleLocator>,
    preparer: Arc<dyn ModulePreparer>,
    dumper: RwLock<Arc<dyn MetadataDumper>>,
    notifier: RwLock<Option<DumpNotifier>>,
    orchestrator: HookOrchestrator<Box<dyn InterceptorEngine>>,
    store: Arc<TextStore>,
    process_name: Mutex<Option<String>>,
    attached: AtomicBool,
    dump_started: AtomicBool,
    shutting_down: AtomicBool,
    pool: WorkerPool,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl fmt::Debug for TextractContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextractContext")
            .field("options", &self.options)
            .field("orchestrator", &self.orchestrator)
            .field("attached", &self.is_attached())
            .field("dump_started", &self.is_dumping())
            .finish_non_exhaustive()
    }
}

impl TextractContext {
    /// Shorthand for [`TextractContextBuilder::new`]
    #[must_use]
    pub fn builder(
        options: TextractOptions,
        engine: Box<dyn InterceptorEngine>,
    ) -> TextractContextBuilder {
        TextractContextBuilder::new(options, engine)
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<TaskHandle>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn<F>(&self, name: &str, task: F) -> Result<(), Error>
    where
        F: FnOnce(&CancellationToken) + Send + 'static,
    {
        let mut tasks = self.tasks();
        // checked under the tasks lock, so shutdown cannot miss the new worker
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::shutting_down());
        }
        tasks.retain(|task| !task.is_finished());
        let handle = self.pool.spawn(name, task)?;
        tasks.push(handle);
        Ok(())
    }

    /// Start extracting in the process `process_name`.
    ///
    /// Only the first call does anything; it returns `true`. The store, the module wait, the
    /// symbol preparation and the first install all run on a worker.
    pub fn attach(self: &Arc<Self>, process_name: &str) -> Result<bool, Error> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::shutting_down());
        }
        if self.attached.swap(true, Ordering::AcqRel) {
            log::debug!("Already attached, ignoring {process_name}");
            return Ok(false);
        }

        let process_name = if process_name.is_empty() {
            "unknown".to_string()
        } else {
            process_name.to_string()
        };
        *self
            .process_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(process_name.clone());

        let context = self.clone();
        let spawned = self.spawn("textract-attach", move |token| {
            context.attach_worker(&process_name, token);
        });
        if let Err(err) = spawned {
            self.attached.store(false, Ordering::Release);
            return Err(err);
        }
        Ok(true)
    }

    fn attach_worker(&self, process_name: &str, token: &CancellationToken) {
        if let Err(err) = self.store.init(process_name) {
            log::error!("Cannot open the text store for {process_name}: {err}");
            return;
        }

        let module_name = &self.options.module_name;
        let Some(module) = wait_for_module(
            self.locator.as_ref(),
            module_name,
            self.options.module_wait(),
            token,
        ) else {
            if !token.is_cancelled() {
                log::error!(
                    "{module_name} not loaded after {}ms, not hooking",
                    self.options.module_wait_ms
                );
            }
            return;
        };
        log::info!("Found {module}");

        if token.is_cancelled() {
            return;
        }
        if let Err(err) = self.preparer.prepare(&module) {
            log::error!("Preparing {module_name} failed: {err}");
            return;
        }

        self.orchestrator.on_module_resolved(module);
    }

    /// Replace the hooked offsets.
    ///
    /// Returns `true` if the hooks were reinstalled right away, `false` if they wait for the
    /// module. Fails with [`Error::ShuttingDown`] after [`TextractContext::shutdown`].
    pub fn configure(&self, offsets: &[usize]) -> Result<bool, Error> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::shutting_down());
        }
        Ok(self.orchestrator.reconfigure(offsets))
    }

    /// Dump the module metadata into `output_dir` on a worker.
    ///
    /// Returns `false` without doing anything if `output_dir` is empty or a dump is already
    /// running.
    pub fn request_dump<P: AsRef<Path>>(self: &Arc<Self>, output_dir: P) -> Result<bool, Error> {
        let output_dir = output_dir.as_ref();
        if output_dir.as_os_str().is_empty() {
            log::error!("Dump skipped: output directory is empty");
            return Ok(false);
        }
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::shutting_down());
        }
        if self.dump_started.swap(true, Ordering::AcqRel) {
            log::debug!("Dump already running");
            return Ok(false);
        }

        let job = DumpJob {
            output_dir: output_dir.to_path_buf(),
            export_dir: self.options.export_dir.clone(),
            process_name: self.process_name(),
            module_name: self.options.module_name.clone(),
            wait: self.options.dump_wait(),
        };
        let context = self.clone();
        let spawned = self.spawn("textract-dump", move |token| {
            let dumper = context
                .dumper
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let outcome = job.run(context.locator.as_ref(), dumper.as_ref(), token);
            context.dump_started.store(false, Ordering::Release);
            context.notify(outcome.is_success(), &outcome.to_string());
        });
        if let Err(err) = spawned {
            self.dump_started.store(false, Ordering::Release);
            return Err(err);
        }
        Ok(true)
    }

    fn notify(&self, success: bool, message: &str) {
        let notifier = self
            .notifier
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match notifier {
            Some(notifier) => notifier(success, message),
            None => log::info!("Dump finished ({success}): {message}"),
        }
    }

    /// Replace the dumper used by later dumps
    pub fn set_dumper(&self, dumper: Arc<dyn MetadataDumper>) {
        *self.dumper.write().unwrap_or_else(PoisonError::into_inner) = dumper;
    }

    /// Replace the dump notifier
    pub fn set_notifier(&self, notifier: Option<DumpNotifier>) {
        *self.notifier.write().unwrap_or_else(PoisonError::into_inner) = notifier;
    }

    /// Cancel and join every worker, then remove all hooks for good. Later calls are no-ops.
    ///
    /// May be called from a worker, e.g. from the dump notifier. That worker is cancelled but
    /// not joined.
    pub fn shutdown(&self) {
        let tasks: Vec<_> = {
            let mut tasks = self.tasks();
            if self.shutting_down.swap(true, Ordering::AcqRel) {
                return;
            }
            tasks.drain(..).collect()
        };
        for task in &tasks {
            task.cancel();
        }
        for task in tasks {
            if task.is_current() {
                log::debug!("Shutdown runs on {}, not joining it", task.name());
                continue;
            }
            let name = task.name().to_string();
            if let Err(err) = task.join() {
                log::error!("Worker {name} ended badly: {err}");
            }
        }
        self.orchestrator.shutdown();
        log::info!("Shut down");
    }

    /// `true` once [`TextractContext::attach`] started a worker
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// `true` while a dump is running
    #[must_use]
    pub fn is_dumping(&self) -> bool {
        self.dump_started.load(Ordering::Acquire)
    }

    /// The process name given to [`TextractContext::attach`], `unknown` before that
    #[must_use]
    pub fn process_name(&self) -> String {
        self.process_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// The options this context was built with
    #[must_use]
    pub fn options(&self) -> &TextractOptions {
        &self.options
    }

    /// The hook orchestrator
    #[must_use]
    pub fn orchestrator(&self) -> &HookOrchestrator<Box<dyn InterceptorEngine>> {
        &self.orchestrator
    }

    /// The text store
    #[must_use]
    pub fn store(&self) -> &Arc<TextStore> {
        &self.store
    }

    /// Number of workers still running
    #[must_use]
    pub fn running_workers(&self) -> usize {
        self.pool.active()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex, Weak,
        },
        time::{Duration, Instant},
    };

    use textract_bolts::Error;

    use super::TextractContext;
    use crate::{
        arch::{tests::FakeRegisters, CallingConvention, Register},
        decoder::tests::{utf16, OwnedManagedString},
        dump::DumpNotifier,
        engine::tests::RecordingEngine,
        module::{tests::DelayedLocator, TargetModule},
        options::TextractOptions,
        symbols::NopPreparer,
    };

    fn wait_until(what: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if what() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn options(root: &std::path::Path) -> TextractOptions {
        TextractOptions {
            store_root: root.to_path_buf(),
            export_dir: root.join("Download"),
            module_wait_ms: 2_000,
            dump_wait_ms: 200,
            offsets: vec![0x1000, 0x2000],
            ..TextractOptions::default()
        }
    }

    #[test]
    fn test_attach_installs_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::default();
        let context = TextractContext::builder(options(dir.path()), Box::new(engine.clone()))
            .locator(Arc::new(DelayedLocator::new(0x7000_0000, 2)))
            .preparer(Arc::new(NopPreparer))
            .convention(CallingConvention::Aarch64)
            .build()
            .unwrap();

        assert!(context.attach("com.example.game:remote").unwrap());
        assert!(!context.attach("com.example.game").unwrap());
        assert!(wait_until(|| engine.active().len() == 2));
        assert_eq!(engine.active(), vec![0x7000_1000, 0x7000_2000]);
        assert_eq!(context.process_name(), "com.example.game:remote");

        let string = OwnedManagedString::with_length(utf16::<9>("Hook Test"), 9);
        let mut registers = FakeRegisters::default();
        registers.0.insert(Register::X(1), string.as_ptr() as u64);
        assert!(engine.hit(0x7000_1000, &mut registers));
        assert!(engine.hit(0x7000_2000, &mut registers));
        assert_eq!(context.store().texts().unwrap(), vec!["Hook Test".to_string()]);

        assert!(context.configure(&[0x3000]).unwrap());
        assert_eq!(engine.active(), vec![0x7000_3000]);

        context.shutdown();
        assert!(engine.active().is_empty());
        assert!(matches!(
            context.attach("com.example.game"),
            Err(Error::ShuttingDown)
        ));
    }

    #[test]
    fn test_nothing_runs_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::default();
        let context = TextractContext::builder(options(dir.path()), Box::new(engine.clone()))
            .locator(Arc::new(DelayedLocator::new(0x7000_0000, 0)))
            .preparer(Arc::new(NopPreparer))
            .build()
            .unwrap();

        // not resolved yet: the offsets wait for the module
        assert!(!context.configure(&[0x1000]).unwrap());
        assert!(context.attach("com.example.game").unwrap());
        assert!(wait_until(|| engine.active() == vec![0x7000_1000]));

        context.shutdown();
        assert!(engine.active().is_empty());
        assert!(matches!(
            context.configure(&[0x1000, 0x2000]),
            Err(Error::ShuttingDown)
        ));
        assert!(matches!(
            context.request_dump(dir.path()),
            Err(Error::ShuttingDown)
        ));
        assert!(!context.is_dumping());

        // a worker that outlived shutdown cannot hook either
        context
            .orchestrator()
            .on_module_resolved(TargetModule::new("libil2cpp.so", 0x7000_0000));
        assert!(!context.orchestrator().reconfigure(&[0x2000]));
        assert!(engine.active().is_empty());
        assert_eq!(context.running_workers(), 0);
    }

    #[test]
    fn test_shutdown_from_dump_notifier() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::default();
        let context = TextractContext::builder(options(dir.path()), Box::new(engine.clone()))
            .locator(Arc::new(DelayedLocator::new(0x7000_0000, 0)))
            .preparer(Arc::new(NopPreparer))
            .build()
            .unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let finished = done.clone();
        let weak: Weak<TextractContext> = Arc::downgrade(&context);
        let notifier: DumpNotifier = Arc::new(move |_success: bool, _message: &str| {
            if let Some(context) = weak.upgrade() {
                context.shutdown();
            }
            finished.store(true, Ordering::SeqCst);
        });
        context.set_notifier(Some(notifier));

        assert!(context.attach("com.example.game").unwrap());
        assert!(wait_until(|| engine.active().len() == 2));
        assert!(context.request_dump(dir.path().join("dump")).unwrap());

        assert!(wait_until(|| done.load(Ordering::SeqCst)));
        assert!(wait_until(|| context.running_workers() == 0));
        assert!(engine.active().is_empty());
        assert!(context.orchestrator().is_shut_down());
        assert!(matches!(
            context.attach("com.example.game"),
            Err(Error::ShuttingDown)
        ));
        // a second shutdown from the owner is a no-op
        context.shutdown();
    }

    #[test]
    fn test_module_never_loads() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::default();
        let mut options = options(dir.path());
        options.module_wait_ms = 200;
        let context = TextractContext::builder(options, Box::new(engine.clone()))
            .locator(Arc::new(DelayedLocator::new(0x7000_0000, usize::MAX)))
            .preparer(Arc::new(NopPreparer))
            .build()
            .unwrap();

        context.attach("com.example.game").unwrap();
        assert!(wait_until(|| context.running_workers() == 0));
        assert!(engine.installs().is_empty());
        assert!(context.orchestrator().module().is_none());
        // the store is still initialised
        assert_eq!(context.store().count().unwrap(), 0);
        context.shutdown();
    }

    #[test]
    fn test_shutdown_cancels_wait() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = options(dir.path());
        options.module_wait_ms = 60_000;
        let context = TextractContext::builder(options, Box::new(RecordingEngine::default()))
            .locator(Arc::new(DelayedLocator::new(0x7000_0000, usize::MAX)))
            .preparer(Arc::new(NopPreparer))
            .build()
            .unwrap();

        context.attach("com.example.game").unwrap();
        let start = Instant::now();
        context.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(context.running_workers(), 0);
    }

    #[test]
    fn test_dump_requests() {
        let dir = tempfile::tempdir().unwrap();
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let engine = RecordingEngine::default();
        let context = TextractContext::builder(options(dir.path()), Box::new(engine))
            .locator(Arc::new(DelayedLocator::new(0x7000_0000, usize::MAX)))
            .preparer(Arc::new(NopPreparer))
            .notifier(Arc::new(move |success: bool, message: &str| {
                sink.lock().unwrap().push((success, message.to_string()));
            }))
            .build()
            .unwrap();

        assert!(!context.request_dump("").unwrap());
        assert!(context.request_dump(dir.path()).unwrap());
        // a second request while the first waits is ignored
        assert!(!context.request_dump(dir.path()).unwrap());

        assert!(wait_until(|| !results.lock().unwrap().is_empty()));
        let results = results.lock().unwrap().clone();
        assert_eq!(results.len(), 1);
        assert!(!results[0].0);
        assert!(!context.is_dumping());
        context.shutdown();
    }

    #[test]
    fn test_bad_filter_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = options(dir.path());
        options.filter_patterns.push("(".to_string());
        assert!(TextractContext::builder(options, Box::new(RecordingEngine::default()))
            .build()
            .is_err());
    }
}
