//! Metadata dumps: waiting for the module, running the dumper and exporting its `dump.cs`.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use textract_bolts::{os::base_package, tasks::CancellationToken, Error};

use crate::module::{wait_for_module, ModuleLocator};

/// Relative path of the artifact a dumper leaves in its output directory
pub const DUMP_ARTIFACT: &str = "files/dump.cs";

/// Produces a metadata dump of the target module
pub trait MetadataDumper: Send + Sync {
    /// Dump into `output_dir`, leaving [`DUMP_ARTIFACT`] there. Returns `true` on success.
    fn prepare_dump(&self, output_dir: &Path) -> bool;
}

/// A dumper that is not available; every dump fails
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDumper;

impl MetadataDumper for NoDumper {
    fn prepare_dump(&self, _output_dir: &Path) -> bool {
        log::error!("No metadata dumper registered");
        false
    }
}

/// Receives the outcome of a dump: a success flag and a human readable message
pub type DumpNotifier = Arc<dyn Fn(bool, &str) + Send + Sync>;

/// How a dump ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DumpOutcome {
    /// The module never showed up
    ModuleTimeout,
    /// The dumper reported failure
    DumpFailed,
    /// Dumped, and the artifact was exported to the given path
    Exported(PathBuf),
    /// Dumped, but exporting the artifact failed
    ExportFailed,
    /// Stopped by cancellation
    Cancelled,
}

impl DumpOutcome {
    /// Whether the dump itself succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exported(_) | Self::ExportFailed)
    }
}

impl fmt::Display for DumpOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModuleTimeout => f.write_str("Timed out waiting for the target module"),
            Self::DumpFailed => f.write_str("Dump failed, target module not found"),
            Self::Exported(path) => write!(f, "Dump finished, copied to {}", path.display()),
            Self::ExportFailed => {
                f.write_str("Dump finished, copying to the export directory failed")
            }
            Self::Cancelled => f.write_str("Dump cancelled"),
        }
    }
}

/// Everything one dump run needs
#[derive(Clone, Debug)]
pub struct DumpJob {
    /// Where the dumper writes
    pub output_dir: PathBuf,
    /// Where the artifact is copied to
    pub export_dir: PathBuf,
    /// Names the exported file
    pub process_name: String,
    /// Module to wait for
    pub module_name: String,
    /// How long to wait for it
    pub wait: Duration,
}

/// Copy `<output_dir>/files/dump.cs` to `<export_dir>/<base package>.cs`
pub fn export_dump(
    output_dir: &Path,
    export_dir: &Path,
    process_name: &str,
) -> Result<PathBuf, Error> {
    let source = output_dir.join(DUMP_ARTIFACT);
    let target = export_dir.join(format!("{}.cs", base_package(process_name)));
    std::fs::create_dir_all(export_dir)?;
    std::fs::copy(&source, &target)?;
    Ok(target)
}

impl DumpJob {
    /// Wait for the module, dump and export. Blocks; meant to run on a worker.
    pub fn run(
        &self,
        locator: &dyn ModuleLocator,
        dumper: &dyn MetadataDumper,
        token: &CancellationToken,
    ) -> DumpOutcome {
        let Some(module) = wait_for_module(locator, &self.module_name, self.wait, token) else {
            if token.is_cancelled() {
                return DumpOutcome::Cancelled;
            }
            log::error!("Dump: timed out waiting for {}", self.module_name);
            return DumpOutcome::ModuleTimeout;
        };

        log::info!("Dump begin, {module}");
        if !dumper.prepare_dump(&self.output_dir) {
            return DumpOutcome::DumpFailed;
        }

        match export_dump(&self.output_dir, &self.export_dir, &self.process_name) {
            Ok(path) => {
                log::info!("Copied dump to {}", path.display());
                DumpOutcome::Exported(path)
            }
            Err(err) => {
                log::error!("Copying dump failed: {err}");
                DumpOutcome::ExportFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use textract_bolts::tasks::CancellationToken;

    use super::{DumpJob, DumpOutcome, MetadataDumper, NoDumper, DUMP_ARTIFACT};
    use crate::module::tests::DelayedLocator;

    /// Writes a fixed artifact
    #[derive(Default)]
    struct WritingDumper {
        calls: AtomicUsize,
    }

    impl MetadataDumper for WritingDumper {
        fn prepare_dump(&self, output_dir: &Path) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let artifact = output_dir.join(DUMP_ARTIFACT);
            std::fs::create_dir_all(artifact.parent().unwrap()).unwrap();
            std::fs::write(artifact, "// RVA: 0x10\nvoid set_Text(string v) { }\n").is_ok()
        }
    }

    fn job(output: &Path, export: &Path, wait: Duration) -> DumpJob {
        DumpJob {
            output_dir: output.to_path_buf(),
            export_dir: export.join("Download"),
            process_name: "com.example.game:remote".to_string(),
            module_name: "libil2cpp.so".to_string(),
            wait,
        }
    }

    #[test]
    fn test_dump_exports_artifact() {
        let output = tempfile::tempdir().unwrap();
        let export = tempfile::tempdir().unwrap();
        let dumper = WritingDumper::default();

        let outcome = job(output.path(), export.path(), Duration::from_secs(5)).run(
            &DelayedLocator::new(0x7000_0000, 1),
            &dumper,
            &CancellationToken::new(),
        );

        let target = export.path().join("Download").join("com.example.game.cs");
        assert_eq!(outcome, DumpOutcome::Exported(target.clone()));
        assert!(outcome.is_success());
        assert!(std::fs::read_to_string(target).unwrap().contains("set_Text"));
        assert_eq!(dumper.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_module_timeout_skips_dumper() {
        let output = tempfile::tempdir().unwrap();
        let dumper = WritingDumper::default();
        let outcome = job(output.path(), output.path(), Duration::from_millis(150)).run(
            &DelayedLocator::new(0x7000_0000, usize::MAX),
            &dumper,
            &CancellationToken::new(),
        );
        assert_eq!(outcome, DumpOutcome::ModuleTimeout);
        assert!(!outcome.is_success());
        assert_eq!(dumper.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_dump_and_missing_artifact() {
        let output = tempfile::tempdir().unwrap();
        let locator = DelayedLocator::new(0x7000_0000, 0);
        let token = CancellationToken::new();
        let job = job(output.path(), output.path(), Duration::from_secs(1));

        assert_eq!(job.run(&locator, &NoDumper, &token), DumpOutcome::DumpFailed);

        struct Liar;
        impl MetadataDumper for Liar {
            fn prepare_dump(&self, _output_dir: &Path) -> bool {
                true
            }
        }
        let outcome = job.run(&locator, &Liar, &token);
        assert_eq!(outcome, DumpOutcome::ExportFailed);
        assert!(outcome.is_success());
    }

    #[test]
    fn test_cancelled() {
        let output = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let outcome = job(output.path(), output.path(), Duration::from_secs(30)).run(
            &DelayedLocator::new(0x7000_0000, usize::MAX),
            &NoDumper,
            &token,
        );
        assert_eq!(outcome, DumpOutcome::Cancelled);
    }
}
