//! Preparing module-resident symbols once the target module is mapped.

use std::{
    ffi::c_void,
    sync::atomic::{AtomicUsize, Ordering},
};

use libloading::os::unix::{Library, Symbol};
use textract_bolts::{os::find_module_path, Error};

use crate::{elf::find_export_in_elf, module::TargetModule};

/// Runs after the target module resolved and before any hook is installed.
/// A failing preparer ends the attach cycle.
pub trait ModulePreparer: Send + Sync {
    /// Prepare whatever `module` must provide
    fn prepare(&self, module: &TargetModule) -> Result<(), Error>;
}

/// A preparer that needs nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NopPreparer;

impl ModulePreparer for NopPreparer {
    fn prepare(&self, _module: &TargetModule) -> Result<(), Error> {
        Ok(())
    }
}

fn open_noload(name: &str) -> Option<Library> {
    unsafe { Library::open(Some(name), libc::RTLD_NOW | libc::RTLD_NOLOAD) }.ok()
}

/// Resolves the runtime's string factory export (`il2cpp_string_new` for Il2Cpp) from the
/// already loaded module.
///
/// Lookup order: the module by name, the module by its mapped path, the global scope of the
/// process, and finally the dynamic symbol table of the mapped file relocated to the module
/// base. The module is never loaded by this resolver.
#[derive(Debug)]
pub struct StringFactoryResolver {
    symbol: String,
    address: AtomicUsize,
}

impl StringFactoryResolver {
    /// Create a resolver for `symbol`
    #[must_use]
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            address: AtomicUsize::new(0),
        }
    }

    /// The export this resolver looks for
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// The resolved address, if [`ModulePreparer::prepare`] succeeded
    #[must_use]
    pub fn address(&self) -> Option<usize> {
        match self.address.load(Ordering::Acquire) {
            0 => None,
            address => Some(address),
        }
    }

    fn lookup(&self, library: &Library) -> Option<usize> {
        let symbol: Symbol<*mut c_void> = unsafe { library.get(self.symbol.as_bytes()) }.ok()?;
        let address = *symbol as usize;
        (address != 0).then_some(address)
    }

    /// Read the export straight from the module file. Linker namespaces may hide it from
    /// `dlsym` even though the module is mapped.
    fn lookup_in_file(&self, module: &TargetModule) -> Option<usize> {
        let path = find_module_path(module.name())?;
        match find_export_in_elf(&path, &self.symbol, module.base()) {
            Ok(address) => address,
            Err(err) => {
                log::error!("Cannot read the exports of {path}: {err}");
                None
            }
        }
    }
}

impl ModulePreparer for StringFactoryResolver {
    fn prepare(&self, module: &TargetModule) -> Result<(), Error> {
        if self.address().is_some() {
            return Ok(());
        }

        let mut candidates = Vec::with_capacity(3);
        if let Some(library) = open_noload(module.name()) {
            candidates.push(library);
        }
        if let Some(library) = find_module_path(module.name()).and_then(|path| open_noload(&path))
        {
            candidates.push(library);
        }
        candidates.push(Library::this());

        let address = candidates
            .iter()
            .find_map(|library| self.lookup(library))
            .or_else(|| self.lookup_in_file(module))
            .ok_or_else(|| {
                Error::key_not_found(format!(
                    "cannot find {} in {}, its file or the global scope",
                    self.symbol,
                    module.name()
                ))
            })?;

        self.address.store(address, Ordering::Release);
        log::info!("Resolved {} @ {address:#x}", self.symbol);
        Ok(())
    }
}
