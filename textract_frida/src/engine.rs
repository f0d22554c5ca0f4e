//! The seam to the instrumentation engine that actually patches code.

use std::{fmt, sync::Arc};

use textract_bolts::Error;

use crate::arch::RegisterContext;

/// Called by the engine on every hit of an installed interceptor, before the original code
/// runs. May be invoked from any thread, concurrently.
pub trait InterceptCallback: Send + Sync {
    /// `address` is the hooked address that was hit
    fn on_call(&self, address: usize, registers: &mut dyn RegisterContext);
}

impl fmt::Debug for dyn InterceptCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InterceptCallback")
    }
}

/// An engine able to place interceptors at arbitrary addresses
pub trait InterceptorEngine: Send {
    /// Install `callback` at `address`
    fn install(&mut self, address: usize, callback: Arc<dyn InterceptCallback>)
        -> Result<(), Error>;

    /// Remove the interceptor at `address`
    fn uninstall(&mut self, address: usize) -> Result<(), Error>;
}

impl<E> InterceptorEngine for Box<E>
where
    E: InterceptorEngine + ?Sized,
{
    fn install(
        &mut self,
        address: usize,
        callback: Arc<dyn InterceptCallback>,
    ) -> Result<(), Error> {
        (**self).install(address, callback)
    }

    fn uninstall(&mut self, address: usize) -> Result<(), Error> {
        (**self).uninstall(address)
    }
}
