//! The frida-gum backed [`InterceptorEngine`].

use std::{ffi::c_void, sync::Arc, sync::OnceLock};

use frida_gum::{
    interceptor::{Interceptor, InvocationContext, InvocationListener, Listener},
    Gum, NativePointer,
};
use hashbrown::HashMap;
use textract_bolts::Error;

use crate::{
    arch::{Register, RegisterContext},
    engine::{InterceptCallback, InterceptorEngine},
};

static GUM: OnceLock<Gum> = OnceLock::new();

/// The process wide gum instance
#[allow(unused_unsafe)]
pub fn gum() -> &'static Gum {
    GUM.get_or_init(|| unsafe { Gum::obtain() })
}

/// Index of the integer argument held by `register`
fn argument_index(register: Register) -> Option<u32> {
    match register {
        Register::X(n) if n < 8 => Some(u32::from(n)),
        Register::R(n) if n < 4 => Some(u32::from(n)),
        Register::Rdi => Some(0),
        Register::Rsi => Some(1),
        Register::Rdx => Some(2),
        Register::Rcx => Some(3),
        Register::R8 => Some(4),
        Register::R9 => Some(5),
        _ => None,
    }
}

/// Argument registers of an intercepted call
struct InvocationRegisters<'a, 'b> {
    invocation: &'a InvocationContext<'b>,
}

impl RegisterContext for InvocationRegisters<'_, '_> {
    fn read(&self, register: Register) -> Option<u64> {
        argument_index(register).map(|index| self.invocation.arg(index) as u64)
    }

    fn write(&mut self, register: Register, value: u64) -> bool {
        match argument_index(register) {
            Some(index) => {
                self.invocation.set_arg(index, value as usize);
                true
            }
            None => false,
        }
    }
}

struct TextListener {
    address: usize,
    callback: Arc<dyn InterceptCallback>,
}

impl InvocationListener for TextListener {
    fn on_enter(&mut self, context: InvocationContext) {
        let mut registers = InvocationRegisters {
            invocation: &context,
        };
        self.callback.on_call(self.address, &mut registers);
    }

    fn on_leave(&mut self, _context: InvocationContext) {}
}

struct Attached {
    // Frida keeps a pointer to the listener, it has to stay put until detached.
    _listener: Box<TextListener>,
    handle: Listener,
}

/// Installs interceptors with frida's `Interceptor`
pub struct FridaEngine {
    interceptor: Interceptor,
    attached: HashMap<usize, Attached>,
}

impl std::fmt::Debug for FridaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FridaEngine")
            .field("attached", &self.attached.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

// The interceptor is a handle to gum's process wide interceptor and is only touched under the
// orchestrator lock.
unsafe impl Send for FridaEngine {}

impl FridaEngine {
    /// Obtain the interceptor
    #[must_use]
    pub fn new() -> Self {
        Self {
            interceptor: Interceptor::obtain(gum()),
            attached: HashMap::new(),
        }
    }
}

impl Default for FridaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InterceptorEngine for FridaEngine {
    fn install(
        &mut self,
        address: usize,
        callback: Arc<dyn InterceptCallback>,
    ) -> Result<(), Error> {
        if self.attached.contains_key(&address) {
            return Err(Error::illegal_state(format!("{address:#x} is already hooked")));
        }
        let mut listener = Box::new(TextListener { address, callback });
        let handle = self
            .interceptor
            .attach(NativePointer(address as *mut c_void), listener.as_mut())
            .map_err(|err| Error::unknown(format!("attach at {address:#x} failed: {err:?}")))?;
        self.attached.insert(
            address,
            Attached {
                _listener: listener,
                handle,
            },
        );
        Ok(())
    }

    fn uninstall(&mut self, address: usize) -> Result<(), Error> {
        let attached = self
            .attached
            .remove(&address)
            .ok_or_else(|| Error::key_not_found(format!("no hook at {address:#x}")))?;
        self.interceptor.detach(attached.handle);
        Ok(())
    }
}
