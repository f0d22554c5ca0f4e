//! Calling-convention aware access to the argument registers of an intercepted call.
//!
//! The instrumentation engine hands the callback a [`RegisterContext`]; which register holds
//! which argument depends on the target architecture and is decided once by
//! [`CallingConvention::host`].

use std::fmt;

/// A general purpose register an argument may live in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Register {
    /// aarch64 `x0`..`x28`
    X(u8),
    /// arm `r0`..`r12`
    R(u8),
    /// x86_64 `rdi`
    Rdi,
    /// x86_64 `rsi`
    Rsi,
    /// x86_64 `rdx`
    Rdx,
    /// x86_64 `rcx`
    Rcx,
    /// x86_64 `r8`
    R8,
    /// x86_64 `r9`
    R9,
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X(n) => write!(f, "x{n}"),
            Self::R(n) => write!(f, "r{n}"),
            Self::Rdi => f.write_str("rdi"),
            Self::Rsi => f.write_str("rsi"),
            Self::Rdx => f.write_str("rdx"),
            Self::Rcx => f.write_str("rcx"),
            Self::R8 => f.write_str("r8"),
            Self::R9 => f.write_str("r9"),
        }
    }
}

/// Register state of an intercepted call, as exposed by the instrumentation engine
pub trait RegisterContext {
    /// Read a register. `None` if the engine cannot provide it.
    fn read(&self, register: Register) -> Option<u64>;

    /// Write a register. Returns `false` if the engine cannot write it.
    fn write(&mut self, register: Register, value: u64) -> bool;
}

/// The integer argument passing rules of a target architecture
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallingConvention {
    /// AAPCS64, arguments in `x0`..`x7`
    Aarch64,
    /// AAPCS, arguments in `r0`..`r3`
    Arm,
    /// System V AMD64, arguments in `rdi, rsi, rdx, rcx, r8, r9`
    X86_64,
    /// Any other architecture; argument access is a no-op
    Unsupported(&'static str),
}

impl CallingConvention {
    /// The calling convention of the architecture this crate was compiled for
    #[must_use]
    pub const fn host() -> Self {
        #[cfg(target_arch = "aarch64")]
        return Self::Aarch64;
        #[cfg(target_arch = "arm")]
        return Self::Arm;
        #[cfg(target_arch = "x86_64")]
        return Self::X86_64;
        #[cfg(not(any(target_arch = "aarch64", target_arch = "arm", target_arch = "x86_64")))]
        return Self::Unsupported(std::env::consts::ARCH);
    }

    /// `false` for [`CallingConvention::Unsupported`]
    #[must_use]
    pub const fn is_supported(self) -> bool {
        !matches!(self, Self::Unsupported(_))
    }

    /// The register carrying the `index`th (0-based) integer argument, if it is passed in a
    /// register at all
    #[must_use]
    pub fn argument_register(self, index: usize) -> Option<Register> {
        match self {
            Self::Aarch64 if index < 8 => Some(Register::X(index as u8)),
            Self::Arm if index < 4 => Some(Register::R(index as u8)),
            Self::X86_64 => [
                Register::Rdi,
                Register::Rsi,
                Register::Rdx,
                Register::Rcx,
                Register::R8,
                Register::R9,
            ]
            .get(index)
            .copied(),
            _ => None,
        }
    }
}

impl Default for CallingConvention {
    fn default() -> Self {
        Self::host()
    }
}

/// Reads and writes call arguments through a [`RegisterContext`] using a fixed
/// [`CallingConvention`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArgumentAccessor {
    convention: CallingConvention,
}

impl ArgumentAccessor {
    /// Create an accessor for the given convention
    #[must_use]
    pub const fn new(convention: CallingConvention) -> Self {
        Self { convention }
    }

    /// The convention in use
    #[must_use]
    pub const fn convention(&self) -> CallingConvention {
        self.convention
    }

    /// The raw value of argument `index`
    #[must_use]
    pub fn argument(&self, registers: &dyn RegisterContext, index: usize) -> Option<usize> {
        let register = self.convention.argument_register(index)?;
        registers.read(register).map(|value| value as usize)
    }

    /// Overwrite argument `index`. Returns `false` if it cannot be written.
    pub fn set_argument(
        &self,
        registers: &mut dyn RegisterContext,
        index: usize,
        value: usize,
    ) -> bool {
        match self.convention.argument_register(index) {
            Some(register) => registers.write(register, value as u64),
            None => false,
        }
    }

    /// The second argument; for instance setters this is the value after `this`
    #[must_use]
    pub fn second_argument(&self, registers: &dyn RegisterContext) -> Option<usize> {
        self.argument(registers, 1)
    }
}
