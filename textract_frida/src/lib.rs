/*!
`textract_frida` runs inside a process hosting an Il2Cpp runtime and records every distinct text
passed to the `set_Text` style setters of `libil2cpp.so`.

A background worker waits for the runtime module, interceptors are placed at configured offsets
relative to its base, the managed string in the second argument register of every hit is
decoded, filtered and finally stored once per package in a `SQLite` file.

The interceptors themselves are placed through an [`engine::InterceptorEngine`]. With the
`frida` feature, [`frida::FridaEngine`] does that through frida-gum and [`ffi`] exports the C
functions the host bridge calls.
*/

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::ptr_as_ptr,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items,
    clippy::module_name_repetitions,
    clippy::must_use_candidate
)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    //trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    //unused_results
))]

pub mod arch;
pub mod context;
pub mod decoder;
pub mod dump;
pub mod elf;
pub mod engine;
pub mod filter;
pub mod hooks;
pub mod module;
pub mod options;
pub mod store;
pub mod symbols;

/// The frida-gum interceptor backend
#[cfg(feature = "frida")]
pub mod frida;

#[cfg(feature = "frida")]
pub mod ffi;

pub use context::{TextractContext, TextractContextBuilder};
pub use options::TextractOptions;
