//! The C ABI the host runtime bridge calls into.
//!
//! All functions share one lazily created [`TextractContext`] hooking through [`FridaEngine`],
//! configured from the `TEXTRACT_OPTIONS` environment variable. They return `0` on success, `1`
//! if the call was ignored and `-1` on error.

use std::{
    ffi::{c_char, c_int, c_void, CStr, CString},
    path::Path,
    sync::{Arc, OnceLock},
};

use textract_bolts::{init_logging, Error};

use crate::{
    context::TextractContext,
    dump::{DumpNotifier, MetadataDumper},
    frida::FridaEngine,
    options::TextractOptions,
};

/// Called once per finished dump with the outcome and the `user` pointer given at registration
pub type DumpCallback = extern "C" fn(success: bool, message: *const c_char, user: *mut c_void);

/// Dumps into the given directory, returning `true` on success
pub type DumperFn = extern "C" fn(output_dir: *const c_char) -> bool;

static CONTEXT: OnceLock<Result<Arc<TextractContext>, String>> = OnceLock::new();

fn context() -> Result<&'static Arc<TextractContext>, Error> {
    CONTEXT
        .get_or_init(|| {
            init_logging();
            let options = TextractOptions::parse_env_options().unwrap_or_else(|err| {
                log::error!("Ignoring bad options: {err}");
                TextractOptions::default()
            });
            TextractContext::builder(options, Box::new(FridaEngine::new()))
                .build()
                .map_err(|err| err.to_string())
        })
        .as_ref()
        .map_err(|err| Error::illegal_state(err.clone()))
}

fn status(result: Result<bool, Error>) -> c_int {
    match result {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(err) => {
            log::error!("{err}");
            -1
        }
    }
}

unsafe fn str_arg<'a>(arg: *const c_char) -> Result<&'a str, Error> {
    if arg.is_null() {
        return Ok("");
    }
    CStr::from_ptr(arg)
        .to_str()
        .map_err(|err| Error::illegal_argument(format!("not utf-8: {err}")))
}

/// Start extracting in the calling process.
///
/// # Safety
/// `process_name` must be null or a valid nul terminated string.
#[no_mangle]
pub unsafe extern "C" fn textract_attach(process_name: *const c_char) -> c_int {
    status(str_arg(process_name).and_then(|name| context()?.attach(name)))
}

/// Replace the hooked offsets. Offsets that do not fit a pointer are dropped.
/// Fails after [`textract_shutdown`].
///
/// # Safety
/// `offsets` must point to `len` readable values, or be null with `len == 0`.
#[no_mangle]
pub unsafe extern "C" fn textract_configure(offsets: *const u64, len: usize) -> c_int {
    let offsets = if offsets.is_null() || len == 0 {
        &[][..]
    } else {
        std::slice::from_raw_parts(offsets, len)
    };
    let offsets: Vec<usize> = offsets
        .iter()
        .filter_map(|&offset| usize::try_from(offset).ok())
        .collect();
    // deferred until the module resolves still counts as success
    status(
        context()
            .and_then(|context| context.configure(&offsets))
            .map(|_| true),
    )
}

/// Dump the module metadata into `output_dir` in the background.
///
/// # Safety
/// `output_dir` must be null or a valid nul terminated string.
#[no_mangle]
pub unsafe extern "C" fn textract_request_dump(output_dir: *const c_char) -> c_int {
    status(str_arg(output_dir).and_then(|dir| context()?.request_dump(dir)))
}

#[derive(Clone, Copy)]
struct UserData(*mut c_void);

// The host owns the pointer and promised it may be used from any thread.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

/// Register `callback` for dump results; null unregisters.
///
/// # Safety
/// `user` is handed back unchanged, from a worker thread.
#[no_mangle]
pub unsafe extern "C" fn textract_set_dump_callback(
    callback: Option<DumpCallback>,
    user: *mut c_void,
) -> c_int {
    let user = UserData(user);
    status(context().map(|context| {
        context.set_notifier(callback.map(|callback| {
            Arc::new(move |success: bool, message: &str| {
                let user = user;
                let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
                callback(success, message.as_ptr(), user.0);
            }) as DumpNotifier
        }));
        true
    }))
}

struct ForeignDumper(DumperFn);

impl MetadataDumper for ForeignDumper {
    fn prepare_dump(&self, output_dir: &Path) -> bool {
        match CString::new(output_dir.as_os_str().as_encoded_bytes()) {
            Ok(dir) => (self.0)(dir.as_ptr()),
            Err(err) => {
                log::error!("Bad dump directory: {err}");
                false
            }
        }
    }
}

/// Register the function performing metadata dumps
///
/// # Safety
/// `dumper` is called from a worker thread.
#[no_mangle]
pub unsafe extern "C" fn textract_register_dumper(dumper: Option<DumperFn>) -> c_int {
    let Some(dumper) = dumper else {
        return status(Err(Error::illegal_argument("dumper is null")));
    };
    status(context().map(|context| {
        context.set_dumper(Arc::new(ForeignDumper(dumper)));
        true
    }))
}

/// Stop all workers and remove every hook
#[no_mangle]
pub extern "C" fn textract_shutdown() -> c_int {
    status(context().map(|context| {
        context.shutdown();
        true
    }))
}
