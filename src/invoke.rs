//! Entry invoker.

use tracing::{debug, info, warn};
use wasmtime::{Extern, Val};

use crate::error::InvokeError;
use crate::loader::ModuleHandle;

/// Default name of the exported entry point.
pub const DEFAULT_ENTRY: &str = "run_app";

/// A ready handle that can be entered by export name.
pub trait EntryPoint {
    fn invoke_entry(&mut self, entry_name: &str) -> Result<(), InvokeError>;
}

/// Call the zero-argument export `entry_name` on a loaded module.
///
/// Results the export returns are discarded. Faults raised inside the
/// module come back as [`InvokeError::EntryFailed`].
///
/// Entering the same handle twice is not a supported use; it is logged
/// and otherwise passed through to the module.
pub fn invoke_entry(handle: &mut ModuleHandle, entry_name: &str) -> Result<(), InvokeError> {
    let instance = handle.instance;
    let store = &mut handle.store;

    let func = instance
        .get_export(&mut *store, entry_name)
        .and_then(Extern::into_func)
        .ok_or_else(|| InvokeError::NotFound {
            name: entry_name.to_string(),
        })?;

    let ty = func.ty(&*store);
    let params = ty.params().len();
    if params != 0 {
        return Err(InvokeError::BadSignature {
            name: entry_name.to_string(),
            params,
        });
    }
    let mut results = vec![Val::I32(0); ty.results().len()];

    let count = store.data_mut().record_entry();
    if count > 1 {
        warn!(entry = entry_name, count, "entry point called more than once");
    }

    info!(entry = entry_name, location = %handle.location(), "entering module");
    func.call(&mut handle.store, &[], &mut results)
        .map_err(|source| InvokeError::EntryFailed {
            name: entry_name.to_string(),
            source,
        })?;
    debug!(entry = entry_name, results = results.len(), "entry returned");

    Ok(())
}

impl EntryPoint for ModuleHandle {
    fn invoke_entry(&mut self, entry_name: &str) -> Result<(), InvokeError> {
        invoke_entry(self, entry_name)
    }
}
