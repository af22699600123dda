//! Module loader: fetch, validate, compile, link, instantiate.
//!
//! Loading is all-or-nothing. Each phase either hands its result to the
//! next one or returns a [`LoadError`]; a [`ModuleHandle`] only exists once
//! every phase has succeeded.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use wasmtime::{
    Config, Engine, ExternType, Instance, Linker, Module, Store, Trap, UpdateDeadline,
};

use crate::error::LoadError;
use crate::host::{HostState, link_host};
use crate::invoke::EntryPoint;
use crate::location::{ArtifactLocation, Fetch, FileFetcher};

/// Size of one wasm linear-memory page.
pub const WASM_PAGE_SIZE: u64 = 65536;

const WASM_MAGIC: &[u8; 4] = b"\0asm";
const WASM_VERSION: u32 = 1;

/// Anything that can turn a location into a ready, enterable handle.
pub trait ModuleLoader {
    type Handle: EntryPoint;

    fn load(
        &self,
        location: &ArtifactLocation,
    ) -> impl Future<Output = Result<Self::Handle, LoadError>>;
}

/// Limits applied to every load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderOptions {
    /// Upper bound on the whole load, fetch through instantiation.
    pub timeout: Duration,
    /// Cap on any single linear memory, initial or grown.
    pub max_memory_bytes: usize,
    /// Guest log lines kept on the handle; older lines are dropped first.
    pub max_log_lines: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_memory_bytes: 256 * 1024 * 1024,
            max_log_lines: 1024,
        }
    }
}

/// A loaded, linked, instantiated module.
///
/// Only [`WasmLoader`] can construct one, so every handle is ready to
/// be entered.
pub struct ModuleHandle {
    pub(crate) store: Store<HostState>,
    pub(crate) instance: Instance,
    location: ArtifactLocation,
}

impl ModuleHandle {
    pub fn location(&self) -> &ArtifactLocation {
        &self.location
    }

    /// Lines the guest has logged so far, up to the configured cap.
    pub fn logs(&self) -> Vec<&str> {
        self.store.data().logs()
    }

    pub fn dropped_logs(&self) -> u64 {
        self.store.data().dropped_logs()
    }

    /// Names of every export on the instance.
    pub fn exports(&mut self) -> Vec<String> {
        self.instance
            .exports(&mut self.store)
            .map(|e| e.name().to_string())
            .collect()
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("location", &self.location)
            .field("entries", &self.store.data().entries())
            .finish_non_exhaustive()
    }
}

/// One import or export as declared by a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    /// Import module name; empty for exports.
    pub module: String,
    pub name: String,
    pub kind: &'static str,
}

/// Imports and exports of a compiled but uninstantiated module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    pub imports: Vec<Declaration>,
    pub exports: Vec<Declaration>,
}

/// The wasmtime-backed loader.
pub struct WasmLoader<F = FileFetcher> {
    engine: Engine,
    linker: Linker<HostState>,
    fetcher: F,
    options: LoaderOptions,
    cancel: CancellationToken,
}

impl WasmLoader<FileFetcher> {
    pub fn new(options: LoaderOptions) -> Result<Self, LoadError> {
        Self::with_fetcher(options, FileFetcher)
    }
}

impl<F: Fetch> WasmLoader<F> {
    pub fn with_fetcher(options: LoaderOptions, fetcher: F) -> Result<Self, LoadError> {
        // Epoch checks let a dropped load stop a start function that never returns.
        let mut config = Config::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config).map_err(|source| LoadError::Host { source })?;
        let mut linker = Linker::new(&engine);
        link_host(&mut linker).map_err(|source| LoadError::Host { source })?;
        Ok(Self {
            engine,
            linker,
            fetcher,
            options,
            cancel: CancellationToken::new(),
        })
    }

    /// Abort any load in progress when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    /// Load a module, bounded by the configured timeout and cancellation token.
    pub async fn load(&self, location: &ArtifactLocation) -> Result<ModuleHandle, LoadError> {
        let after = self.options.timeout;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(LoadError::Cancelled {
                location: location.to_string(),
            }),
            res = tokio::time::timeout(after, self.load_unbounded(location)) => match res {
                Ok(loaded) => loaded,
                Err(_) => Err(LoadError::TimedOut {
                    location: location.to_string(),
                    after,
                }),
            },
        }
    }

    async fn load_unbounded(&self, location: &ArtifactLocation) -> Result<ModuleHandle, LoadError> {
        let bytes = self.fetcher.fetch(location).await?;
        debug!(%location, bytes = bytes.len(), "fetched module");

        let module = self.compile(location, bytes).await?;
        debug!(
            %location,
            imports = module.imports().len(),
            exports = module.exports().len(),
            "compiled module"
        );

        self.check_memory(location, &module)?;

        let mut store = Store::new(
            &self.engine,
            HostState::new(self.options.max_memory_bytes, self.options.max_log_lines),
        );
        store.limiter(|state| &mut state.limits);

        let interrupted = Arc::new(AtomicBool::new(false));
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback({
            let interrupted = Arc::clone(&interrupted);
            move |_| {
                if interrupted.load(Ordering::SeqCst) {
                    Err(Trap::Interrupt.into())
                } else {
                    Ok(UpdateDeadline::Continue(1))
                }
            }
        });

        self.check_imports(location, &mut store, &module)?;

        // The start function runs guest code; keep it off the async worker so
        // the timeout and cancellation branches can still fire.
        let mut guard = InterruptOnDrop {
            engine: self.engine.clone(),
            interrupted,
            armed: true,
        };
        let linker = self.linker.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let instance = linker.instantiate(&mut store, &module);
            (store, instance)
        })
        .await;
        guard.armed = false;

        let instantiate_err = |source: wasmtime::Error| LoadError::Instantiate {
            location: location.to_string(),
            source,
        };
        let (store, instance) = joined.map_err(|e| {
            instantiate_err(wasmtime::Error::msg(format!("instantiation task failed: {e}")))
        })?;
        let instance = instance.map_err(instantiate_err)?;

        info!(%location, "module ready");
        Ok(ModuleHandle {
            store,
            instance,
            location: location.clone(),
        })
    }

    /// Fetch and compile a module without linking it, and list what it
    /// declares.
    pub async fn inspect(&self, location: &ArtifactLocation) -> Result<ModuleInfo, LoadError> {
        let bytes = self.fetcher.fetch(location).await?;
        let module = self.compile(location, bytes).await?;

        let imports = module
            .imports()
            .map(|i| Declaration {
                module: i.module().to_string(),
                name: i.name().to_string(),
                kind: extern_kind(&i.ty()),
            })
            .collect();
        let exports = module
            .exports()
            .map(|e| Declaration {
                module: String::new(),
                name: e.name().to_string(),
                kind: extern_kind(&e.ty()),
            })
            .collect();

        Ok(ModuleInfo { imports, exports })
    }

    async fn compile(&self, location: &ArtifactLocation, bytes: Vec<u8>) -> Result<Module, LoadError> {
        let malformed = |reason: String| LoadError::Malformed {
            location: location.to_string(),
            reason,
        };

        validate_header(&bytes).map_err(malformed)?;

        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || Module::from_binary(&engine, &bytes))
            .await
            .map_err(|e| malformed(format!("compiler task failed: {e}")))?
            .map_err(|e| malformed(format!("{e:#}")))
    }

    fn check_memory(&self, location: &ArtifactLocation, module: &Module) -> Result<(), LoadError> {
        let limit = self.options.max_memory_bytes as u64;
        if let Some(pages) = module.resources_required().max_initial_memory_size {
            let requested = pages.saturating_mul(WASM_PAGE_SIZE);
            if requested > limit {
                return Err(LoadError::OutOfMemory {
                    location: location.to_string(),
                    requested,
                    limit,
                });
            }
        }
        Ok(())
    }

    fn check_imports(
        &self,
        location: &ArtifactLocation,
        store: &mut Store<HostState>,
        module: &Module,
    ) -> Result<(), LoadError> {
        for import in module.imports() {
            if self.linker.get_by_import(&mut *store, &import).is_none() {
                return Err(LoadError::UnresolvedImport {
                    location: location.to_string(),
                    module: import.module().to_string(),
                    name: import.name().to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Stops guest code still running on a blocking thread when the load that
/// started it is dropped, e.g. by the timeout or cancellation branch.
struct InterruptOnDrop {
    engine: Engine,
    interrupted: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.interrupted.store(true, Ordering::SeqCst);
            self.engine.increment_epoch();
        }
    }
}

impl<F: Fetch> ModuleLoader for WasmLoader<F> {
    type Handle = ModuleHandle;

    fn load(
        &self,
        location: &ArtifactLocation,
    ) -> impl Future<Output = Result<ModuleHandle, LoadError>> {
        WasmLoader::load(self, location)
    }
}

/// Check the 8-byte preamble: magic then little-endian version 1.
pub fn validate_header(bytes: &[u8]) -> Result<(), String> {
    if bytes.len() < 8 {
        return Err(format!("{} bytes is too short for a module header", bytes.len()));
    }
    if &bytes[..4] != WASM_MAGIC {
        return Err("missing \\0asm magic".to_string());
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != WASM_VERSION {
        return Err(format!("unsupported binary version {version}"));
    }
    Ok(())
}

fn extern_kind(ty: &ExternType) -> &'static str {
    match ty {
        ExternType::Func(_) => "func",
        ExternType::Memory(_) => "memory",
        ExternType::Table(_) => "table",
        ExternType::Global(_) => "global",
        #[allow(unreachable_patterns)]
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture_location, write_bytes};
    use std::path::PathBuf;
    use std::time::Instant;

    fn loader() -> WasmLoader {
        WasmLoader::new(LoaderOptions::default()).unwrap()
    }

    /// Never yields any bytes.
    struct StalledFetcher;

    impl Fetch for StalledFetcher {
        async fn fetch(&self, _location: &ArtifactLocation) -> Result<Vec<u8>, LoadError> {
            std::future::pending().await
        }
    }

    #[test]
    fn test_validate_header() {
        assert!(validate_header(b"\0asm\x01\0\0\0").is_ok());
        assert!(validate_header(b"\0asm").unwrap_err().contains("too short"));
        assert!(validate_header(b"\x7fELF\x02\x01\x01\0").unwrap_err().contains("magic"));
        assert!(validate_header(b"\0asm\x0d\0\x01\0").unwrap_err().contains("version"));
    }

    #[tokio::test]
    async fn test_load_valid_module_is_ready() {
        let (_dir, loc) = fixture_location("run_app.wat");
        let mut handle = loader().load(&loc).await.unwrap();
        assert_eq!(handle.location(), &loc);
        let exports = handle.exports();
        assert!(exports.contains(&"run_app".to_string()));
        assert!(handle.logs().is_empty());
    }

    #[tokio::test]
    async fn test_load_missing_file_is_fetch_error() {
        let loc = ArtifactLocation::Path(PathBuf::from("/nonexistent/dir/app_bg.wasm"));
        let err = loader().load(&loc).await.unwrap_err();
        assert!(matches!(err, LoadError::Fetch { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_load_garbage_is_malformed() {
        let (_dir, loc) = write_bytes("garbage.wasm", b"this is not a module at all");
        let err = loader().load(&loc).await.unwrap_err();
        assert!(matches!(err, LoadError::Malformed { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_load_truncated_body_is_malformed() {
        // Valid preamble, then a type section that claims more bytes than exist.
        let (_dir, loc) = write_bytes("truncated.wasm", b"\0asm\x01\0\0\0\x01\x7f\x01");
        let err = loader().load(&loc).await.unwrap_err();
        assert!(matches!(err, LoadError::Malformed { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_load_unresolved_import() {
        let (_dir, loc) = fixture_location("unresolved_import.wat");
        let err = loader().load(&loc).await.unwrap_err();
        match err {
            LoadError::UnresolvedImport { module, name, .. } => {
                assert_eq!(module, "env");
                assert_eq!(name, "open_socket");
            }
            other => panic!("expected unresolved import, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_oversized_memory_is_out_of_memory() {
        let (_dir, loc) = fixture_location("huge_memory.wat");
        let options = LoaderOptions {
            max_memory_bytes: 1 << 20,
            ..LoaderOptions::default()
        };
        let err = WasmLoader::new(options).unwrap().load(&loc).await.unwrap_err();
        match err {
            LoadError::OutOfMemory { requested, limit, .. } => {
                assert_eq!(requested, 1024 * WASM_PAGE_SIZE);
                assert_eq!(limit, 1 << 20);
            }
            other => panic!("expected out of memory, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_start_trap_is_instantiate_error() {
        let (_dir, loc) = fixture_location("start_trap.wat");
        let err = loader().load(&loc).await.unwrap_err();
        assert!(matches!(err, LoadError::Instantiate { .. }), "got {err:?}");
        assert!(err.to_string().contains("unreachable"), "{err}");
    }

    #[tokio::test]
    async fn test_load_times_out() {
        let options = LoaderOptions {
            timeout: Duration::from_millis(20),
            ..LoaderOptions::default()
        };
        let loader = WasmLoader::with_fetcher(options, StalledFetcher).unwrap();
        let err = loader
            .load(&ArtifactLocation::parse("stalled.wasm"))
            .await
            .unwrap_err();
        match err {
            LoadError::TimedOut { after, .. } => assert_eq!(after, Duration::from_millis(20)),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_cancelled() {
        let token = CancellationToken::new();
        let loader = WasmLoader::with_fetcher(LoaderOptions::default(), StalledFetcher)
            .unwrap()
            .with_cancellation(token.clone());
        token.cancel();
        let err = loader
            .load(&ArtifactLocation::parse("stalled.wasm"))
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Cancelled { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_spinning_start_function_times_out() {
        let (_dir, loc) = fixture_location("start_spin.wat");
        let options = LoaderOptions {
            timeout: Duration::from_millis(100),
            ..LoaderOptions::default()
        };
        let started = Instant::now();
        let err = WasmLoader::new(options).unwrap().load(&loc).await.unwrap_err();
        assert!(matches!(err, LoadError::TimedOut { .. }), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_spinning_start_function_is_cancellable() {
        let (_dir, loc) = fixture_location("start_spin.wat");
        let token = CancellationToken::new();
        let loader = loader().with_cancellation(token.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let err = loader.load(&loc).await.unwrap_err();
        assert!(matches!(err, LoadError::Cancelled { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_interrupt_leaves_other_loads_running() {
        let (_dir, spin) = fixture_location("start_spin.wat");
        let (_dir2, ok) = fixture_location("run_app.wat");
        let options = LoaderOptions {
            timeout: Duration::from_millis(100),
            ..LoaderOptions::default()
        };
        let loader = WasmLoader::new(options).unwrap();
        let err = loader.load(&spin).await.unwrap_err();
        assert!(matches!(err, LoadError::TimedOut { .. }), "got {err:?}");

        let mut handle = loader.load(&ok).await.unwrap();
        crate::invoke_entry(&mut handle, "run_app").unwrap();
        assert_eq!(handle.logs(), ["hello from run_app"]);
    }

    #[tokio::test]
    async fn test_log_cap_applies_to_handle() {
        let (_dir, loc) = fixture_location("run_app.wat");
        let options = LoaderOptions {
            max_log_lines: 0,
            ..LoaderOptions::default()
        };
        let mut handle = WasmLoader::new(options).unwrap().load(&loc).await.unwrap();
        crate::invoke_entry(&mut handle, "run_app").unwrap();
        assert!(handle.logs().is_empty());
        assert_eq!(handle.dropped_logs(), 1);
    }

    #[tokio::test]
    async fn test_inspect_lists_declarations() {
        let (_dir, loc) = fixture_location("unresolved_import.wat");
        let info = loader().inspect(&loc).await.unwrap();
        assert_eq!(
            info.imports,
            vec![Declaration {
                module: "env".to_string(),
                name: "open_socket".to_string(),
                kind: "func",
            }]
        );
        assert!(
            info.exports
                .iter()
                .any(|e| e.name == "run_app" && e.kind == "func")
        );
    }
}
