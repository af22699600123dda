//! Two-phase bootstrap: load a module, then enter it once.

use std::fmt;

use tracing::{error, info};

use crate::error::BootError;
use crate::invoke::EntryPoint;
use crate::loader::ModuleLoader;
use crate::location::ArtifactLocation;

/// Lifecycle of the module a [`Bootstrap`] manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

impl BootState {
    /// `Ready` and `Failed` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, BootState::Ready | BootState::Failed)
    }
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BootState::Unloaded => "unloaded",
            BootState::Loading => "loading",
            BootState::Ready => "ready",
            BootState::Failed => "failed",
        })
    }
}

/// Callback type for state changes: `(from, to)`.
type TransitionCallback = Box<dyn Fn(BootState, BootState) + 'static>;
/// Callback type for the moment control passes to the entry point.
type EnterCallback = Box<dyn Fn(&str) + 'static>;

/// Hooks for observing a bootstrap run.
#[derive(Default)]
pub struct BootCallbacks {
    pub on_transition: Option<TransitionCallback>,
    pub on_enter: Option<EnterCallback>,
}

impl BootCallbacks {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Sequences a [`ModuleLoader`] and the entry point of what it loads.
pub struct Bootstrap<L> {
    loader: L,
    entry: String,
    state: BootState,
    callbacks: BootCallbacks,
}

impl<L: ModuleLoader> Bootstrap<L> {
    pub fn new(loader: L, entry: impl Into<String>) -> Self {
        Self {
            loader,
            entry: entry.into(),
            state: BootState::Unloaded,
            callbacks: BootCallbacks::default(),
        }
    }

    pub fn with_callbacks(mut self, callbacks: BootCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Load the module and move to `Ready` or `Failed`.
    pub async fn load(&mut self, location: &ArtifactLocation) -> Result<L::Handle, BootError> {
        if self.state != BootState::Unloaded {
            return Err(BootError::AlreadyStarted { state: self.state });
        }

        self.transition(BootState::Loading);
        match self.loader.load(location).await {
            Ok(handle) => {
                self.transition(BootState::Ready);
                Ok(handle)
            }
            Err(e) => {
                self.transition(BootState::Failed);
                error!(%location, "load failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Load the module, then call its entry point exactly once.
    ///
    /// The handle is returned so the caller keeps the module alive for as
    /// long as it needs to.
    pub async fn run(&mut self, location: &ArtifactLocation) -> Result<L::Handle, BootError> {
        let mut handle = self.load(location).await?;

        if let Some(cb) = &self.callbacks.on_enter {
            cb(&self.entry);
        }
        handle.invoke_entry(&self.entry)?;
        info!(entry = %self.entry, "entry point returned");

        Ok(handle)
    }

    fn transition(&mut self, to: BootState) {
        let from = self.state;
        self.state = to;
        if let Some(cb) = &self.callbacks.on_transition {
            cb(from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{InvokeError, LoadError};
    use crate::invoke::DEFAULT_ENTRY;
    use crate::loader::{LoaderOptions, WasmLoader};
    use crate::test_support::fixture_location;
    use std::cell::RefCell;
    use std::io;
    use std::rc::Rc;
    use std::time::Duration;
    use tokio::sync::{Mutex, oneshot};

    type Events = Rc<RefCell<Vec<String>>>;

    /// Handle that records each entry into a shared event log.
    #[derive(Debug)]
    struct StubHandle {
        events: Events,
        fail_with: Option<&'static str>,
    }

    impl EntryPoint for StubHandle {
        fn invoke_entry(&mut self, entry_name: &str) -> Result<(), InvokeError> {
            self.events.borrow_mut().push(format!("enter:{entry_name}"));
            match self.fail_with {
                Some(reason) => Err(InvokeError::EntryFailed {
                    name: entry_name.to_string(),
                    source: wasmtime::Error::msg(reason),
                }),
                None => Ok(()),
            }
        }
    }

    /// Loader that does not resolve until its trigger fires.
    struct GatedLoader {
        events: Events,
        trigger: Mutex<Option<oneshot::Receiver<bool>>>,
    }

    impl GatedLoader {
        fn new(events: Events) -> (Self, oneshot::Sender<bool>) {
            let (tx, rx) = oneshot::channel();
            let loader = Self {
                events,
                trigger: Mutex::new(Some(rx)),
            };
            (loader, tx)
        }
    }

    impl ModuleLoader for GatedLoader {
        type Handle = StubHandle;

        async fn load(&self, location: &ArtifactLocation) -> Result<StubHandle, LoadError> {
            let rx = self.trigger.lock().await.take();
            let succeed = match rx {
                Some(rx) => rx.await.unwrap_or(false),
                None => false,
            };
            self.events.borrow_mut().push("loaded".to_string());
            if succeed {
                Ok(StubHandle {
                    events: Rc::clone(&self.events),
                    fail_with: None,
                })
            } else {
                Err(LoadError::Fetch {
                    location: location.to_string(),
                    source: io::Error::new(io::ErrorKind::NotFound, "gate closed"),
                })
            }
        }
    }

    fn recording_callbacks(events: &Events) -> BootCallbacks {
        let on_transition = Rc::clone(events);
        let on_enter = Rc::clone(events);
        BootCallbacks {
            on_transition: Some(Box::new(move |from, to| {
                on_transition.borrow_mut().push(format!("{from}->{to}"));
            })),
            on_enter: Some(Box::new(move |name| {
                on_enter.borrow_mut().push(format!("about-to-enter:{name}"));
            })),
        }
    }

    #[tokio::test]
    async fn test_entry_waits_for_load() {
        let events: Events = Rc::default();
        let (loader, trigger) = GatedLoader::new(Rc::clone(&events));
        let mut boot = Bootstrap::new(loader, DEFAULT_ENTRY);
        let loc = ArtifactLocation::parse("gated.wasm");

        {
            let run = boot.run(&loc);
            tokio::pin!(run);

            // The load is blocked on the trigger, so nothing may have entered.
            let early = tokio::time::timeout(Duration::from_millis(20), run.as_mut()).await;
            assert!(early.is_err());
            assert!(events.borrow().is_empty());

            trigger.send(true).unwrap();
            run.await.unwrap();
        }

        assert_eq!(*events.borrow(), ["loaded", "enter:run_app"]);
        assert_eq!(boot.state(), BootState::Ready);
    }

    #[tokio::test]
    async fn test_failed_load_never_enters() {
        let events: Events = Rc::default();
        let (loader, trigger) = GatedLoader::new(Rc::clone(&events));
        let mut boot =
            Bootstrap::new(loader, DEFAULT_ENTRY).with_callbacks(recording_callbacks(&events));

        trigger.send(false).unwrap();
        let err = boot.run(&ArtifactLocation::parse("gated.wasm")).await.unwrap_err();

        assert!(matches!(err, BootError::Load(LoadError::Fetch { .. })), "got {err:?}");
        assert_eq!(boot.state(), BootState::Failed);
        assert_eq!(
            *events.borrow(),
            ["unloaded->loading", "loaded", "loading->failed"]
        );
    }

    #[tokio::test]
    async fn test_transitions_in_order() {
        let events: Events = Rc::default();
        let (loader, trigger) = GatedLoader::new(Rc::clone(&events));
        let mut boot =
            Bootstrap::new(loader, DEFAULT_ENTRY).with_callbacks(recording_callbacks(&events));

        trigger.send(true).unwrap();
        boot.run(&ArtifactLocation::parse("gated.wasm")).await.unwrap();

        assert_eq!(
            *events.borrow(),
            [
                "unloaded->loading",
                "loaded",
                "loading->ready",
                "about-to-enter:run_app",
                "enter:run_app",
            ]
        );
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let events: Events = Rc::default();
        let (loader, trigger) = GatedLoader::new(Rc::clone(&events));
        let mut boot = Bootstrap::new(loader, DEFAULT_ENTRY);
        let loc = ArtifactLocation::parse("gated.wasm");

        trigger.send(true).unwrap();
        boot.run(&loc).await.unwrap();
        let err = boot.run(&loc).await.unwrap_err();

        assert!(
            matches!(err, BootError::AlreadyStarted { state: BootState::Ready }),
            "got {err:?}"
        );
        assert_eq!(events.borrow().len(), 2);
    }

    #[tokio::test]
    async fn test_entry_failure_propagates() {
        struct FaultyLoader(Events);

        impl ModuleLoader for FaultyLoader {
            type Handle = StubHandle;

            async fn load(&self, _location: &ArtifactLocation) -> Result<StubHandle, LoadError> {
                Ok(StubHandle {
                    events: Rc::clone(&self.0),
                    fail_with: Some("boom"),
                })
            }
        }

        let events: Events = Rc::default();
        let mut boot = Bootstrap::new(FaultyLoader(Rc::clone(&events)), "main");
        let err = boot.run(&ArtifactLocation::parse("x.wasm")).await.unwrap_err();

        assert!(
            matches!(err, BootError::Invoke(InvokeError::EntryFailed { .. })),
            "got {err:?}"
        );
        // Load succeeded, so the state stays Ready after a failed entry.
        assert_eq!(boot.state(), BootState::Ready);
        assert_eq!(*events.borrow(), ["enter:main"]);
    }

    // --- End-to-end with the wasmtime loader ---

    #[tokio::test]
    async fn test_scenario_valid_module_runs() {
        let (_dir, loc) = fixture_location("run_app.wat");
        let loader = WasmLoader::new(LoaderOptions::default()).unwrap();
        let mut boot = Bootstrap::new(loader, DEFAULT_ENTRY);
        let handle = boot.run(&loc).await.unwrap();
        assert_eq!(boot.state(), BootState::Ready);
        assert_eq!(handle.logs(), ["hello from run_app"]);
    }

    #[tokio::test]
    async fn test_scenario_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let loc = ArtifactLocation::from(dir.path().join("missing_bg.wasm"));
        let loader = WasmLoader::new(LoaderOptions::default()).unwrap();
        let mut boot = Bootstrap::new(loader, DEFAULT_ENTRY);
        let err = boot.run(&loc).await.unwrap_err();
        assert!(matches!(err, BootError::Load(LoadError::Fetch { .. })), "got {err:?}");
        assert_eq!(boot.state(), BootState::Failed);
    }

    #[tokio::test]
    async fn test_scenario_missing_entry() {
        let (_dir, loc) = fixture_location("no_entry.wat");
        let loader = WasmLoader::new(LoaderOptions::default()).unwrap();
        let mut boot = Bootstrap::new(loader, DEFAULT_ENTRY);
        let err = boot.run(&loc).await.unwrap_err();
        assert!(
            matches!(err, BootError::Invoke(InvokeError::NotFound { .. })),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn test_scenario_entry_faults() {
        let (_dir, loc) = fixture_location("trapping.wat");
        let loader = WasmLoader::new(LoaderOptions::default()).unwrap();
        let mut boot = Bootstrap::new(loader, DEFAULT_ENTRY);
        let err = boot.run(&loc).await.unwrap_err();
        assert!(
            matches!(err, BootError::Invoke(InvokeError::EntryFailed { .. })),
            "got {err:?}"
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(BootState::Ready.is_terminal());
        assert!(BootState::Failed.is_terminal());
        assert!(!BootState::Loading.is_terminal());
        assert!(!BootState::Unloaded.is_terminal());
        assert_eq!(BootState::Loading.to_string(), "loading");
    }
}
