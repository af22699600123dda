//! # wasm-boot
//!
//! Load a precompiled WebAssembly module, link it against host bindings,
//! and enter it through a single exported function.
//!
//! ## Overview
//!
//! Bootstrapping a module is a two-phase handshake:
//! - **Load**: fetch the bytes, validate and compile them, resolve every
//!   import against the host, instantiate
//! - **Enter**: call one well-known export (`run_app` by default) exactly once
//!
//! Entering is only possible on a [`ModuleHandle`], and only the loader can
//! produce one, so a module can never be entered before it is ready.
//!
//! ## Example
//!
//! ```no_run
//! use wasm_boot::{ArtifactLocation, Bootstrap, LoaderOptions, WasmLoader};
//!
//! # async fn start() -> Result<(), wasm_boot::BootError> {
//! let loader = WasmLoader::new(LoaderOptions::default())?;
//! let mut boot = Bootstrap::new(loader, "run_app");
//!
//! let handle = boot.run(&ArtifactLocation::parse("dist/yewchat_bg.wasm")).await?;
//! for line in handle.logs() {
//!     println!("{line}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod host;
pub mod invoke;
pub mod loader;
pub mod location;

#[cfg(test)]
mod test_support;

pub use bootstrap::{BootCallbacks, BootState, Bootstrap};
pub use config::{BootConfig, Handling, Mode};
pub use error::{BootError, ConfigError, InvokeError, LoadError};
pub use host::{HOST_MODULE, HostState};
pub use invoke::{DEFAULT_ENTRY, EntryPoint, invoke_entry};
pub use loader::{LoaderOptions, ModuleHandle, ModuleInfo, ModuleLoader, WasmLoader};
pub use location::{ArtifactLocation, Fetch, FileFetcher};
