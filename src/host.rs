//! Host bindings a guest module may import.
//!
//! All bindings live under the import module `env`:
//!
//! - `log(ptr: i32, len: i32)` - emit a UTF-8 line from guest memory
//! - `abort(code: i32)` - raise a fault that ends the current call
//! - `now_ms() -> i64` - wall clock, milliseconds since the Unix epoch

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;
use wasmtime::{Caller, Extern, Linker, StoreLimits, StoreLimitsBuilder};

/// Import module name for every host binding.
pub const HOST_MODULE: &str = "env";

/// Per-store host data.
pub struct HostState {
    pub(crate) limits: StoreLimits,
    logs: VecDeque<String>,
    max_log_lines: usize,
    dropped_logs: u64,
    entries: u32,
}

impl HostState {
    /// `max_log_lines` bounds how many guest log lines are retained; older
    /// lines are discarded once it is reached.
    pub fn new(max_memory_bytes: usize, max_log_lines: usize) -> Self {
        Self {
            limits: StoreLimitsBuilder::new()
                .memory_size(max_memory_bytes)
                .build(),
            logs: VecDeque::new(),
            max_log_lines,
            dropped_logs: 0,
            entries: 0,
        }
    }

    /// The most recent lines the guest emitted through `env.log`, oldest first.
    pub fn logs(&self) -> Vec<&str> {
        self.logs.iter().map(String::as_str).collect()
    }

    /// Lines discarded because the log buffer was full.
    pub fn dropped_logs(&self) -> u64 {
        self.dropped_logs
    }

    /// How many times the entry point has been called.
    pub fn entries(&self) -> u32 {
        self.entries
    }

    pub(crate) fn record_log(&mut self, line: String) {
        if self.max_log_lines == 0 {
            self.dropped_logs += 1;
            return;
        }
        if self.logs.len() == self.max_log_lines {
            self.logs.pop_front();
            self.dropped_logs += 1;
        }
        self.logs.push_back(line);
    }

    pub(crate) fn record_entry(&mut self) -> u32 {
        self.entries += 1;
        self.entries
    }
}

/// Register every host binding on `linker`.
pub fn link_host(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "log",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let line = read_guest_str(&mut caller, ptr, len)?;
            info!(target: "guest", "{line}");
            caller.data_mut().record_log(line);
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "abort",
        |_caller: Caller<'_, HostState>, code: i32| -> wasmtime::Result<()> {
            Err(wasmtime::Error::msg(format!("guest aborted with code {code}")))
        },
    )?;

    linker.func_wrap(HOST_MODULE, "now_ms", || -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    })?;

    Ok(())
}

/// Copy `len` bytes at `ptr` out of the guest's exported `memory`.
fn read_guest_str(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> wasmtime::Result<String> {
    let memory = caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::msg("guest does not export 'memory'"))?;

    let start = usize::try_from(ptr)
        .map_err(|_| wasmtime::Error::msg(format!("negative pointer {ptr}")))?;
    let len = usize::try_from(len)
        .map_err(|_| wasmtime::Error::msg(format!("negative length {len}")))?;

    let bytes = start
        .checked_add(len)
        .and_then(|end| memory.data(&*caller).get(start..end))
        .ok_or_else(|| {
            wasmtime::Error::msg(format!("range {start}+{len} is outside guest memory"))
        })?;

    Ok(String::from_utf8_lossy(bytes).into_owned())
}
