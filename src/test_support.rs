//! Shared helpers for tests that need real module files.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use crate::location::ArtifactLocation;

/// Assemble `fixtures/<name>` and write it as a `.wasm` file in a fresh
/// temp dir. Keep the dir alive for as long as the file is needed.
pub fn fixture_location(name: &str) -> (TempDir, ArtifactLocation) {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("fixtures")
        .join(name);
    let bytes = wat::parse_file(&path)
        .unwrap_or_else(|e| panic!("fixture {} does not assemble: {e}", path.display()));
    let file_name = Path::new(name).with_extension("wasm");
    write_bytes(&file_name.to_string_lossy(), &bytes)
}

/// Write raw bytes to `name` in a fresh temp dir.
pub fn write_bytes(name: &str, bytes: &[u8]) -> (TempDir, ArtifactLocation) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    fs::write(&path, bytes).unwrap();
    (dir, ArtifactLocation::Path(path))
}
