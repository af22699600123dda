//! Build and serve configuration.
//!
//! A JSON file describing where the bundled artifact lands, how each file
//! type is handled, which static directories are copied next to it, and how
//! a development server would serve it. Every field is optional; the
//! defaults describe the standard web bundle layout:
//!
//! ```json
//! {
//!   "mode": "development",
//!   "entry": "run_app",
//!   "output": { "path": "dist", "filename": "yewchat.js", "wasm_filename": "yewchat_bg.wasm" },
//!   "resolve": { "extensions": [".js", ".wasm"] },
//!   "rules": [
//!     { "test": "\\.wasm$", "type": "asset", "filename": "[name][ext]" },
//!     { "test": "\\.css$", "type": "source", "loaders": ["style-loader", "css-loader"] },
//!     { "test": "\\.(png|jpg|gif|svg)$", "type": "asset" }
//!   ],
//!   "copy": [{ "from": "static", "to": "dist" }],
//!   "dev_server": { "static_dir": "dist", "port": 8000, "hot": true },
//!   "loader": { "timeout_ms": 30000, "max_memory_bytes": 268435456, "max_log_lines": 1024 }
//! }
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;
use crate::invoke::DEFAULT_ENTRY;
use crate::loader::LoaderOptions;
use crate::location::ArtifactLocation;

/// Environment variable that overrides the configured mode.
pub const MODE_ENV: &str = "BOOT_MODE";

/// Default config file name.
pub const DEFAULT_CONFIG_FILE: &str = "boot.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Development,
    Production,
    None,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" => Ok(Mode::Development),
            "production" => Ok(Mode::Production),
            "none" => Ok(Mode::None),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub path: PathBuf,
    pub filename: String,
    pub wasm_filename: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("dist"),
            filename: "yewchat.js".to_string(),
            wasm_filename: "yewchat_bg.wasm".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResolveConfig {
    pub extensions: Vec<String>,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            extensions: vec![".js".to_string(), ".wasm".to_string()],
        }
    }
}

/// What the build does with a file that matches a rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Handling {
    /// Emit the file as-is under a templated name.
    Asset {
        #[serde(default)]
        filename: Option<String>,
    },
    /// Run the file through a chain of source loaders.
    Source { loaders: Vec<String> },
}

#[derive(Debug, Clone, Deserialize)]
struct RawRule {
    test: String,
    #[serde(flatten)]
    handling: Handling,
}

/// A compiled file-type rule.
#[derive(Debug, Clone)]
pub struct AssetRule {
    pub test: Regex,
    pub handling: Handling,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CopyPattern {
    pub from: PathBuf,
    pub to: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DevServerConfig {
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_hot")]
    pub hot: bool,
}

fn default_port() -> u16 {
    8000
}

fn default_hot() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub timeout_ms: u64,
    pub max_memory_bytes: usize,
    pub max_log_lines: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        let options = LoaderOptions::default();
        Self {
            timeout_ms: options.timeout.as_millis() as u64,
            max_memory_bytes: options.max_memory_bytes,
            max_log_lines: options.max_log_lines,
        }
    }
}

impl From<LoaderConfig> for LoaderOptions {
    fn from(c: LoaderConfig) -> Self {
        LoaderOptions {
            timeout: Duration::from_millis(c.timeout_ms),
            max_memory_bytes: c.max_memory_bytes,
            max_log_lines: c.max_log_lines,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    mode: Mode,
    entry: String,
    output: OutputConfig,
    resolve: ResolveConfig,
    rules: Vec<RawRule>,
    copy: Option<Vec<CopyPattern>>,
    dev_server: Option<DevServerConfig>,
    loader: LoaderConfig,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            entry: DEFAULT_ENTRY.to_string(),
            output: OutputConfig::default(),
            resolve: ResolveConfig::default(),
            rules: default_rules(),
            copy: None,
            dev_server: None,
            loader: LoaderConfig::default(),
        }
    }
}

fn default_rules() -> Vec<RawRule> {
    vec![
        RawRule {
            test: r"\.wasm$".to_string(),
            handling: Handling::Asset {
                filename: Some("[name][ext]".to_string()),
            },
        },
        RawRule {
            test: r"\.css$".to_string(),
            handling: Handling::Source {
                loaders: vec!["style-loader".to_string(), "css-loader".to_string()],
            },
        },
        RawRule {
            test: r"\.(png|jpg|gif|svg)$".to_string(),
            handling: Handling::Asset { filename: None },
        },
    ]
}

/// Validated configuration.
///
/// Relative paths are resolved against `base_dir`, the directory that held
/// the config file.
#[derive(Debug, Clone)]
pub struct BootConfig {
    pub base_dir: PathBuf,
    pub mode: Mode,
    pub entry: String,
    pub output: OutputConfig,
    pub resolve: ResolveConfig,
    pub rules: Vec<AssetRule>,
    pub copy: Vec<CopyPattern>,
    pub dev_server: DevServerConfig,
    pub loader: LoaderConfig,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self::from_raw(RawConfig::default(), PathBuf::from("."))
            .expect("built-in rules compile")
    }
}

impl BootConfig {
    /// Read a config file. Its directory becomes `base_dir`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let raw: RawConfig = serde_json::from_str(&text)?;
        debug!(path = %path.display(), "loaded config");
        Self::from_raw(raw, base_dir)
    }

    /// Parse config text, resolving relative paths against the current directory.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(text)?;
        Self::from_raw(raw, PathBuf::from("."))
    }

    fn from_raw(raw: RawConfig, base_dir: PathBuf) -> Result<Self, ConfigError> {
        let rules = raw
            .rules
            .into_iter()
            .map(|r| {
                Regex::new(&r.test)
                    .map(|test| AssetRule {
                        test,
                        handling: r.handling,
                    })
                    .map_err(|source| ConfigError::InvalidRule {
                        pattern: r.test,
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let copy = raw.copy.unwrap_or_else(|| {
            vec![CopyPattern {
                from: PathBuf::from("static"),
                to: raw.output.path.clone(),
            }]
        });
        if let Some(index) = copy.iter().position(|c| c.from.as_os_str().is_empty()) {
            return Err(ConfigError::EmptyCopySource { index });
        }

        let mut dev_server = raw.dev_server.unwrap_or(DevServerConfig {
            static_dir: None,
            port: default_port(),
            hot: default_hot(),
        });
        if dev_server.static_dir.is_none() {
            dev_server.static_dir = Some(raw.output.path.clone());
        }

        Ok(Self {
            base_dir,
            mode: raw.mode,
            entry: raw.entry,
            output: raw.output,
            resolve: raw.resolve,
            rules,
            copy,
            dev_server,
            loader: raw.loader,
        })
    }

    /// Effective mode: `BOOT_MODE` when set and valid, else the configured one.
    pub fn mode(&self) -> Mode {
        self.mode_with_override(std::env::var(MODE_ENV).ok().as_deref())
    }

    pub fn mode_with_override(&self, value: Option<&str>) -> Mode {
        value
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.mode)
    }

    fn resolve_path(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }

    /// Output directory joined with the wasm file name.
    pub fn artifact_location(&self) -> ArtifactLocation {
        ArtifactLocation::Path(
            self.resolve_path(&self.output.path)
                .join(&self.output.wasm_filename),
        )
    }

    /// Handling of the first rule whose pattern matches `path`.
    pub fn classify(&self, path: &Path) -> Option<&Handling> {
        let text = path.to_string_lossy();
        self.rules
            .iter()
            .find(|r| r.test.is_match(&text))
            .map(|r| &r.handling)
    }

    /// Output file name for `path` under `handling`, or `None` for sources.
    pub fn emitted_name(&self, path: &Path) -> Option<String> {
        match self.classify(path)? {
            Handling::Asset { filename } => Some(asset_file_name(
                path,
                filename.as_deref().unwrap_or("[name][ext]"),
            )),
            Handling::Source { .. } => None,
        }
    }

    /// First existing file among `base` and `base` + each resolve extension.
    pub fn resolve_module(&self, base: &Path) -> Option<PathBuf> {
        let base = self.resolve_path(base);
        if base.is_file() {
            return Some(base);
        }
        self.resolve.extensions.iter().find_map(|ext| {
            let mut candidate = base.clone().into_os_string();
            candidate.push(ext);
            let candidate = PathBuf::from(candidate);
            candidate.is_file().then_some(candidate)
        })
    }

    /// Copy every static mapping into place. Returns the number of files copied.
    ///
    /// A missing `from` directory copies nothing.
    pub fn stage_static(&self) -> Result<usize, ConfigError> {
        let mut total = 0;
        for pattern in &self.copy {
            let from = self.resolve_path(&pattern.from);
            let to = self.resolve_path(&pattern.to);
            if !from.exists() {
                debug!(from = %from.display(), "copy source missing, skipped");
                continue;
            }
            let copied = copy_tree(&from, &to).map_err(|source| ConfigError::Copy {
                from: from.clone(),
                to: to.clone(),
                source,
            })?;
            debug!(from = %from.display(), to = %to.display(), copied, "staged static files");
            total += copied;
        }
        Ok(total)
    }
}

/// Expand `[name]` and `[ext]` in a file name template.
///
/// `[ext]` includes the leading dot, or is empty when the path has none.
pub fn asset_file_name(path: &Path, template: &str) -> String {
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    template.replace("[name]", &name).replace("[ext]", &ext)
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<usize> {
    if from.is_file() {
        if let Some(parent) = to.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let target = if to.is_dir() {
            to.join(from.file_name().unwrap_or_default())
        } else {
            to.to_path_buf()
        };
        fs::copy(from, target)?;
        return Ok(1);
    }

    fs::create_dir_all(to)?;
    // `to` may sit inside `from`; never walk into our own output.
    let skip = fs::canonicalize(to)?;
    copy_dir(from, to, &skip)
}

fn copy_dir(from: &Path, to: &Path, skip: &Path) -> io::Result<usize> {
    fs::create_dir_all(to)?;
    let mut count = 0;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            if fs::canonicalize(&src)? == skip {
                continue;
            }
            count += copy_dir(&src, &dst, skip)?;
        } else {
            fs::copy(&src, &dst)?;
            count += 1;
        }
    }
    Ok(count)
}
