//! Artifact locations and the fetchers that read them.

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::LoadError;

/// Where a compiled module lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLocation {
    /// A filesystem path, given directly or as a `file://` URL.
    Path(PathBuf),
    /// Any other URL. Kept verbatim.
    Url { scheme: String, url: String },
}

impl ArtifactLocation {
    /// Parse a path or URL.
    ///
    /// Anything of the form `scheme://rest` is a URL. `file://` URLs naming
    /// the local machine (no host, or `localhost`) are turned back into
    /// percent-decoded paths; a `file://` URL on another host stays a URL.
    /// Everything else is a path.
    pub fn parse(s: &str) -> Self {
        match s.split_once("://") {
            Some((scheme, rest)) if is_scheme(scheme) => {
                if scheme.eq_ignore_ascii_case("file")
                    && let Some(path) = local_file_path(rest)
                {
                    return ArtifactLocation::Path(path);
                }
                ArtifactLocation::Url {
                    scheme: scheme.to_ascii_lowercase(),
                    url: s.to_string(),
                }
            }
            _ => ArtifactLocation::Path(PathBuf::from(s)),
        }
    }

    /// The filesystem path, if this location is one.
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            ArtifactLocation::Path(p) => Some(p),
            ArtifactLocation::Url { .. } => None,
        }
    }
}

/// The path of a `file://` URL body (`authority/path`) when the authority
/// is the local machine.
fn local_file_path(rest: &str) -> Option<PathBuf> {
    let (host, path) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };
    if !(host.is_empty() || host.eq_ignore_ascii_case("localhost")) || path.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(path).unwrap_or(Cow::Borrowed(path));
    Some(PathBuf::from(decoded.as_ref()))
}

fn is_scheme(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

impl FromStr for ArtifactLocation {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ArtifactLocation::parse(s))
    }
}

impl From<PathBuf> for ArtifactLocation {
    fn from(path: PathBuf) -> Self {
        ArtifactLocation::Path(path)
    }
}

impl From<&Path> for ArtifactLocation {
    fn from(path: &Path) -> Self {
        ArtifactLocation::Path(path.to_path_buf())
    }
}

impl fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactLocation::Path(p) => write!(f, "{}", p.display()),
            ArtifactLocation::Url { url, .. } => f.write_str(url),
        }
    }
}

/// Source of raw module bytes.
pub trait Fetch {
    /// Read the full contents at `location`.
    fn fetch(
        &self,
        location: &ArtifactLocation,
    ) -> impl Future<Output = Result<Vec<u8>, LoadError>>;
}

/// Reads modules from the local filesystem.
///
/// Non-file URLs are rejected as fetch failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileFetcher;

impl Fetch for FileFetcher {
    async fn fetch(&self, location: &ArtifactLocation) -> Result<Vec<u8>, LoadError> {
        match location {
            ArtifactLocation::Path(path) => {
                tokio::fs::read(path).await.map_err(|source| LoadError::Fetch {
                    location: location.to_string(),
                    source,
                })
            }
            ArtifactLocation::Url { scheme, .. } => Err(LoadError::Fetch {
                location: location.to_string(),
                source: io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("no fetcher for '{scheme}' URLs"),
                ),
            }),
        }
    }
}
