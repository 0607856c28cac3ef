//! Discovery file: publishes the bound listen identity for external tooling

use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::errors::{BrokerError, Result};

/// Atomically write `identity` to `path`
///
/// The text is written to a temporary file in the same directory and then
/// renamed over `path`, so a concurrent reader sees either the previous file,
/// no file, or the complete identity.
pub fn write_discovery_file(path: &Path, identity: &str) -> Result<()> {
    let wrap = |source: std::io::Error| BrokerError::DiscoveryFile {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(wrap)?;

    let mut temp = NamedTempFile::new_in(dir).map_err(wrap)?;
    temp.write_all(identity.as_bytes()).map_err(wrap)?;
    temp.as_file().sync_all().map_err(wrap)?;
    temp.persist(path).map_err(|e| wrap(e.error))?;

    debug!(path = %path.display(), identity, "wrote discovery file");
    Ok(())
}
