//! Upstream config persistence
//!
//! Writes the rendered nginx upstream block to disk. The new content goes to a
//! temporary file in the destination directory and is renamed over the target,
//! so nginx never sees a truncated file and a failed write leaves the previous
//! config in place.

use crate::error::SyncError;
use common::UpstreamSet;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

/// Mode applied to the generated file (nginx workers must be able to read it)
#[cfg(unix)]
const UPSTREAM_CONF_MODE: u32 = 0o644;

/// Render `upstreams` and atomically replace the file at `path`.
///
/// The write runs on the blocking pool; rendering happens on the caller.
pub async fn write_upstream_conf(
    path: &Path,
    upstream_name: &str,
    upstreams: &UpstreamSet,
) -> Result<(), SyncError> {
    let rendered = upstreams.render(upstream_name);
    let len = rendered.len();
    let target = path.to_path_buf();

    tokio::task::spawn_blocking(move || write_atomic(&target, rendered.as_bytes()))
        .await
        .unwrap_or_else(|e| Err(std::io::Error::other(e)))
        .map_err(|source| SyncError::ArtifactWrite {
            path: path.to_path_buf(),
            source,
        })?;

    debug!(
        "Wrote {} bytes ({} servers) to {}",
        len,
        upstreams.len(),
        path.display()
    );
    Ok(())
}

fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    // Same directory as the target so the final rename stays on one filesystem
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(UPSTREAM_CONF_MODE))?;
    }

    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
