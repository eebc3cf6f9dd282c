//! Buffer discovery: enumerate live buffers from their sidecars.

use std::fs;

use tracing::debug;

use taxel::consts::{BUFFER_PREFIX, META_SUFFIX, SHM_DIR};

use crate::buffer::{BufferMeta, ElementBuffer};
use crate::error::ServiceResult;

/// One discovered buffer.
#[derive(Debug, Clone)]
pub struct BufferInfo {
    /// Layout and ownership, as recorded at registration.
    pub meta: BufferMeta,
    /// Whether a runtime is driving the buffer right now.
    pub alive: bool,
}

/// Enumerate every discoverable buffer on the shared-memory tmpfs.
///
/// Sidecars that fail to parse, or whose buffer file is gone, are
/// skipped; a registrant crashing mid-teardown must not break
/// enumeration for everyone else.
pub fn list() -> ServiceResult<Vec<BufferInfo>> {
    let mut found = Vec::new();

    for entry in fs::read_dir(SHM_DIR)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(stem) = file_name.strip_suffix(META_SUFFIX) else {
            continue;
        };
        let Some(name) = stem.strip_prefix(BUFFER_PREFIX) else {
            continue;
        };

        let parsed = fs::read(entry.path())
            .ok()
            .and_then(|raw| serde_json::from_slice::<BufferMeta>(&raw).ok());
        let Some(meta) = parsed else {
            debug!(name, "skipping unreadable buffer sidecar");
            continue;
        };

        let alive = ElementBuffer::attach(name)
            .map(|buffer| buffer.header().is_alive())
            .unwrap_or(false);

        found.push(BufferInfo { meta, alive });
    }

    found.sort_by(|a, b| a.meta.name.cmp(&b.meta.name));
    Ok(found)
}
