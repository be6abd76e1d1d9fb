//! Discovery of extensions laid out on disk.
//!
//! Each subdirectory of the catalog root holds one extension:
//!
//! ```text
//! extensions/
//!   my-provider/
//!     extension.toml
//!     main.rhai
//! ```

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::descriptor::ExtensionDescriptor;
use crate::error::ExtensionError;
use crate::manifest::{ExtensionManifest, MANIFEST_FILE};

/// One discovery result per extension directory.
pub type Discovered = (PathBuf, Result<ExtensionDescriptor, ExtensionError>);

/// Scan `dir` for extension directories.
///
/// A broken manifest only fails its own entry. Entries are sorted by path.
/// Plain files in `dir` are ignored.
pub async fn discover(dir: &Path) -> Result<Vec<Discovered>, ExtensionError> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
        ExtensionError::Manifest(format!(
            "failed to read extension directory {}: {e}",
            dir.display()
        ))
    })?;

    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let path = entry.path();
        let result = read_extension(&path).await;
        match &result {
            Ok(descriptor) => debug!(
                extension = %descriptor.id,
                path = %path.display(),
                "extension discovered"
            ),
            Err(e) => warn!(path = %path.display(), "skipping extension: {e}"),
        }
        found.push((path, result));
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

/// Every descriptor that was read successfully.
pub fn descriptors(discovered: Vec<Discovered>) -> Vec<ExtensionDescriptor> {
    discovered.into_iter().filter_map(|(_, r)| r.ok()).collect()
}

/// Read and validate one extension directory.
pub async fn read_extension(path: &Path) -> Result<ExtensionDescriptor, ExtensionError> {
    let manifest_path = path.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Err(ExtensionError::Manifest(format!(
            "{MANIFEST_FILE} not found in {}",
            path.display()
        )));
    }
    let content = tokio::fs::read_to_string(&manifest_path)
        .await
        .map_err(|e| ExtensionError::Manifest(format!("failed to read {MANIFEST_FILE}: {e}")))?;
    let manifest = ExtensionManifest::parse_and_validate(&content)?;

    let entry_path = path.join(&manifest.extension.entry);
    let payload = tokio::fs::read_to_string(&entry_path).await.map_err(|e| {
        ExtensionError::Manifest(format!(
            "failed to read entry {}: {e}",
            manifest.extension.entry
        ))
    })?;

    Ok(manifest.into_descriptor(payload))
}
