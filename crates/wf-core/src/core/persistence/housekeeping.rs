use sha2::{Digest, Sha256};

use super::*;
use crate::core::fs::format_bytes;

const CONTAINER_IMG_EXT: &str = "simg";
const CONDA_HASH_PREFIX_LEN: usize = 8;

/// Outcome of [`Persistence::cleanup_containers`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContainerCleanup {
    pub removed: usize,
    pub reclaimed_bytes: u64,
}

impl Persistence {
    /// Drop the history record of one file. Returns `false` if there was none.
    pub fn cleanup_metadata(&self, path: &str) -> Result<bool> {
        self.records.delete(Subject::Metadata, path)
    }

    /// Empty the shadow directory.
    pub fn cleanup_shadow(&self) -> Result<()> {
        if self.shadow_dir.exists() {
            remove_dir_all_if_exists(&self.shadow_dir)?;
            fs::create_dir_all(&self.shadow_dir)
                .with_context(|| format!("failed to recreate {}", self.shadow_dir.display()))?;
        }
        Ok(())
    }

    /// Where the image for `url` is stored.
    #[must_use]
    pub fn container_img_path(&self, url: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(url.as_bytes()));
        self.container_img_dir
            .join(format!("{name}.{CONTAINER_IMG_EXT}"))
    }

    /// Remove stored images no job in `graph` refers to.
    pub fn cleanup_containers(&self, graph: &dyn JobGraph) -> Result<ContainerCleanup> {
        let required: HashSet<PathBuf> = graph
            .container_img_urls()
            .iter()
            .map(|url| self.container_img_path(url))
            .collect();
        let mut summary = ContainerCleanup::default();
        let entries = match fs::read_dir(&self.container_img_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(summary),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read {}", self.container_img_dir.display())
                })
            }
        };
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("failed to read {}", self.container_img_dir.display())
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(CONTAINER_IMG_EXT)
                || required.contains(&path)
            {
                continue;
            }
            let size = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
            remove_dir_all_if_exists(&path)?;
            debug!(path = %path.display(), "removed unused container image");
            summary.removed += 1;
            summary.reclaimed_bytes += size;
        }
        if summary.removed == 0 {
            info!("no containers require cleaning up");
        } else {
            info!(
                removed = summary.removed,
                reclaimed = %format_bytes(summary.reclaimed_bytes),
                "cleaned up unused containers"
            );
        }
        Ok(summary)
    }

    /// Remove environments and archives no job in `graph` uses.
    ///
    /// Environment directories are matched on the first eight characters of
    /// the environment hash; archives on the full content hash.
    pub fn conda_cleanup_envs(&self, graph: &dyn JobGraph) -> Result<()> {
        let envs = graph.conda_envs();
        let in_use: HashSet<&str> = envs
            .iter()
            .filter_map(|env| env.hash.get(..CONDA_HASH_PREFIX_LEN))
            .collect();
        for (name, path) in dir_entries(&self.conda_env_dir)? {
            let Some(prefix) = name.get(..CONDA_HASH_PREFIX_LEN) else {
                continue;
            };
            if in_use.contains(prefix) {
                continue;
            }
            remove_dir_all_if_exists(&path)?;
            debug!(path = %path.display(), "removed unused environment");
        }

        let archived: HashSet<&str> = envs.iter().map(|env| env.content_hash.as_str()).collect();
        for (name, path) in dir_entries(&self.conda_env_archive_dir)? {
            if archived.contains(name.as_str()) {
                continue;
            }
            remove_dir_all_if_exists(&path)?;
            debug!(path = %path.display(), "removed unused environment archive");
        }
        Ok(())
    }
}

fn dir_entries(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", dir.display())),
    };
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        if let Ok(name) = entry.file_name().into_string() {
            found.push((name, entry.path()));
        }
    }
    Ok(found)
}
