use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tokio::fs;

use crate::error::{BootstrapError, Result};
use crate::manifest::{MANIFEST_FILENAME, Manifest, join_location, parent_location};
use crate::networking::NetworkClient;

const EMBEDDED_MANIFEST: &str = include_str!("../../app.json");
const EMBEDDED_LOCATION: &str = "embedded:app.json";

/// Explicit remote manifest overrides from the command line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocationOverrides {
    /// Full location of a manifest document; its directory becomes the source.
    pub app: Option<String>,
    /// Directory holding the manifest document.
    pub uri: Option<String>,
}

/// Pick the manifest location to contact: `app=` wins over `uri=`, which wins
/// over the source declared by the manifest itself.
pub fn resolve_remote_location(manifest: &Manifest, overrides: &LocationOverrides) -> String {
    if let Some(app) = overrides.app.as_deref().filter(|v| !v.trim().is_empty()) {
        return app.trim().to_owned();
    }
    if let Some(uri) = overrides.uri.as_deref().filter(|v| !v.trim().is_empty()) {
        return join_location(uri.trim(), MANIFEST_FILENAME);
    }
    manifest.manifest_location()
}

pub fn cached_manifest_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join(MANIFEST_FILENAME)
}

#[derive(Clone)]
pub struct ManifestStore {
    network: NetworkClient,
}

impl ManifestStore {
    pub fn new(network: NetworkClient) -> Self {
        Self { network }
    }

    /// The default manifest compiled into the shell.
    pub fn load_baseline() -> Result<Manifest> {
        Self::load_baseline_from(EMBEDDED_MANIFEST)
    }

    pub fn load_baseline_from(text: &str) -> Result<Manifest> {
        Manifest::from_json(text).map_err(|e| BootstrapError::parse(EMBEDDED_LOCATION, e))
    }

    /// Replace `manifest` with the cached copy in `cache_dir`, if there is one.
    /// An unreadable cache keeps the current manifest.
    pub async fn overlay_cached(manifest: &mut Manifest, cache_dir: &Path) -> bool {
        let path = cached_manifest_path(cache_dir);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("manifest store: no cached manifest at {}", path.display());
                return false;
            }
            Err(err) => {
                warn!(
                    "manifest store: failed to read cached manifest {}: {err}",
                    path.display()
                );
                return false;
            }
        };
        match Manifest::from_json(&text) {
            Ok(cached) => {
                info!(
                    "manifest store: using cached manifest version {}",
                    cached.version
                );
                *manifest = cached;
                true
            }
            Err(err) => {
                warn!("manifest store: ignoring corrupt cached manifest: {err}");
                false
            }
        }
    }

    pub async fn try_fetch_remote(&self, location: &str) -> Result<Manifest> {
        let bytes = self.network.fetch_bytes(location).await?;
        let text = String::from_utf8(bytes).map_err(|e| BootstrapError::parse(location, e))?;
        Manifest::from_json(&text).map_err(|e| BootstrapError::parse(location, e))
    }

    /// Fetch and parse a remote manifest; any failure is reported as absent.
    pub async fn fetch_remote(&self, location: &str) -> Option<Manifest> {
        match self.try_fetch_remote(location).await {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                warn!("manifest store: remote manifest unavailable: {err}");
                None
            }
        }
    }

    /// Adopt `remote` when it is newer or downgrades are accepted. The adopted
    /// manifest is re-sourced to where it was fetched from and persisted.
    pub async fn reconcile(
        local: &mut Manifest,
        remote: Manifest,
        fetched_from: &str,
        cache_dir: &Path,
    ) -> Result<bool> {
        if remote == *local {
            debug!("manifest store: remote manifest matches local copy");
            return Ok(false);
        }
        if !remote.is_newer_than(local) && !local.accept_downgrade {
            info!(
                "manifest store: remote version {} is not newer than {}; keeping local",
                remote.version, local.version
            );
            return Ok(false);
        }

        let mut adopted = remote;
        adopted.source = parent_location(fetched_from);
        Self::persist(&adopted, cache_dir).await?;
        info!(
            "manifest store: adopted version {} (was {}) from {}",
            adopted.version, local.version, adopted.source
        );
        *local = adopted;
        Ok(true)
    }

    pub async fn persist(manifest: &Manifest, cache_dir: &Path) -> Result<()> {
        let path = cached_manifest_path(cache_dir);
        let json = manifest
            .to_json()
            .map_err(|e| BootstrapError::parse(path.display().to_string(), e))?;
        fs::create_dir_all(cache_dir)
            .await
            .map_err(|e| BootstrapError::filesystem(cache_dir, e))?;
        fs::write(&path, json)
            .await
            .map_err(|e| BootstrapError::filesystem(&path, e))
    }
}
