use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::env;

pub mod version;

/// Name of the manifest document, both remotely and inside the cache directory.
pub const MANIFEST_FILENAME: &str = "app.json";
/// Platform filter entry matching every host.
pub const ALL_PLATFORMS: &str = "*";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactDescriptor {
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ArtifactDescriptor {
    pub fn applies_to(&self, host_tag: &str) -> bool {
        platform_matches(&self.platforms, host_tag)
    }

    pub fn load_for_current_platform(&self) -> bool {
        self.applies_to(env::host_platform_tag())
    }

    /// Location of this artifact inside the cache directory.
    pub fn cache_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(&self.path)
    }
}

/// An empty filter or one containing `*` matches every platform.
pub fn platform_matches(platforms: &[String], host_tag: &str) -> bool {
    platforms.is_empty()
        || platforms
            .iter()
            .any(|tag| tag == ALL_PLATFORMS || tag.eq_ignore_ascii_case(host_tag))
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Location artifacts are resolved against. Excluded from equality.
    #[serde(default)]
    pub source: String,
    pub version: String,
    #[serde(default)]
    pub accept_downgrade: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whats_new_page: Option<String>,
    #[serde(default)]
    pub lingering_update_screen: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<String>,
    #[serde(default)]
    pub preload_native_libraries: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactDescriptor>,
}

impl PartialEq for Manifest {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.accept_downgrade == other.accept_downgrade
            && self.whats_new_page == other.whats_new_page
            && self.lingering_update_screen == other.lingering_update_screen
            && self.launch_command == other.launch_command
            && self.launch_class == other.launch_class
            && self.parameters == other.parameters
            && self.preload_native_libraries == other.preload_native_libraries
            && self.cache_dir == other.cache_dir
            && self.artifacts == other.artifacts
    }
}

impl Eq for Manifest {}

impl Manifest {
    /// Parse a manifest document and check its invariants.
    pub fn from_json(text: &str) -> Result<Self, String> {
        let manifest: Manifest =
            serde_json::from_str(text).map_err(|e| format!("manifest parse error: {e}"))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string_pretty(self).map_err(|e| format!("manifest encode error: {e}"))
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for artifact in &self.artifacts {
            if !is_contained_relative_path(&artifact.path) {
                return Err(format!(
                    "artifact path {} must be relative to the cache directory",
                    artifact.path
                ));
            }
            if !seen.insert(artifact.path.as_str()) {
                return Err(format!("duplicate artifact path {}", artifact.path));
            }
        }
        Ok(())
    }

    /// Ties are not newer.
    pub fn is_newer_than(&self, other: &Manifest) -> bool {
        version::compare_versions(&self.version, &other.version) == Ordering::Greater
    }

    /// Artifacts for the given host, in manifest order.
    pub fn artifacts_for<'a>(
        &'a self,
        host_tag: &'a str,
    ) -> impl Iterator<Item = &'a ArtifactDescriptor> + 'a {
        self.artifacts
            .iter()
            .filter(move |artifact| artifact.applies_to(host_tag))
    }

    pub fn platform_artifacts(&self) -> impl Iterator<Item = &ArtifactDescriptor> {
        self.artifacts
            .iter()
            .filter(|artifact| artifact.load_for_current_platform())
    }

    /// Cache paths of the artifacts for the given host, in manifest order.
    pub fn artifact_paths_for(&self, cache_dir: &Path, host_tag: &str) -> Vec<PathBuf> {
        self.artifacts_for(host_tag)
            .map(|artifact| artifact.cache_path(cache_dir))
            .collect()
    }

    pub fn cache_dir(&self) -> PathBuf {
        env::resolve_cache_dir(self.cache_dir.as_deref())
    }

    /// `<source>/<relative>` with exactly one separator between the parts.
    pub fn resolve(&self, relative: &str) -> String {
        join_location(&self.source, relative)
    }

    pub fn manifest_location(&self) -> String {
        self.resolve(MANIFEST_FILENAME)
    }

    pub fn launch_command(&self) -> Option<&str> {
        non_blank(self.launch_command.as_deref())
    }

    pub fn entry_point(&self) -> Option<&str> {
        non_blank(self.launch_class.as_deref())
    }

    pub fn parameters(&self) -> Option<&str> {
        non_blank(self.parameters.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn is_contained_relative_path(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

pub fn join_location(base: &str, relative: &str) -> String {
    let base = base.trim_end_matches(['/', '\\']);
    let relative = relative.trim_start_matches(['/', '\\']);
    if base.is_empty() {
        relative.to_owned()
    } else {
        format!("{base}/{relative}")
    }
}

/// The directory part of a location (`http://host/app/app.json` -> `http://host/app`).
pub fn parent_location(location: &str) -> String {
    let trimmed = location.trim_end_matches('/');
    match trimmed.rfind(['/', '\\']) {
        Some(idx) => trimmed[..idx].to_owned(),
        None => String::new(),
    }
}
