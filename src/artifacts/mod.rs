use std::path::Path;

use log::{debug, info};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::env;
use crate::error::{BootstrapError, Result};
use crate::manifest::{ArtifactDescriptor, Manifest};
use crate::networking::NetworkClient;
use crate::util::{format_size, progress_fraction};

/// Whether the cached copy of `artifact` is missing or stale.
///
/// Size is the primary check; a declared sha256 is compared as well.
pub async fn needs_update(artifact: &ArtifactDescriptor, cache_dir: &Path) -> bool {
    let path = artifact.cache_path(cache_dir);
    let metadata = match fs::metadata(&path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        _ => return true,
    };
    if metadata.len() != artifact.size {
        return true;
    }
    match artifact.sha256.as_deref().map(str::trim) {
        Some(expected) if !expected.is_empty() => match file_sha256(&path).await {
            Ok(actual) => !actual.eq_ignore_ascii_case(expected),
            Err(_) => true,
        },
        _ => false,
    }
}

async fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Platform-applicable artifacts that need downloading, in manifest order.
pub async fn update_set<'a>(
    manifest: &'a Manifest,
    cache_dir: &Path,
    host_tag: &'a str,
) -> Vec<&'a ArtifactDescriptor> {
    let mut pending = Vec::new();
    for artifact in manifest.artifacts_for(host_tag) {
        if needs_update(artifact, cache_dir).await {
            pending.push(artifact);
        }
    }
    pending
}

/// Monotonic `written / total` reporting that ends at exactly 1.0.
struct ProgressTracker<F> {
    total: u64,
    written: u64,
    callback: F,
}

impl<F: FnMut(f64)> ProgressTracker<F> {
    fn advance(&mut self, bytes: usize) {
        self.written = self.written.saturating_add(bytes as u64);
        (self.callback)(progress_fraction(self.written, self.total));
    }

    fn finish(&mut self) {
        (self.callback)(1.0);
    }
}

#[derive(Clone)]
pub struct ArtifactFetcher {
    network: NetworkClient,
}

impl ArtifactFetcher {
    pub fn new(network: NetworkClient) -> Self {
        Self { network }
    }

    /// Bring the cache in line with `manifest`. Returns whether anything was written.
    pub async fn sync<F>(&self, manifest: &Manifest, cache_dir: &Path, progress: F) -> Result<bool>
    where
        F: FnMut(f64),
    {
        self.sync_for(manifest, cache_dir, env::host_platform_tag(), progress)
            .await
    }

    pub async fn sync_for<F>(
        &self,
        manifest: &Manifest,
        cache_dir: &Path,
        host_tag: &str,
        progress: F,
    ) -> Result<bool>
    where
        F: FnMut(f64),
    {
        let pending = update_set(manifest, cache_dir, host_tag).await;
        if pending.is_empty() {
            info!("artifact sync: cache is up to date");
            return Ok(false);
        }

        let total: u64 = pending.iter().map(|artifact| artifact.size).sum();
        info!(
            "artifact sync: {} artifact(s), {} to fetch",
            pending.len(),
            format_size(total)
        );
        let mut tracker = ProgressTracker {
            total,
            written: 0,
            callback: progress,
        };

        for artifact in pending {
            self.fetch_artifact(manifest, artifact, cache_dir, &mut tracker)
                .await?;
        }
        tracker.finish();
        Ok(true)
    }

    async fn fetch_artifact<F: FnMut(f64)>(
        &self,
        manifest: &Manifest,
        artifact: &ArtifactDescriptor,
        cache_dir: &Path,
        tracker: &mut ProgressTracker<F>,
    ) -> Result<()> {
        let location = manifest.resolve(&artifact.path);
        let dest = artifact.cache_path(cache_dir);
        debug!("artifact sync: {} -> {}", location, dest.display());

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| BootstrapError::filesystem(parent, e))?;
        }
        let mut source = self.network.open(&location).await?;
        let mut file = File::create(&dest)
            .await
            .map_err(|e| BootstrapError::filesystem(&dest, e))?;

        let mut received: u64 = 0;
        while let Some(chunk) = source.next_chunk(&location).await? {
            file.write_all(&chunk)
                .await
                .map_err(|e| BootstrapError::filesystem(&dest, e))?;
            received += chunk.len() as u64;
            tracker.advance(chunk.len());
        }
        file.flush()
            .await
            .map_err(|e| BootstrapError::filesystem(&dest, e))?;

        if received != artifact.size {
            return Err(BootstrapError::network(
                location,
                format!(
                    "download incomplete: received {received} of {} bytes",
                    artifact.size
                ),
            ));
        }
        if let Some(expected) = artifact.sha256.as_deref().map(str::trim)
            && !expected.is_empty()
        {
            let actual = file_sha256(&dest)
                .await
                .map_err(|e| BootstrapError::filesystem(&dest, e))?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(BootstrapError::network(
                    location,
                    format!("sha256 mismatch: expected {expected}, got {actual}"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn artifact(path: &str, size: u64, platforms: &[&str]) -> ArtifactDescriptor {
        ArtifactDescriptor {
            path: path.into(),
            size,
            platforms: platforms.iter().map(|p| p.to_string()).collect(),
            sha256: None,
        }
    }

    fn local_source(files: &[(&str, usize)]) -> (tempfile::TempDir, Manifest) {
        let source = tempfile::tempdir().unwrap();
        let mut manifest = Manifest {
            source: source.path().to_str().unwrap().to_owned(),
            version: "1.0".into(),
            ..Default::default()
        };
        for (name, len) in files {
            let path = source.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, vec![1u8; *len]).unwrap();
            manifest.artifacts.push(artifact(name, *len as u64, &[]));
        }
        (source, manifest)
    }

    #[tokio::test]
    async fn needs_update_tracks_presence_and_size() {
        let cache = tempfile::tempdir().unwrap();
        let descriptor = artifact("lib/a.bin", 4, &[]);
        assert!(needs_update(&descriptor, cache.path()).await);

        std::fs::create_dir_all(cache.path().join("lib")).unwrap();
        std::fs::write(cache.path().join("lib/a.bin"), b"abc").unwrap();
        assert!(needs_update(&descriptor, cache.path()).await);

        std::fs::write(cache.path().join("lib/a.bin"), b"abcd").unwrap();
        assert!(!needs_update(&descriptor, cache.path()).await);
    }

    #[tokio::test]
    async fn declared_hash_must_match() {
        let cache = tempfile::tempdir().unwrap();
        std::fs::write(cache.path().join("a.bin"), b"abcd").unwrap();
        let mut descriptor = artifact("a.bin", 4, &[]);
        descriptor.sha256 =
            Some("88d4266fd4e6338d13b845fcf289579d209c897823b9217da3e161936f031589".into());
        assert!(!needs_update(&descriptor, cache.path()).await);

        descriptor.sha256 = Some("00".repeat(32));
        assert!(needs_update(&descriptor, cache.path()).await);
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let (_source, manifest) = local_source(&[("lib/a.bin", 100), ("b.bin", 50)]);
        let cache = tempfile::tempdir().unwrap();
        let fetcher = ArtifactFetcher::new(NetworkClient::new(false));

        assert!(fetcher.sync(&manifest, cache.path(), |_| {}).await.unwrap());
        assert_eq!(std::fs::read(cache.path().join("lib/a.bin")).unwrap().len(), 100);

        let mut calls = 0;
        let changed = fetcher
            .sync(&manifest, cache.path(), |_| calls += 1)
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_ends_at_one() {
        let (_source, manifest) = local_source(&[("a.bin", 200_000), ("b.bin", 70_000)]);
        let cache = tempfile::tempdir().unwrap();
        let fetcher = ArtifactFetcher::new(NetworkClient::new(false));

        let mut seen = Vec::new();
        fetcher
            .sync(&manifest, cache.path(), |p| seen.push(p))
            .await
            .unwrap();

        assert!(seen.len() > 2);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 1.0);
    }

    #[tokio::test]
    async fn other_platform_artifacts_are_skipped() {
        let (_source, mut manifest) = local_source(&[("common.bin", 10)]);
        manifest.artifacts.push(artifact("win-only.dll", 10, &["win"]));
        let cache = tempfile::tempdir().unwrap();
        let fetcher = ArtifactFetcher::new(NetworkClient::new(false));

        let changed = fetcher
            .sync_for(&manifest, cache.path(), "linux", |_| {})
            .await
            .unwrap();
        assert!(changed);
        assert!(cache.path().join("common.bin").exists());
        assert!(!cache.path().join("win-only.dll").exists());
    }

    #[tokio::test]
    async fn missing_source_aborts_with_network_error() {
        let (_source, mut manifest) = local_source(&[("a.bin", 10)]);
        manifest.artifacts.push(artifact("missing.bin", 10, &[]));
        let cache = tempfile::tempdir().unwrap();
        let fetcher = ArtifactFetcher::new(NetworkClient::new(false));

        let err = fetcher
            .sync(&manifest, cache.path(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Network { .. }));
        // Fully written artifacts are not selected again on the next run.
        assert!(!needs_update(&manifest.artifacts[0], cache.path()).await);
    }

    #[tokio::test]
    async fn short_body_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/app/lib/core.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9u8; 512]))
            .mount(&server)
            .await;

        let manifest = Manifest {
            source: format!("{}/app", server.uri()),
            version: "1.0".into(),
            artifacts: vec![artifact("lib/core.bin", 1024, &[])],
            ..Default::default()
        };
        let cache = tempfile::tempdir().unwrap();
        let fetcher = ArtifactFetcher::new(NetworkClient::new(false));

        let mut seen = Vec::new();
        let err = fetcher
            .sync(&manifest, cache.path(), |p| seen.push(p))
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Network { .. }));
        assert!(err.source().unwrap().to_string().contains("received 512 of 1024"));
        assert_ne!(seen.last().copied(), Some(1.0));
        assert!(needs_update(&manifest.artifacts[0], cache.path()).await);
    }

    #[tokio::test]
    async fn corrupt_body_fails_declared_hash() {
        let (_source, mut manifest) = local_source(&[("a.bin", 4)]);
        manifest.artifacts[0].sha256 = Some("00".repeat(32));
        let cache = tempfile::tempdir().unwrap();
        let fetcher = ArtifactFetcher::new(NetworkClient::new(false));

        let err = fetcher
            .sync(&manifest, cache.path(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Network { .. }));
    }

    #[tokio::test]
    async fn downloads_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/app/lib/core.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9u8; 1024]))
            .expect(1)
            .mount(&server)
            .await;

        let manifest = Manifest {
            source: format!("{}/app", server.uri()),
            version: "1.0".into(),
            artifacts: vec![artifact("lib/core.bin", 1024, &[])],
            ..Default::default()
        };
        let cache = tempfile::tempdir().unwrap();
        let fetcher = ArtifactFetcher::new(NetworkClient::new(false));
        assert!(fetcher.sync(&manifest, cache.path(), |_| {}).await.unwrap());
        assert!(!fetcher.sync(&manifest, cache.path(), |_| {}).await.unwrap());
        assert_eq!(std::fs::read(cache.path().join("lib/core.bin")).unwrap(), vec![9u8; 1024]);
    }
}
