//! Versioned, verified self-update.
//!
//! The update server publishes a manifest naming the latest release. A newer
//! release is downloaded, checked against the manifest's BLAKE3 keyed hash
//! and staged atomically under the state directory; a supervisor outside the
//! agent swaps the binary in.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{AgentError, Result};

const RELEASE_FILE: &str = "release.json";

/// Description of a published release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Monotonically increasing release number.
    pub release: u64,
    /// Human-readable version.
    pub version: String,
    /// Where to download the artifact.
    pub url: String,
    /// Hex BLAKE3 keyed hash of the artifact.
    pub digest: String,
}

/// A verified artifact ready to be installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedUpdate {
    /// Release number.
    pub release: u64,
    /// Human-readable version.
    pub version: String,
    /// Path of the staged artifact.
    pub path: PathBuf,
}

/// Source of agent updates.
#[async_trait]
pub trait Updater: Send + Sync {
    /// Check for a newer release and stage it.
    ///
    /// Returns `None` when the current release is up to date.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest or artifact cannot be fetched, or
    /// `AgentError::Verification` if the artifact does not match its digest.
    async fn check(&self) -> Result<Option<StagedUpdate>>;
}

/// Last staged release, persisted so restarts never stage an older one.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct ReleaseMarker {
    release: u64,
}

/// Updater that polls a JSON manifest over HTTP.
pub struct ManifestUpdater {
    client: reqwest::Client,
    manifest_url: String,
    key: [u8; 32],
    staging_dir: PathBuf,
    max_artifact_bytes: usize,
}

impl ManifestUpdater {
    /// Create an updater verifying with the hex-encoded 32-byte `key`.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Config` if the key is malformed.
    pub fn new(
        client: reqwest::Client,
        manifest_url: impl Into<String>,
        key_hex: &str,
        state_dir: &Path,
    ) -> Result<Self> {
        let bytes = hex::decode(key_hex.trim())
            .map_err(|e| AgentError::Config(format!("update key is not hex: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AgentError::Config("update key must be 32 bytes".into()))?;
        Ok(Self {
            client,
            manifest_url: manifest_url.into(),
            key,
            staging_dir: state_dir.join("updates"),
            max_artifact_bytes: 256 * 1024 * 1024, // 256 MB
        })
    }

    async fn current_release(&self) -> u64 {
        match fs::read(self.staging_dir.join(RELEASE_FILE)).await {
            Ok(bytes) => serde_json::from_slice::<ReleaseMarker>(&bytes)
                .map(|m| m.release)
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    async fn fetch_manifest(&self) -> Result<Manifest> {
        let response = self
            .client
            .get(&self.manifest_url)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn fetch_artifact(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        if bytes.len() > self.max_artifact_bytes {
            return Err(AgentError::Verification(format!(
                "artifact is {} bytes, limit is {}",
                bytes.len(),
                self.max_artifact_bytes
            )));
        }
        Ok(bytes.to_vec())
    }

    fn verify(&self, artifact: &[u8], digest: &str) -> Result<()> {
        let expected = blake3::Hash::from_hex(digest.trim())
            .map_err(|e| AgentError::Verification(format!("malformed digest: {e}")))?;
        // blake3::Hash equality is constant-time.
        if blake3::keyed_hash(&self.key, artifact) != expected {
            return Err(AgentError::Verification("digest mismatch".into()));
        }
        Ok(())
    }

    async fn stage(&self, manifest: &Manifest, artifact: &[u8]) -> Result<PathBuf> {
        fs::create_dir_all(&self.staging_dir).await?;
        let target = self
            .staging_dir
            .join(format!("prism-agent-{}", manifest.release));
        let tmp = target.with_extension("tmp");

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(artifact).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &target).await?;

        let marker = ReleaseMarker {
            release: manifest.release,
        };
        let marker_path = self.staging_dir.join(RELEASE_FILE);
        let marker_tmp = marker_path.with_extension("tmp");
        fs::write(&marker_tmp, serde_json::to_vec(&marker)?).await?;
        fs::rename(&marker_tmp, &marker_path).await?;
        Ok(target)
    }
}

#[async_trait]
impl Updater for ManifestUpdater {
    async fn check(&self) -> Result<Option<StagedUpdate>> {
        let current = self.current_release().await;
        let manifest = self.fetch_manifest().await?;
        if manifest.release <= current {
            tracing::debug!(current, offered = manifest.release, "Agent is up to date");
            return Ok(None);
        }

        tracing::info!(
            current,
            release = manifest.release,
            version = %manifest.version,
            "Agent update available"
        );
        let artifact = self.fetch_artifact(&manifest.url).await?;
        if let Err(e) = self.verify(&artifact, &manifest.digest) {
            tracing::error!(release = manifest.release, error = %e, "Rejected agent update");
            return Err(e);
        }

        let path = self.stage(&manifest, &artifact).await?;
        tracing::info!(release = manifest.release, path = %path.display(), "Agent update staged");
        Ok(Some(StagedUpdate {
            release: manifest.release,
            version: manifest.version,
            path,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: [u8; 32] = [7u8; 32];
    const ARTIFACT: &[u8] = b"\x7fELF prism-agent build";

    async fn publish(server: &MockServer, release: u64, digest: String) {
        Mock::given(method("GET"))
            .and(path("/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Manifest {
                release,
                version: format!("1.{release}.0"),
                url: format!("{}/artifacts/{release}", server.uri()),
                digest,
            }))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/artifacts/{release}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(ARTIFACT))
            .mount(server)
            .await;
    }

    fn updater(server: &MockServer, dir: &TempDir) -> ManifestUpdater {
        ManifestUpdater::new(
            reqwest::Client::new(),
            format!("{}/manifest.json", server.uri()),
            &hex::encode(KEY),
            dir.path(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn stages_a_verified_release_once() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        publish(&server, 3, blake3::keyed_hash(&KEY, ARTIFACT).to_hex().to_string()).await;
        let updater = updater(&server, &dir);

        let staged = updater.check().await.unwrap().unwrap();
        assert_eq!(staged.release, 3);
        assert_eq!(fs::read(&staged.path).await.unwrap(), ARTIFACT);

        assert!(updater.check().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_a_bad_digest() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let wrong = blake3::keyed_hash(&[8u8; 32], ARTIFACT).to_hex().to_string();
        publish(&server, 4, wrong).await;

        let result = updater(&server, &dir).check().await;
        assert!(matches!(result, Err(AgentError::Verification(_))));
        assert!(!dir.path().join("updates/prism-agent-4").exists());
    }

    #[tokio::test]
    async fn ignores_older_releases() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("updates")).unwrap();
        std::fs::write(dir.path().join("updates").join(RELEASE_FILE), br#"{"release":5}"#).unwrap();
        publish(&server, 4, blake3::keyed_hash(&KEY, ARTIFACT).to_hex().to_string()).await;

        assert!(updater(&server, &dir).check().await.unwrap().is_none());
    }

    #[test]
    fn key_must_be_32_bytes() {
        let dir = TempDir::new().unwrap();
        let result = ManifestUpdater::new(reqwest::Client::new(), "http://x", "abcd", dir.path());
        assert!(matches!(result, Err(AgentError::Config(_))));
    }
}
