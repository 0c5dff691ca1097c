//! Attaching packaged artifacts to a release.
//!
//! Uploading an asset whose name already exists on the release replaces it;
//! assets of other targets are never touched.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::SecretToken;
use crate::error::{CiError, CiResult};
use crate::release::package::{path_safe, ArtifactSet};
use crate::trigger::ReleaseRef;

const GITHUB_API_VERSION: &str = "2022-11-28";

/// Where an asset ended up; outlives the job's workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedAsset {
    pub name: String,
    pub location: String,
    /// A same-named asset existed and was replaced.
    pub replaced: bool,
}

/// Publishes a target's artifact set to a release's asset list.
#[async_trait]
pub trait AssetPublisher: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(
        &self,
        release: &ReleaseRef,
        artifacts: &ArtifactSet,
    ) -> CiResult<PublishedAsset>;
}

// ---------------------------------------------------------------------------
// GitHub releases
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GithubRelease {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    id: u64,
    name: String,
    #[serde(default)]
    browser_download_url: String,
}

/// Uploads assets through the GitHub REST API.
pub struct GithubReleasePublisher {
    client: reqwest::Client,
    api_url: String,
    upload_url: String,
    repository: String,
    token: SecretToken,
}

impl GithubReleasePublisher {
    /// `repository` is `owner/name`.
    pub fn new(
        api_url: &str,
        upload_url: &str,
        repository: &str,
        token: SecretToken,
    ) -> CiResult<Self> {
        if repository.split('/').filter(|s| !s.is_empty()).count() != 2 {
            return Err(CiError::Config(format!(
                "repository must be owner/name, got {repository:?}"
            )));
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("forgeflow/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            upload_url: upload_url.trim_end_matches('/').to_string(),
            repository: repository.to_string(),
            token,
        })
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(self.token.expose())
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
    }

    async fn resolve_release_id(&self, release: &ReleaseRef) -> CiResult<u64> {
        if let Some(id) = release.release_id {
            return Ok(id);
        }
        let url = format!(
            "{}/repos/{}/releases/tags/{}",
            self.api_url, self.repository, release.tag
        );
        let found: GithubRelease = self
            .request(reqwest::Method::GET, url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(found.id)
    }

    async fn existing_asset(&self, release_id: u64, name: &str) -> CiResult<Option<GithubAsset>> {
        let mut page = Some(format!(
            "{}/repos/{}/releases/{}/assets?per_page=100",
            self.api_url, self.repository, release_id
        ));
        while let Some(url) = page {
            let response = self
                .request(reqwest::Method::GET, url)
                .send()
                .await?
                .error_for_status()?;
            page = next_link(response.headers());
            let assets: Vec<GithubAsset> = response.json().await?;
            if let Some(found) = assets.into_iter().find(|a| a.name == name) {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }
}

/// Target of the `rel="next"` entry of a `Link` header.
fn next_link(headers: &reqwest::header::HeaderMap) -> Option<String> {
    let link = headers.get(reqwest::header::LINK)?.to_str().ok()?;
    link.split(',').find_map(|entry| {
        let (target, params) = entry.split_once(';')?;
        params
            .split(';')
            .any(|p| p.trim() == r#"rel="next""#)
            .then(|| {
                target
                    .trim()
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string()
            })
    })
}

#[async_trait]
impl AssetPublisher for GithubReleasePublisher {
    fn name(&self) -> &str {
        "github"
    }

    async fn publish(
        &self,
        release: &ReleaseRef,
        artifacts: &ArtifactSet,
    ) -> CiResult<PublishedAsset> {
        let release_id = self.resolve_release_id(release).await?;
        let name = artifacts.asset_name();

        let replaced = match self.existing_asset(release_id, &name).await? {
            Some(asset) => {
                debug!(asset = %asset.name, id = asset.id, "deleting existing asset");
                let url = format!(
                    "{}/repos/{}/releases/assets/{}",
                    self.api_url, self.repository, asset.id
                );
                self.request(reqwest::Method::DELETE, url)
                    .send()
                    .await?
                    .error_for_status()?;
                true
            }
            None => false,
        };

        let body = tokio::fs::read(&artifacts.archive).await?;
        let url = format!(
            "{}/repos/{}/releases/{}/assets",
            self.upload_url, self.repository, release_id
        );
        let uploaded: GithubAsset = self
            .request(reqwest::Method::POST, url)
            .query(&[("name", name.as_str())])
            .header(
                reqwest::header::CONTENT_TYPE,
                artifacts.format.content_type(),
            )
            .body(body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        info!(
            asset = %uploaded.name,
            release = %release.tag,
            replaced,
            "uploaded release asset"
        );
        Ok(PublishedAsset {
            name: uploaded.name,
            location: uploaded.browser_download_url,
            replaced,
        })
    }
}

// ---------------------------------------------------------------------------
// Local directory
// ---------------------------------------------------------------------------

/// Copies archives into `<root>/<tag>/`, standing in for a release page.
pub struct DirectoryPublisher {
    root: PathBuf,
}

impl DirectoryPublisher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl AssetPublisher for DirectoryPublisher {
    fn name(&self) -> &str {
        "directory"
    }

    async fn publish(
        &self,
        release: &ReleaseRef,
        artifacts: &ArtifactSet,
    ) -> CiResult<PublishedAsset> {
        let dir = self.root.join(path_safe(&release.tag));
        tokio::fs::create_dir_all(&dir).await?;
        let name = artifacts.asset_name();
        let dest = dir.join(&name);
        let replaced = tokio::fs::try_exists(&dest).await?;
        tokio::fs::copy(&artifacts.archive, &dest).await?;
        info!(asset = %name, dest = %dest.display(), replaced, "copied release asset");
        Ok(PublishedAsset {
            name,
            location: dest.display().to_string(),
            replaced,
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory (tests)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredAsset {
    artifacts: ArtifactSet,
    bytes: Vec<u8>,
}

/// Records published artifact sets and archive contents keyed by
/// `(tag, asset name)`.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    assets: Mutex<BTreeMap<(String, String), StoredAsset>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Artifact sets attached to `tag`, ordered by asset name.
    pub fn assets_for(&self, tag: &str) -> Vec<ArtifactSet> {
        self.assets
            .lock()
            .unwrap()
            .iter()
            .filter(|((t, _), _)| t == tag)
            .map(|(_, stored)| stored.artifacts.clone())
            .collect()
    }

    /// Archive contents as they were at publish time.
    pub fn archive_bytes(&self, tag: &str, name: &str) -> Option<Vec<u8>> {
        self.assets
            .lock()
            .unwrap()
            .get(&(tag.to_string(), name.to_string()))
            .map(|stored| stored.bytes.clone())
    }
}

#[async_trait]
impl AssetPublisher for MemoryPublisher {
    fn name(&self) -> &str {
        "memory"
    }

    async fn publish(
        &self,
        release: &ReleaseRef,
        artifacts: &ArtifactSet,
    ) -> CiResult<PublishedAsset> {
        let name = artifacts.asset_name();
        let bytes = tokio::fs::read(&artifacts.archive).await?;
        let stored = StoredAsset {
            artifacts: artifacts.clone(),
            bytes,
        };
        let replaced = self
            .assets
            .lock()
            .unwrap()
            .insert((release.tag.clone(), name.clone()), stored)
            .is_some();
        Ok(PublishedAsset {
            location: format!("memory://{}/{}", release.tag, name),
            name,
            replaced,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::package::{package, PackageRequest};
    use crate::release::target::TargetTriple;

    fn artifacts(dir: &std::path::Path, triple: &str) -> ArtifactSet {
        let bin = dir.join(format!("tool-{triple}"));
        std::fs::write(&bin, "bin").unwrap();
        let target = TargetTriple::parse(triple).unwrap();
        package(&PackageRequest {
            project: "tool",
            tag: "v1",
            target: &target,
            binaries: &[bin],
            extra_files: &[],
            out_dir: &dir.join("dist"),
        })
        .unwrap()
    }

    fn release() -> ReleaseRef {
        ReleaseRef {
            tag: "v1".to_string(),
            release_id: None,
        }
    }

    #[tokio::test]
    async fn directory_publisher_replaces_same_named_asset() {
        let dir = tempfile::tempdir().unwrap();
        let set = artifacts(dir.path(), "x86_64-unknown-linux-musl");
        let publisher = DirectoryPublisher::new(dir.path().join("releases"));

        let first = publisher.publish(&release(), &set).await.unwrap();
        assert!(!first.replaced);
        let second = publisher.publish(&release(), &set).await.unwrap();
        assert!(second.replaced);
        assert!(dir
            .path()
            .join("releases/v1/tool_v1_x86_64-unknown-linux-musl.tar.gz")
            .is_file());
    }

    #[tokio::test]
    async fn memory_publisher_keeps_targets_apart() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = MemoryPublisher::new();
        publisher
            .publish(&release(), &artifacts(dir.path(), "x86_64-unknown-linux-musl"))
            .await
            .unwrap();
        publisher
            .publish(&release(), &artifacts(dir.path(), "x86_64-apple-darwin"))
            .await
            .unwrap();
        assert_eq!(publisher.assets_for("v1").len(), 2);
        assert!(publisher.assets_for("v2").is_empty());
    }

    #[tokio::test]
    async fn memory_publisher_keeps_bytes_after_archive_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let set = artifacts(dir.path(), "x86_64-unknown-linux-musl");
        let expected = std::fs::read(&set.archive).unwrap();
        let publisher = MemoryPublisher::new();
        let published = publisher.publish(&release(), &set).await.unwrap();
        std::fs::remove_file(&set.archive).unwrap();

        assert_eq!(
            published.location,
            "memory://v1/tool_v1_x86_64-unknown-linux-musl.tar.gz"
        );
        assert_eq!(
            publisher.archive_bytes("v1", &published.name),
            Some(expected)
        );
    }

    fn link_headers(value: &str) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::LINK, value.parse().unwrap());
        headers
    }

    #[test]
    fn follows_next_page_link() {
        let headers = link_headers(
            "<https://api.github.com/repositories/1/releases/9/assets?per_page=100&page=2>; rel=\"next\", \
             <https://api.github.com/repositories/1/releases/9/assets?per_page=100&page=3>; rel=\"last\"",
        );
        assert_eq!(
            next_link(&headers).as_deref(),
            Some("https://api.github.com/repositories/1/releases/9/assets?per_page=100&page=2")
        );
    }

    #[test]
    fn last_page_has_no_next_link() {
        let headers = link_headers(
            "<https://api.github.com/repositories/1/releases/9/assets?page=1>; rel=\"prev\", \
             <https://api.github.com/repositories/1/releases/9/assets?page=1>; rel=\"first\"",
        );
        assert_eq!(next_link(&headers), None);
        assert_eq!(next_link(&reqwest::header::HeaderMap::new()), None);
    }

    #[test]
    fn github_publisher_requires_owner_and_name() {
        let token = SecretToken::new("t");
        assert!(GithubReleasePublisher::new(
            "https://api.github.com",
            "https://uploads.github.com",
            "just-a-name",
            token.clone(),
        )
        .is_err());
        assert!(GithubReleasePublisher::new(
            "https://api.github.com",
            "https://uploads.github.com",
            "owner/repo",
            token,
        )
        .is_ok());
    }
}
