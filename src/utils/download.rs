//! Snapshot download from the Hugging Face Hub.

use std::path::{Component, Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::config::AccessToken;

/// Suffix for files still being written
const PARTIAL_SUFFIX: &str = ".incomplete";

/// Repository listing returned by `/api/models/{id}/revision/{rev}`
#[derive(Debug, Clone, Deserialize)]
pub struct RepoInfo {
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub siblings: Vec<Sibling>,
}

/// One file of a repository
#[derive(Debug, Clone, Deserialize)]
pub struct Sibling {
    pub rfilename: String,
    /// Only present when the listing is requested with `blobs=true`
    #[serde(default)]
    pub size: Option<u64>,
}

/// Result of a snapshot download
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub local_dir: PathBuf,
    /// Commit the files were resolved against, when the hub reports it
    pub commit: Option<String>,
    pub fetched: Vec<String>,
    pub skipped: Vec<String>,
}

/// Downloads every file of a model repository into a local directory.
pub struct SnapshotDownloader {
    client: reqwest::Client,
    endpoint: String,
    token: AccessToken,
}

impl SnapshotDownloader {
    pub fn new(endpoint: impl Into<String>, token: AccessToken) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("model-fetch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Download `model_id` at `revision` into `local_dir`.
    ///
    /// Files already present with the listed size are not requested again.
    pub async fn download(
        &self,
        model_id: &str,
        revision: &str,
        local_dir: impl AsRef<Path>,
    ) -> crate::Result<Snapshot> {
        let local_dir = local_dir.as_ref();
        tokio::fs::create_dir_all(local_dir).await?;

        let info = self.repo_info(model_id, revision).await?;
        if info.siblings.is_empty() {
            return Err(crate::FetchError::DownloadError(format!(
                "Repository {} has no files at revision {}",
                model_id, revision
            )));
        }

        // Pin to the listed commit so every file comes from the same snapshot
        let resolve_rev = info.sha.clone().unwrap_or_else(|| revision.to_string());

        tracing::info!(
            "Downloading {} ({} files) to {:?}",
            model_id,
            info.siblings.len(),
            local_dir
        );

        let mut fetched = Vec::new();
        let mut skipped = Vec::new();

        let pb = ProgressBar::new(info.siblings.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );

        for sibling in &info.siblings {
            let Some(dest) = local_path(local_dir, &sibling.rfilename) else {
                tracing::warn!("Skipping file with unsafe path: {}", sibling.rfilename);
                continue;
            };

            pb.set_message(sibling.rfilename.clone());

            if is_present(&dest, sibling.size) {
                tracing::debug!("File {} already exists, skipping", sibling.rfilename);
                skipped.push(sibling.rfilename.clone());
            } else {
                self.download_file(model_id, &resolve_rev, &sibling.rfilename, &dest)
                    .await?;
                fetched.push(sibling.rfilename.clone());
            }
            pb.inc(1);
        }

        pb.finish_with_message("Download complete");
        tracing::info!(
            "Snapshot ready: {} fetched, {} already present",
            fetched.len(),
            skipped.len()
        );

        Ok(Snapshot {
            local_dir: local_dir.to_path_buf(),
            commit: info.sha,
            fetched,
            skipped,
        })
    }

    /// List the files of a repository revision
    pub async fn repo_info(&self, model_id: &str, revision: &str) -> crate::Result<RepoInfo> {
        let url = repo_info_url(&self.endpoint, model_id, revision)?;

        let response = self
            .client
            .get(url)
            .bearer_auth(self.token.expose())
            .send()
            .await
            .map_err(|e| {
                crate::FetchError::DownloadError(format!("Failed to fetch model info: {}", e))
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(crate::FetchError::DownloadError(format!(
                "Access to {} denied (HTTP {}). Check the token and that the model's license has been accepted.",
                model_id, status
            )));
        }
        if !status.is_success() {
            return Err(crate::FetchError::DownloadError(format!(
                "Failed to fetch model info: HTTP {}",
                status
            )));
        }

        response.json::<RepoInfo>().await.map_err(|e| {
            crate::FetchError::DownloadError(format!("Failed to parse model info: {}", e))
        })
    }

    async fn download_file(
        &self,
        model_id: &str,
        revision: &str,
        filename: &str,
        dest: &Path,
    ) -> crate::Result<()> {
        let url = resolve_url(&self.endpoint, model_id, revision, filename)?;

        let mut response = self
            .client
            .get(url)
            .bearer_auth(self.token.expose())
            .send()
            .await
            .map_err(|e| {
                crate::FetchError::DownloadError(format!("Failed to download {}: {}", filename, e))
            })?;

        if !response.status().is_success() {
            return Err(crate::FetchError::DownloadError(format!(
                "Failed to download {}: HTTP {}",
                filename,
                response.status()
            )));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let total_size = response.content_length().unwrap_or(0);
        let pb = ProgressBar::new(total_size);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let partial = partial_path(dest);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut written: u64 = 0;

        while let Some(chunk) = response.chunk().await.map_err(|e| {
            crate::FetchError::DownloadError(format!("Download error for {}: {}", filename, e))
        })? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            pb.inc(chunk.len() as u64);
        }

        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, dest).await?;
        pb.finish_and_clear();

        tracing::info!("Downloaded {} ({} bytes)", filename, written);
        Ok(())
    }
}

fn repo_info_url(endpoint: &str, model_id: &str, revision: &str) -> crate::Result<reqwest::Url> {
    let mut segments = vec!["api", "models"];
    segments.extend(model_id.split('/'));
    segments.extend(["revision", revision]);

    let mut url = hub_url(endpoint, &segments)?;
    url.set_query(Some("blobs=true"));
    Ok(url)
}

fn resolve_url(
    endpoint: &str,
    model_id: &str,
    revision: &str,
    filename: &str,
) -> crate::Result<reqwest::Url> {
    let mut segments: Vec<&str> = model_id.split('/').collect();
    segments.extend(["resolve", revision]);
    segments.extend(filename.split('/'));
    hub_url(endpoint, &segments)
}

/// The endpoint with `segments` appended, each percent-encoded
fn hub_url(endpoint: &str, segments: &[&str]) -> crate::Result<reqwest::Url> {
    let invalid = || crate::FetchError::ConfigError(format!("Invalid hub endpoint: {}", endpoint));

    let mut url = reqwest::Url::parse(endpoint).map_err(|_| invalid())?;
    url.path_segments_mut()
        .map_err(|_| invalid())?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Destination for a repository path. `None` if it would escape `local_dir`.
fn local_path(local_dir: &Path, rfilename: &str) -> Option<PathBuf> {
    let relative = Path::new(rfilename);
    let safe = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));

    (safe && !rfilename.is_empty()).then(|| local_dir.join(relative))
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// A file counts as present when it exists with the expected size, or with
/// any size when the listing has none.
fn is_present(path: &Path, expected_size: Option<u64>) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => expected_size.map_or(true, |size| meta.len() == size),
        _ => false,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        assert_eq!(
            repo_info_url("https://huggingface.co", "meta-llama/Llama-3.2-3B-Instruct", "main")
                .unwrap()
                .as_str(),
            "https://huggingface.co/api/models/meta-llama/Llama-3.2-3B-Instruct/revision/main?blobs=true"
        );
        assert_eq!(
            resolve_url("https://huggingface.co", "org/model", "abc123", "original/params.json")
                .unwrap()
                .as_str(),
            "https://huggingface.co/org/model/resolve/abc123/original/params.json"
        );
    }

    #[test]
    fn test_urls_encode_revision() {
        assert_eq!(
            repo_info_url("https://huggingface.co", "org/model", "refs/pr/1")
                .unwrap()
                .as_str(),
            "https://huggingface.co/api/models/org/model/revision/refs%2Fpr%2F1?blobs=true"
        );
        assert_eq!(
            resolve_url("https://hub.local/mirror", "org/model", "refs/pr/1", "a b.json")
                .unwrap()
                .as_str(),
            "https://hub.local/mirror/org/model/resolve/refs%2Fpr%2F1/a%20b.json"
        );
        assert!(repo_info_url("not a url", "org/model", "main").is_err());
    }

    #[test]
    fn test_local_path_rejects_escapes() {
        let root = Path::new("/tmp/models/org/model");

        assert_eq!(
            local_path(root, "original/params.json"),
            Some(root.join("original/params.json"))
        );
        assert_eq!(local_path(root, "../outside.txt"), None);
        assert_eq!(local_path(root, "/etc/passwd"), None);
        assert_eq!(local_path(root, ""), None);
    }

    #[test]
    fn test_is_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        assert!(!is_present(&path, None));

        std::fs::write(&path, b"{}").unwrap();
        assert!(is_present(&path, None));
        assert!(is_present(&path, Some(2)));
        assert!(!is_present(&path, Some(3)));
        assert!(!is_present(dir.path(), None));
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/m/model.safetensors")),
            PathBuf::from("/m/model.safetensors.incomplete")
        );
    }

    #[test]
    fn test_parse_repo_info() {
        let json = r#"{
            "id": "meta-llama/Llama-3.2-3B-Instruct",
            "sha": "0cb88a4f764b7a12671c53f0838cd831a0843b95",
            "siblings": [
                {"rfilename": "config.json", "size": 878},
                {"rfilename": "model-00001-of-00002.safetensors", "size": 4965799096},
                {"rfilename": "README.md"}
            ]
        }"#;
        let info: RepoInfo = serde_json::from_str(json).unwrap();

        assert_eq!(info.siblings.len(), 3);
        assert_eq!(info.siblings[1].size, Some(4965799096));
        assert_eq!(info.siblings[2].size, None);
        assert!(info.sha.is_some());
    }

    #[test]
    fn test_downloader_creation() {
        assert!(SnapshotDownloader::new("https://huggingface.co/", test_token()).is_ok());
    }

    fn test_token() -> AccessToken {
        AccessToken::new(Some("hf_test".to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_download_snapshot_then_skip() {
        let files = [
            ("config.json", br#"{"hidden_size": 4}"#.to_vec()),
            ("sub/w.bin", vec![7u8; 300]),
        ];
        let routes = test_support::repo_routes("org/m", "main", "abc", &files);
        let (endpoint, log) = test_support::serve(routes);
        let dir = tempfile::tempdir().unwrap();
        let downloader = SnapshotDownloader::new(endpoint, test_token()).unwrap();

        let first = downloader.download("org/m", "main", dir.path()).await.unwrap();
        assert_eq!(first.fetched, vec!["config.json", "sub/w.bin"]);
        assert!(first.skipped.is_empty());
        assert_eq!(first.commit.as_deref(), Some("abc"));
        assert_eq!(std::fs::read(dir.path().join("sub/w.bin")).unwrap(), vec![7u8; 300]);
        assert!(!partial_path(&dir.path().join("sub/w.bin")).exists());
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "/api/models/org/m/revision/main?blobs=true",
                "/org/m/resolve/abc/config.json",
                "/org/m/resolve/abc/sub/w.bin",
            ]
        );

        log.lock().unwrap().clear();
        let second = downloader.download("org/m", "main", dir.path()).await.unwrap();
        assert!(second.fetched.is_empty());
        assert_eq!(second.skipped, vec!["config.json", "sub/w.bin"]);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["/api/models/org/m/revision/main?blobs=true"]
        );
    }

    #[tokio::test]
    async fn test_download_replaces_truncated_file() {
        let files = [("model.safetensors", vec![1u8; 64])];
        let routes = test_support::repo_routes("org/m", "main", "abc", &files);
        let (endpoint, _log) = test_support::serve(routes);
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.safetensors"), [1u8; 10]).unwrap();

        let downloader = SnapshotDownloader::new(endpoint, test_token()).unwrap();
        let snapshot = downloader.download("org/m", "main", dir.path()).await.unwrap();

        assert_eq!(snapshot.fetched, vec!["model.safetensors"]);
        assert_eq!(std::fs::metadata(dir.path().join("model.safetensors")).unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_download_unknown_repo_fails() {
        let (endpoint, _log) = test_support::serve(Default::default());
        let dir = tempfile::tempdir().unwrap();

        let downloader = SnapshotDownloader::new(endpoint, test_token()).unwrap();
        let err = downloader.download("org/missing", "main", dir.path()).await.unwrap_err();
        assert!(matches!(err, crate::FetchError::DownloadError(_)));
    }
}
