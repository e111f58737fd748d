//! Source resolution: local files and fetched remote clips.
//!
//! Remote clips are downloaded through a yt-dlp style fetcher into a
//! read-through on-disk cache keyed by the source hash. Cache writes
//! are atomic (download into a scratch directory, then rename).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::process::Command;

use crate::error::PipelineError;
use crate::job::LogSink;

/// Container extensions recognized as downloaded clips.
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "webm", "avi"];

/// Cache directory name under the jobs root.
pub const SOURCE_CACHE_DIR: &str = "_preview_source";

/// What to capture from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceDescriptor {
    /// A video file already on disk.
    File { path: PathBuf },
    /// A clip to fetch from a remote URL.
    Remote { url: String },
}

impl SourceDescriptor {
    pub fn describe(&self) -> String {
        match self {
            SourceDescriptor::File { path } => format!("file:{}", path.display()),
            SourceDescriptor::Remote { url } => format!("remote:{url}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub video_path: PathBuf,
    pub from_cache: bool,
}

/// Seam between the pipeline and the clip fetcher, so tests can swap in
/// a double that never touches the network.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(
        &self,
        source: &SourceDescriptor,
        log: &LogSink,
    ) -> Result<ResolvedSource, PipelineError>;
}

// ---------------------------------------------------------------------------
// Default resolver
// ---------------------------------------------------------------------------

/// Resolves local files directly and remote URLs through a yt-dlp
/// compatible downloader with an on-disk cache.
pub struct ClipFetcher {
    downloader_bin: String,
    cache_root: PathBuf,
}

impl ClipFetcher {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            downloader_bin: "yt-dlp".into(),
            cache_root: cache_root.into(),
        }
    }

    pub fn with_downloader(mut self, bin: impl Into<String>) -> Self {
        self.downloader_bin = bin.into();
        self
    }

    /// Stable cache key for a source URL.
    pub fn cache_key(url: &str) -> String {
        let digest = Sha256::digest(url.trim().as_bytes());
        format!("{digest:x}")[..16].to_string()
    }

    fn cache_dir(&self, url: &str) -> PathBuf {
        self.cache_root
            .join(SOURCE_CACHE_DIR)
            .join(Self::cache_key(url))
    }

    async fn download(&self, url: &str, log: &LogSink) -> Result<PathBuf, PipelineError> {
        let cache_dir = self.cache_dir(url);
        std::fs::create_dir_all(&cache_dir)?;

        // Download into a scratch directory so a partial fetch never
        // looks like a cache hit, then rename the finished file in.
        let scratch = cache_dir.join(format!(".partial-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&scratch)?;

        log.log(format!("downloading remote clip: {url}"));
        let output = Command::new(&self.downloader_bin)
            .args(["--quiet", "--no-warnings", "-f", "bestvideo+bestaudio/best"])
            .arg("-o")
            .arg(scratch.join("clip.%(ext)s"))
            .arg(url)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    PipelineError::SourceUnavailable(format!(
                        "clip downloader not found: {}",
                        self.downloader_bin
                    ))
                } else {
                    PipelineError::Io(e)
                }
            })?;

        let downloaded = find_cached_video(&scratch);
        let result = match (output.status.success(), downloaded) {
            (true, Some(file)) => {
                let final_path = cache_dir.join(file.file_name().unwrap_or_default());
                std::fs::rename(&file, &final_path)?;
                log.log(format!("remote clip saved: {}", final_path.display()));
                Ok(final_path)
            }
            _ => Err(PipelineError::SourceUnavailable(format!(
                "failed to download clip from {url}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        };
        let _ = std::fs::remove_dir_all(&scratch);
        result
    }
}

#[async_trait]
impl SourceResolver for ClipFetcher {
    async fn resolve(
        &self,
        source: &SourceDescriptor,
        log: &LogSink,
    ) -> Result<ResolvedSource, PipelineError> {
        match source {
            SourceDescriptor::File { path } => {
                if !path.is_file() {
                    return Err(PipelineError::SourceUnavailable(format!(
                        "input video does not exist: {}",
                        path.display()
                    )));
                }
                Ok(ResolvedSource {
                    video_path: path.clone(),
                    from_cache: true,
                })
            }
            SourceDescriptor::Remote { url } => {
                if url.trim().is_empty() {
                    return Err(PipelineError::InputInvalid(
                        "source URL must not be empty".into(),
                    ));
                }
                if let Some(cached) = find_cached_video(&self.cache_dir(url)) {
                    log.log("source cache hit: remote clip reused");
                    return Ok(ResolvedSource {
                        video_path: cached,
                        from_cache: true,
                    });
                }
                let video_path = self.download(url, log).await?;
                Ok(ResolvedSource {
                    video_path,
                    from_cache: false,
                })
            }
        }
    }
}

/// First recognized video file directly inside `dir`, by name order.
pub fn find_cached_video(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut candidates: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .map(|ext| {
                        let ext = ext.to_string_lossy().to_ascii_lowercase();
                        VIDEO_EXTENSIONS.contains(&ext.as_str())
                    })
                    .unwrap_or(false)
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_log() -> LogSink {
        LogSink::silent()
    }

    #[test]
    fn cache_keys_are_stable_and_short() {
        let a = ClipFetcher::cache_key("https://example.com/watch?v=abc");
        let b = ClipFetcher::cache_key("https://example.com/watch?v=abc");
        let c = ClipFetcher::cache_key("https://example.com/watch?v=xyz");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn cached_video_lookup_ignores_non_video_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        assert_eq!(find_cached_video(dir.path()), None);

        std::fs::write(dir.path().join("b.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("a.webm"), b"x").unwrap();
        // Name order decides when several clips are present.
        assert_eq!(
            find_cached_video(dir.path()).unwrap(),
            dir.path().join("a.webm")
        );
    }

    #[tokio::test]
    async fn missing_local_file_is_source_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ClipFetcher::new(dir.path());
        let source = SourceDescriptor::File {
            path: dir.path().join("missing.mp4"),
        };
        let err = fetcher.resolve(&source, &quiet_log()).await.unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable(_)));
    }

    #[tokio::test]
    async fn local_file_resolves_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("clip.mp4");
        std::fs::write(&video, b"fake").unwrap();
        let fetcher = ClipFetcher::new(dir.path());
        let source = SourceDescriptor::File {
            path: video.clone(),
        };
        let resolved = fetcher.resolve(&source, &quiet_log()).await.unwrap();
        assert_eq!(resolved.video_path, video);
        assert!(resolved.from_cache);
    }

    #[tokio::test]
    async fn cached_remote_clip_short_circuits_download() {
        let dir = tempfile::tempdir().unwrap();
        let url = "https://example.com/watch?v=abc";
        let cache_dir = dir
            .path()
            .join(SOURCE_CACHE_DIR)
            .join(ClipFetcher::cache_key(url));
        std::fs::create_dir_all(&cache_dir).unwrap();
        std::fs::write(cache_dir.join("clip.mp4"), b"fake").unwrap();

        // Downloader binary does not exist; a cache hit must not need it.
        let fetcher = ClipFetcher::new(dir.path()).with_downloader("definitely-not-a-binary");
        let source = SourceDescriptor::Remote { url: url.into() };
        let resolved = fetcher.resolve(&source, &quiet_log()).await.unwrap();
        assert!(resolved.from_cache);
        assert_eq!(resolved.video_path, cache_dir.join("clip.mp4"));
    }

    #[tokio::test]
    async fn empty_remote_url_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ClipFetcher::new(dir.path());
        let source = SourceDescriptor::Remote { url: "  ".into() };
        let err = fetcher.resolve(&source, &quiet_log()).await.unwrap_err();
        assert!(matches!(err, PipelineError::InputInvalid(_)));
    }
}
