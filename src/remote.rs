//! Server-side collaborators: stream URLs, episode cache status, prefetch

use async_trait::async_trait;
use serde::Deserialize;

use crate::engine::preload::{Prefetch, Prefetcher};
use crate::engine::streaming::spawn_download;
use crate::error::{PlaybackError, Result};
use crate::media::{MediaKind, StreamSource};
use crate::settings::ServerSettings;

/// Builds stable stream URLs for each media kind
#[derive(Debug, Clone)]
pub struct StreamLocator {
    base_url: String,
}

impl StreamLocator {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn track(&self, id: &str) -> StreamSource {
        StreamSource::Url(format!("{}/api/library/tracks/{}/stream", self.base_url, id))
    }

    pub fn audiobook(&self, id: &str) -> StreamSource {
        StreamSource::Url(format!("{}/api/audiobooks/{}/stream", self.base_url, id))
    }

    pub fn podcast_episode(&self, podcast_id: &str, episode_id: &str) -> StreamSource {
        StreamSource::Url(format!(
            "{}/api/podcasts/{}/episodes/{}/stream",
            self.base_url, podcast_id, episode_id
        ))
    }

    /// Stream URL for an item of `kind`
    pub fn locate(&self, id: &str, kind: &MediaKind) -> StreamSource {
        match kind {
            MediaKind::Track { .. } => self.track(id),
            MediaKind::Audiobook { .. } => self.audiobook(id),
            MediaKind::PodcastEpisode { podcast_id, .. } => self.podcast_episode(podcast_id, id),
        }
    }

    pub fn cache_status_url(&self, episode_id: &str) -> String {
        format!(
            "{}/api/podcasts/episodes/{}/cache-status",
            self.base_url, episode_id
        )
    }
}

/// Server-side cache state of a podcast episode
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub cached: bool,
    #[serde(default)]
    pub downloading: bool,
    #[serde(default)]
    pub download_progress: Option<f64>,
}

/// Source of episode cache status
#[async_trait]
pub trait CacheStatusSource: Send + Sync {
    async fn status(&self, episode_id: &str) -> Result<CacheStatus>;
}

/// Cache status over HTTP
#[derive(Debug, Clone)]
pub struct HttpCacheStatus {
    client: reqwest::Client,
    locator: StreamLocator,
}

impl HttpCacheStatus {
    pub fn new(client: reqwest::Client, locator: StreamLocator) -> Self {
        Self { client, locator }
    }
}

#[async_trait]
impl CacheStatusSource for HttpCacheStatus {
    async fn status(&self, episode_id: &str) -> Result<CacheStatus> {
        let url = self.locator.cache_status_url(episode_id);
        tracing::debug!("Querying cache status: {}", url);
        let status = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<CacheStatus>()
            .await?;
        tracing::debug!("Episode {} cache status: {:?}", episode_id, status);
        Ok(status)
    }
}

/// Warms remote sources by downloading them into a shared buffer
#[derive(Debug, Clone)]
pub struct HttpPrefetcher {
    client: reqwest::Client,
}

impl HttpPrefetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Prefetcher for HttpPrefetcher {
    fn prefetch(&self, source: &StreamSource) -> Option<Prefetch> {
        match source {
            StreamSource::Url(url) => {
                let (buffer, task) = spawn_download(self.client.clone(), url.clone());
                Some(Prefetch {
                    buffer,
                    task: Some(task),
                })
            }
            // local files need no warming
            StreamSource::File(_) => None,
        }
    }
}

/// Shared HTTP client for streaming and status queries
///
/// No overall timeout is set since stream downloads run for the length of
/// the item; `request_timeout` bounds connection setup instead.
pub fn build_client(settings: &ServerSettings) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(settings.request_timeout)
        .read_timeout(settings.request_timeout)
        .build()
        .map_err(PlaybackError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_builds_urls_per_kind() {
        let locator = StreamLocator::new("http://host:4533/");
        assert_eq!(
            locator.track("t1"),
            StreamSource::Url("http://host:4533/api/library/tracks/t1/stream".into())
        );
        assert_eq!(
            locator.locate("e1", &MediaKind::PodcastEpisode {
                podcast_id: "p9".into(),
                podcast_title: String::new(),
            }),
            StreamSource::Url("http://host:4533/api/podcasts/p9/episodes/e1/stream".into())
        );
        assert_eq!(
            locator.cache_status_url("e1"),
            "http://host:4533/api/podcasts/episodes/e1/cache-status"
        );
    }

    #[test]
    fn cache_status_parses_camel_case() {
        let status: CacheStatus =
            serde_json::from_str(r#"{"cached":false,"downloading":true,"downloadProgress":0.4}"#)
                .unwrap();
        assert!(!status.cached);
        assert!(status.downloading);
        assert_eq!(status.download_progress, Some(0.4));

        let status: CacheStatus =
            serde_json::from_str(r#"{"cached":true,"downloadProgress":null}"#).unwrap();
        assert!(status.cached);
        assert_eq!(status.download_progress, None);
    }

    #[test]
    fn local_files_are_not_prefetched() {
        let prefetcher = HttpPrefetcher::new(reqwest::Client::new());
        assert!(
            prefetcher
                .prefetch(&StreamSource::File("/tmp/a.mp3".into()))
                .is_none()
        );
    }
}
