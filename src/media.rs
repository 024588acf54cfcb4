//! Media descriptors handed to the engine

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Where the bytes of a media item come from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamSource {
    /// HTTP(S) stream from the media server
    Url(String),
    /// File already on disk
    File(PathBuf),
}

impl StreamSource {
    pub fn is_remote(&self) -> bool {
        matches!(self, StreamSource::Url(_))
    }
}

impl fmt::Display for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamSource::Url(url) => f.write_str(url),
            StreamSource::File(path) => write!(f, "file://{}", path.display()),
        }
    }
}

/// One artwork rendition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artwork {
    pub url: String,
    /// Edge length in pixels (square covers)
    pub size: u32,
}

/// Kind-specific descriptor data
#[derive(Debug, Clone, PartialEq)]
pub enum MediaKind {
    Track {
        artist: String,
        album: String,
    },
    Audiobook {
        author: String,
        narrator: Option<String>,
    },
    PodcastEpisode {
        podcast_id: String,
        podcast_title: String,
    },
}

/// Short-form media skips between items, long-form skips within one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaCategory {
    ShortForm,
    LongForm,
}

/// Immutable description of a playable item
#[derive(Debug, Clone, PartialEq)]
pub struct MediaDescriptor {
    pub id: String,
    pub title: String,
    pub kind: MediaKind,
    /// Known duration, if the server reported one
    pub duration: Option<Duration>,
    pub source: StreamSource,
    /// Where to start playback
    pub resume_offset: Option<Duration>,
    /// Renditions in any order
    pub artwork: Vec<Artwork>,
}

impl MediaDescriptor {
    pub fn track(id: impl Into<String>, title: impl Into<String>, source: StreamSource) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            kind: MediaKind::Track {
                artist: String::new(),
                album: String::new(),
            },
            duration: None,
            source,
            resume_offset: None,
            artwork: Vec::new(),
        }
    }

    pub fn audiobook(id: impl Into<String>, title: impl Into<String>, source: StreamSource) -> Self {
        Self {
            kind: MediaKind::Audiobook {
                author: String::new(),
                narrator: None,
            },
            ..Self::track(id, title, source)
        }
    }

    pub fn podcast_episode(
        id: impl Into<String>,
        podcast_id: impl Into<String>,
        title: impl Into<String>,
        source: StreamSource,
    ) -> Self {
        Self {
            kind: MediaKind::PodcastEpisode {
                podcast_id: podcast_id.into(),
                podcast_title: String::new(),
            },
            ..Self::track(id, title, source)
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_resume_offset(mut self, offset: Duration) -> Self {
        self.resume_offset = Some(offset);
        self
    }

    pub fn with_artwork(mut self, url: impl Into<String>, size: u32) -> Self {
        self.artwork.push(Artwork {
            url: url.into(),
            size,
        });
        self
    }

    pub fn category(&self) -> MediaCategory {
        match self.kind {
            MediaKind::Track { .. } => MediaCategory::ShortForm,
            MediaKind::Audiobook { .. } | MediaKind::PodcastEpisode { .. } => {
                MediaCategory::LongForm
            }
        }
    }

    /// Seekable range is limited by what the server has cached
    pub fn is_cache_gated(&self) -> bool {
        matches!(self.kind, MediaKind::PodcastEpisode { .. })
    }

    pub fn is_track(&self) -> bool {
        matches!(self.kind, MediaKind::Track { .. })
    }

    /// Artist line for now-playing displays
    pub fn subtitle(&self) -> &str {
        match &self.kind {
            MediaKind::Track { artist, .. } => artist,
            MediaKind::Audiobook { author, .. } => author,
            MediaKind::PodcastEpisode { podcast_title, .. } => podcast_title,
        }
    }

    /// Album line for now-playing displays
    pub fn collection(&self) -> Option<&str> {
        match &self.kind {
            MediaKind::Track { album, .. } if !album.is_empty() => Some(album),
            MediaKind::PodcastEpisode { podcast_title, .. } if !podcast_title.is_empty() => {
                Some(podcast_title)
            }
            _ => None,
        }
    }

    /// Largest artwork rendition, for surfaces that accept one URL
    pub fn largest_artwork(&self) -> Option<&Artwork> {
        self.artwork.iter().max_by_key(|art| art.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        let src = StreamSource::Url("http://h/s".into());
        assert_eq!(
            MediaDescriptor::track("t", "T", src.clone()).category(),
            MediaCategory::ShortForm
        );
        let episode = MediaDescriptor::podcast_episode("e", "p", "E", src.clone());
        assert_eq!(episode.category(), MediaCategory::LongForm);
        assert!(episode.is_cache_gated());
        assert!(!MediaDescriptor::audiobook("b", "B", src).is_cache_gated());
    }

    #[test]
    fn picks_largest_artwork() {
        let item = MediaDescriptor::track("t", "T", StreamSource::File("/a.flac".into()))
            .with_artwork("small", 96)
            .with_artwork("large", 512)
            .with_artwork("medium", 256);
        assert_eq!(item.largest_artwork().map(|a| a.url.as_str()), Some("large"));
    }
}
