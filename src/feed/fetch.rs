// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use url::Url;

use crate::error::FeedError;
use crate::http::{HttpClient, ReqwestClient};

use super::chapters::{ChapterRecord, parse_chapters};
use super::parse::{ChannelRecord, parse_feed};

/// Remote feed capability consumed by the catalog, playback and refresh layers
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Fetch and parse a feed. Accepts URLs and local file paths.
    async fn fetch_channel(&self, source: &str) -> Result<ChannelRecord, FeedError>;

    /// Fetch a chapters document; entries are in declared order
    async fn fetch_chapters(&self, url: &str) -> Result<Vec<ChapterRecord>, FeedError>;

    /// Fetch raw artwork bytes
    async fn fetch_artwork(&self, url: &str) -> Result<Bytes, FeedError>;
}

/// HTTP-backed [`FeedSource`]
#[derive(Clone)]
pub struct FeedService<C = ReqwestClient> {
    client: Arc<C>,
}

impl<C: HttpClient> FeedService<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }
}

impl Default for FeedService<ReqwestClient> {
    fn default() -> Self {
        Self::new(Arc::new(ReqwestClient::new()))
    }
}

#[async_trait]
impl<C: HttpClient + 'static> FeedSource for FeedService<C> {
    async fn fetch_channel(&self, source: &str) -> Result<ChannelRecord, FeedError> {
        if is_url(source) {
            fetch_feed(self.client.as_ref(), source).await
        } else {
            parse_feed_file(Path::new(source))
        }
    }

    async fn fetch_chapters(&self, url: &str) -> Result<Vec<ChapterRecord>, FeedError> {
        let url = upgrade_to_https(url)?;
        let bytes = fetch_bytes(self.client.as_ref(), &url).await?;
        parse_chapters(&bytes, &url)
    }

    async fn fetch_artwork(&self, url: &str) -> Result<Bytes, FeedError> {
        let url = upgrade_to_https(url)?;
        fetch_bytes(self.client.as_ref(), &url).await
    }
}

/// Rewrite `http://` URLs to `https://`; other schemes pass through
pub fn upgrade_to_https(url: &str) -> Result<String, FeedError> {
    let mut parsed = Url::parse(url)?;
    if parsed.scheme().eq_ignore_ascii_case("http") {
        // Only fails for cannot-be-a-base URLs, which http never is
        let _ = parsed.set_scheme("https");
    }
    Ok(parsed.into())
}

/// Fetch raw bytes from a URL
pub async fn fetch_bytes<C: HttpClient + ?Sized>(client: &C, url: &str) -> Result<Bytes, FeedError> {
    client
        .get_bytes(url)
        .await
        .map_err(|e| FeedError::FetchFailed {
            url: url.to_string(),
            source: e,
        })
}

/// Fetch and parse a podcast feed from a URL, upgrading it to https first
pub async fn fetch_feed<C: HttpClient + ?Sized>(
    client: &C,
    url: &str,
) -> Result<ChannelRecord, FeedError> {
    let url = upgrade_to_https(url)?;
    debug!(url = %url, "fetching feed");
    let bytes = fetch_bytes(client, &url).await?;
    parse_feed(&bytes, &url)
}

/// Parse a podcast feed from a local file
pub fn parse_feed_file(path: &Path) -> Result<ChannelRecord, FeedError> {
    let bytes = std::fs::read(path).map_err(|e| FeedError::FileReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_feed(&bytes, &path.display().to_string())
}

/// Determine if a string is a URL or a file path
pub fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ByteStream, HttpResponse};
    use std::sync::Mutex;
    use tempfile::tempdir;

    const FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Mock Show</title>
    <description>Mocked</description>
    <item>
      <title>Only Episode</title>
      <guid>only</guid>
      <enclosure url="https://example.com/only.mp3" type="audio/mpeg"/>
    </item>
  </channel>
</rss>"#;

    #[derive(Default)]
    struct MockHttpClient {
        requested: Mutex<Vec<String>>,
        body: Vec<u8>,
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn get_bytes(&self, url: &str) -> Result<Bytes, reqwest::Error> {
            self.requested.lock().unwrap().push(url.to_string());
            Ok(Bytes::from(self.body.clone()))
        }

        async fn get_stream(&self, _url: &str) -> Result<HttpResponse, reqwest::Error> {
            let stream: ByteStream = Box::pin(futures::stream::empty());
            Ok(HttpResponse {
                status: 200,
                content_length: Some(0),
                body: stream,
            })
        }
    }

    #[test]
    fn is_url_detects_http() {
        assert!(is_url("http://example.com/feed.xml"));
        assert!(is_url("https://example.com/feed.xml"));
    }

    #[test]
    fn is_url_rejects_file_paths() {
        assert!(!is_url("/path/to/feed.xml"));
        assert!(!is_url("./feed.xml"));
        assert!(!is_url("feed.xml"));
    }

    #[test]
    fn upgrade_to_https_rewrites_plain_http() {
        assert_eq!(
            upgrade_to_https("http://example.com/feed.xml?x=1").unwrap(),
            "https://example.com/feed.xml?x=1"
        );
        assert_eq!(
            upgrade_to_https("https://example.com/feed.xml").unwrap(),
            "https://example.com/feed.xml"
        );
        assert!(matches!(
            upgrade_to_https("not a url"),
            Err(FeedError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn fetch_channel_requests_https() {
        let client = Arc::new(MockHttpClient {
            body: FEED.as_bytes().to_vec(),
            ..Default::default()
        });
        let service = FeedService::new(client.clone());

        let channel = service
            .fetch_channel("http://example.com/feed.xml")
            .await
            .unwrap();

        assert_eq!(channel.title, "Mock Show");
        assert_eq!(channel.feed_url, "https://example.com/feed.xml");
        assert_eq!(
            *client.requested.lock().unwrap(),
            vec!["https://example.com/feed.xml".to_string()]
        );
    }

    #[tokio::test]
    async fn fetch_channel_reads_local_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("feed.xml");
        std::fs::write(&path, FEED).unwrap();

        let service = FeedService::new(Arc::new(MockHttpClient::default()));
        let channel = service
            .fetch_channel(path.to_str().unwrap())
            .await
            .unwrap();

        assert_eq!(channel.episodes.len(), 1);
    }

    #[tokio::test]
    async fn fetch_chapters_decodes_document() {
        let client = Arc::new(MockHttpClient {
            body: br#"{"version":"1.2","chapters":[{"startTime":5,"title":"Hello"}]}"#.to_vec(),
            ..Default::default()
        });
        let service = FeedService::new(client);

        let chapters = service
            .fetch_chapters("https://example.com/c.json")
            .await
            .unwrap();
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].start_time, 5);
    }
}
