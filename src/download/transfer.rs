// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::error::DownloadError;
use crate::http::{HttpClient, ReqwestClient};
use crate::progress::{ProgressEvent, SharedProgressReporter};

/// Session-scoped identifier of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Everything a backend needs to carry out one transfer
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub task: TaskId,
    pub url: Url,
    /// Where the backend should put the bytes while transferring
    pub staging_path: PathBuf,
    /// Human readable name for progress output
    pub label: String,
}

/// Outcome of a transfer, delivered some time after [`TransferBackend::begin`]
#[derive(Debug)]
pub enum TransferEvent {
    /// The complete payload sits at `location`
    Completed { task: TaskId, location: PathBuf },
    /// The transfer gave up; nothing usable was produced
    Failed { task: TaskId, error: String },
}

impl TransferEvent {
    pub fn task(&self) -> TaskId {
        match self {
            Self::Completed { task, .. } | Self::Failed { task, .. } => *task,
        }
    }
}

/// Background transfer mechanism
///
/// `begin` only starts the work and returns immediately; the outcome arrives
/// later as a [`TransferEvent`] on the channel the backend was built with.
pub trait TransferBackend: Send + Sync {
    fn begin(&self, request: TransferRequest);
}

/// Transfer backend streaming over HTTP on the tokio runtime
pub struct HttpTransfer<C = ReqwestClient> {
    client: Arc<C>,
    events: mpsc::UnboundedSender<TransferEvent>,
    reporter: SharedProgressReporter,
}

impl<C: HttpClient + 'static> HttpTransfer<C> {
    /// Create the backend together with the receiving end of its event channel
    pub fn new(
        client: Arc<C>,
        reporter: SharedProgressReporter,
    ) -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                client,
                events,
                reporter,
            },
            rx,
        )
    }
}

impl<C: HttpClient + 'static> TransferBackend for HttpTransfer<C> {
    fn begin(&self, request: TransferRequest) {
        let client = self.client.clone();
        let events = self.events.clone();
        let reporter = self.reporter.clone();
        let task = request.task;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // Receiver may be gone as well; nothing else to tell
            let _ = events.send(TransferEvent::Failed {
                task,
                error: "no async runtime available".to_string(),
            });
            return;
        };

        runtime.spawn(async move {
            let event = match transfer_to_file(client.as_ref(), &request, &reporter).await {
                Ok(_) => TransferEvent::Completed {
                    task,
                    location: request.staging_path,
                },
                Err(e) => {
                    reporter.report(ProgressEvent::TransferFailed {
                        task,
                        label: request.label.clone(),
                        error: e.to_string(),
                    });
                    let _ = tokio::fs::remove_file(&request.staging_path).await;
                    TransferEvent::Failed {
                        task,
                        error: e.to_string(),
                    }
                }
            };
            if events.send(event).is_err() {
                debug!(task = %task, "transfer finished after coordinator shut down");
            }
        });
    }
}

/// Stream a request's body into its staging file
///
/// Returns the number of bytes written.
pub async fn transfer_to_file<C: HttpClient + ?Sized>(
    client: &C,
    request: &TransferRequest,
    reporter: &SharedProgressReporter,
) -> Result<u64, DownloadError> {
    let url = request.url.as_str();

    let response = client
        .get_stream(url)
        .await
        .map_err(|e| DownloadError::HttpFailed {
            url: url.to_string(),
            source: e,
        })?;

    if response.status >= 400 {
        return Err(DownloadError::HttpStatus {
            url: url.to_string(),
            status: response.status,
        });
    }

    reporter.report(ProgressEvent::TransferStarting {
        task: request.task,
        label: request.label.clone(),
        content_length: response.content_length,
    });

    let output_path: &Path = &request.staging_path;
    let mut file = File::create(output_path)
        .await
        .map_err(|e| DownloadError::FileCreateFailed {
            path: output_path.to_path_buf(),
            source: e,
        })?;

    let mut bytes_downloaded: u64 = 0;
    let mut stream = response.body;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| DownloadError::StreamFailed {
            url: url.to_string(),
            source: e,
        })?;

        file.write_all(&chunk)
            .await
            .map_err(|e| DownloadError::FileWriteFailed {
                path: output_path.to_path_buf(),
                source: e,
            })?;

        bytes_downloaded += chunk.len() as u64;

        reporter.report(ProgressEvent::TransferProgress {
            task: request.task,
            label: request.label.clone(),
            bytes_downloaded,
            total_bytes: response.content_length,
        });
    }

    // Data must be on disk before the coordinator moves the file into place
    file.sync_all()
        .await
        .map_err(|e| DownloadError::FileWriteFailed {
            path: output_path.to_path_buf(),
            source: e,
        })?;

    reporter.report(ProgressEvent::TransferCompleted {
        task: request.task,
        label: request.label.clone(),
        bytes_downloaded,
    });

    Ok(bytes_downloaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ByteStream, HttpResponse};
    use crate::progress::NoopReporter;
    use async_trait::async_trait;
    use bytes::Bytes;
    use tempfile::tempdir;

    struct MockHttpClient {
        response_data: Vec<u8>,
        status: u16,
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn get_bytes(&self, _url: &str) -> Result<Bytes, reqwest::Error> {
            Ok(Bytes::from(self.response_data.clone()))
        }

        async fn get_stream(&self, _url: &str) -> Result<HttpResponse, reqwest::Error> {
            let data = self.response_data.clone();
            let len = data.len() as u64;

            let stream: ByteStream =
                Box::pin(futures::stream::once(async move { Ok(Bytes::from(data)) }));

            Ok(HttpResponse {
                status: self.status,
                content_length: Some(len),
                body: stream,
            })
        }
    }

    fn make_request(staging_path: PathBuf) -> TransferRequest {
        TransferRequest {
            task: TaskId(7),
            url: Url::parse("https://example.com/episode.mp3").unwrap(),
            staging_path,
            label: "Test Episode".to_string(),
        }
    }

    #[tokio::test]
    async fn transfer_writes_staging_file() {
        let dir = tempdir().unwrap();
        let request = make_request(dir.path().join("7.partial"));

        let client = MockHttpClient {
            response_data: b"test audio content".to_vec(),
            status: 200,
        };

        let bytes = transfer_to_file(&client, &request, &NoopReporter::shared())
            .await
            .unwrap();

        assert_eq!(bytes, 18);
        let content = std::fs::read(&request.staging_path).unwrap();
        assert_eq!(content, b"test audio content");
    }

    #[tokio::test]
    async fn transfer_fails_on_http_error() {
        let dir = tempdir().unwrap();
        let request = make_request(dir.path().join("7.partial"));

        let client = MockHttpClient {
            response_data: b"Not Found".to_vec(),
            status: 404,
        };

        let result = transfer_to_file(&client, &request, &NoopReporter::shared()).await;

        match result.unwrap_err() {
            DownloadError::HttpStatus { status, .. } => assert_eq!(status, 404),
            other => panic!("Expected HttpStatus error, got {other:?}"),
        }
        assert!(!request.staging_path.exists());
    }

    #[tokio::test]
    async fn http_transfer_reports_completion_on_channel() {
        let dir = tempdir().unwrap();
        let client = Arc::new(MockHttpClient {
            response_data: b"abc".to_vec(),
            status: 200,
        });
        let (transfer, mut events) = HttpTransfer::new(client, NoopReporter::shared());

        let staging_path = dir.path().join("7.partial");
        transfer.begin(make_request(staging_path.clone()));

        match events.recv().await.unwrap() {
            TransferEvent::Completed { task, location } => {
                assert_eq!(task, TaskId(7));
                assert_eq!(location, staging_path);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_transfer_reports_failure_and_cleans_up() {
        let dir = tempdir().unwrap();
        let client = Arc::new(MockHttpClient {
            response_data: Vec::new(),
            status: 500,
        });
        let (transfer, mut events) = HttpTransfer::new(client, NoopReporter::shared());

        let staging_path = dir.path().join("7.partial");
        transfer.begin(make_request(staging_path.clone()));

        let event = events.recv().await.unwrap();
        assert!(matches!(event, TransferEvent::Failed { task: TaskId(7), .. }));
        assert!(!staging_path.exists());
    }
}
