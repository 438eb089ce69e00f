use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Url};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::{UploadEncoding, WatcherConfig};
use crate::error::WatchError;
use crate::scan::BeaconFile;

/// Header carrying the beacon filename for raw uploads
pub const FILENAME_HEADER: &str = "X-Beacon-Filename";
/// Header carrying the capture time for raw uploads
pub const CREATED_AT_HEADER: &str = "X-Beacon-Created-At";

// Keep logged/returned error bodies short; the full body goes to the dump file
const ERROR_BODY_LIMIT: usize = 512;

/// Outcome of an accepted upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReceipt {
    pub status: u16,
}

/// Sends one beacon to the remote server.
///
/// `Ok` means the server accepted the file and it may be recorded as
/// processed. Any `Err` leaves the beacon a candidate for the next pass.
#[async_trait]
pub trait BeaconUploader: Send + Sync {
    async fn upload(&self, beacon: &BeaconFile, body: Vec<u8>) -> Result<UploadReceipt, WatchError>;
}

#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: Client,
    url: Url,
    authorization: String,
    encoding: UploadEncoding,
    error_dump_path: Option<PathBuf>,
}

impl HttpUploader {
    pub fn new(config: &WatcherConfig) -> Result<Self, WatchError> {
        let url = config
            .upload_url()
            .map_err(|e| WatchError::Config(e.to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("capsat_watcher/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WatchError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url,
            authorization: authorization_value(&config.token),
            encoding: config.encoding,
            error_dump_path: config.error_dump_path.clone(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn encoding(&self) -> UploadEncoding {
        self.encoding
    }

    fn build_request(
        &self,
        beacon: &BeaconFile,
        body: Vec<u8>,
    ) -> Result<reqwest::RequestBuilder, WatchError> {
        let created_at = beacon.captured_at().map(|ts| ts.to_rfc3339());

        let request = self
            .client
            .post(self.url.clone())
            .header(reqwest::header::AUTHORIZATION, &self.authorization);

        let request = match self.encoding {
            UploadEncoding::Multipart => {
                let file_part = Part::bytes(body)
                    .file_name(beacon.name.clone())
                    .mime_str("application/octet-stream")?;

                let mut form = Form::new()
                    .text("filename", beacon.name.clone())
                    .part("file", file_part);
                if let Some(created_at) = created_at {
                    form = form.text("created_at", created_at);
                }
                request.multipart(form)
            }
            UploadEncoding::Raw => {
                let mut request = request
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .header(FILENAME_HEADER, &beacon.name);
                if let Some(created_at) = created_at {
                    request = request.header(CREATED_AT_HEADER, created_at);
                }
                request.body(body)
            }
        };

        Ok(request)
    }

    async fn dump_error_body(&self, body: &[u8]) {
        let Some(path) = &self.error_dump_path else {
            return;
        };

        match tokio::fs::write(path, body).await {
            Ok(()) => error!("Saved server error response to {}", path.display()),
            Err(e) => warn!("Failed to save server error response to {}: {}", path.display(), e),
        }
    }
}

#[async_trait]
impl BeaconUploader for HttpUploader {
    async fn upload(&self, beacon: &BeaconFile, body: Vec<u8>) -> Result<UploadReceipt, WatchError> {
        debug!(
            "POST {} ({} bytes, {:?}) for {}",
            self.url,
            body.len(),
            self.encoding,
            beacon.name
        );

        let response = self.build_request(beacon, body)?.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(UploadReceipt {
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.unwrap_or_default();
        self.dump_error_body(&bytes).await;

        Err(WatchError::Http {
            status: status.as_u16(),
            body: truncate_body(&bytes),
        })
    }
}

/// `Authorization` header value for a token, tolerating an existing `Token ` prefix
pub fn authorization_value(token: &str) -> String {
    let token = token.trim();
    match token.strip_prefix("Token ") {
        Some(bare) => format!("Token {}", bare.trim()),
        None => format!("Token {}", token),
    }
}

fn truncate_body(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    match text.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.into_owned(),
    }
}
