use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ProviderError;

/// Responses under this size cannot be real image data; the generation
/// endpoint produced them without rendering anything.
const MIN_IMAGE_BYTES: usize = 100;

/// Text bodies the generation endpoint answers with HTTP 200 when the AI
/// extension is disabled or the asset is still rendering.
const PLACEHOLDER_MARKERS: [&str; 3] = ["being prepared", "not available", "not enabled"];

const GENERATION_TIMEOUT: Duration = Duration::from_secs(60);

const DEFAULT_UPLOAD_URL: &str = "https://upload.imagekit.io/api/v1/files/upload";

/// A generated asset persisted to storage, addressed by its public URL.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub url: String,
}

/// Generation/storage seam of the image pipeline. Stubbed in tests.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Renders the prompt into binary image data. The payload has already
    /// been validated: placeholder bodies and implausibly small responses
    /// come back as classified errors, never as bytes.
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>, ProviderError>;

    /// Persists the binary under a per-run unique name and returns its URL.
    async fn upload(&self, payload: &[u8]) -> Result<StoredImage, ProviderError>;
}

/// ImageKit adapter: generation happens through an URL-addressed transform
/// (`ik-genimg`), storage through the upload API with the private key as
/// basic-auth username.
pub struct ImageKitClient {
    http: reqwest::Client,
    url_endpoint: String,
    private_key: String,
    upload_url: String,
    folder: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    url: String,
}

impl ImageKitClient {
    pub fn new(url_endpoint: String, private_key: String, folder: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url_endpoint,
            private_key,
            upload_url: DEFAULT_UPLOAD_URL.to_string(),
            folder,
        }
    }

    #[cfg(test)]
    fn generation_url(&self, prompt: &str, file_name: &str) -> String {
        build_generation_url(&self.url_endpoint, &self.folder, prompt, file_name)
    }
}

#[async_trait]
impl ImageProvider for ImageKitClient {
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>, ProviderError> {
        let file_name = format!("{}.png", Uuid::new_v4());
        let url = build_generation_url(&self.url_endpoint, &self.folder, prompt, &file_name);

        debug!("Fetching generated image ({} char prompt)", prompt.len());

        let resp = self
            .http
            .get(&url)
            .timeout(GENERATION_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ProviderError::Throttled(format!(
                "generation endpoint answered {}",
                status
            )));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if body.contains("quota") || body.contains("limit") {
                return Err(ProviderError::Throttled(body));
            }
            return Err(ProviderError::Transport(format!(
                "generation endpoint answered {}: {}",
                status, body
            )));
        }

        let payload = resp
            .bytes()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?
            .to_vec();

        debug!("Generation endpoint answered {} ({} bytes)", status, payload.len());

        validate_image_payload(&payload)?;
        Ok(payload)
    }

    async fn upload(&self, payload: &[u8]) -> Result<StoredImage, ProviderError> {
        let file_name = format!("{}.png", Uuid::new_v4());
        let encoded = B64.encode(payload);

        debug!("Uploading {} bytes to asset storage as {}", payload.len(), file_name);

        let resp = self
            .http
            .post(&self.upload_url)
            .basic_auth(&self.private_key, Some(""))
            .form(&[
                ("file", encoded.as_str()),
                ("fileName", file_name.as_str()),
                ("folder", self.folder.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if body.contains("quota") || body.contains("limit") {
                return Err(ProviderError::StorageQuota(body));
            }
            return Err(ProviderError::Transport(format!(
                "upload endpoint answered {}: {}",
                status, body
            )));
        }

        let body: UploadResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        info!("Stored generated image at {}", body.url);
        Ok(StoredImage { url: body.url })
    }
}

/// Stand-in used when the storage credentials are absent, so the routes
/// still mount and answer with a classified error instead of panicking.
pub struct UnconfiguredImages;

#[async_trait]
impl ImageProvider for UnconfiguredImages {
    async fn generate(&self, _prompt: &str) -> Result<Vec<u8>, ProviderError> {
        Err(ProviderError::Misconfigured(
            "image provider credentials are not set".into(),
        ))
    }

    async fn upload(&self, _payload: &[u8]) -> Result<StoredImage, ProviderError> {
        Err(ProviderError::Misconfigured(
            "image provider credentials are not set".into(),
        ))
    }
}

fn build_generation_url(endpoint: &str, folder: &str, prompt: &str, file_name: &str) -> String {
    format!(
        "{}/ik-genimg-prompt-{}/{}/{}?tr=w-800,h-800",
        endpoint.trim_end_matches('/'),
        encode_component(prompt),
        folder,
        file_name
    )
}

/// Percent-encodes the prompt for use as a path segment of the generation
/// URL. Unreserved characters per RFC 3986 pass through; everything else,
/// multi-byte sequences included, is escaped byte-wise.
fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{:02X}", byte));
            }
        }
    }
    out
}

/// The sentinel check runs first: placeholder bodies are shorter than
/// MIN_IMAGE_BYTES, and "not ready" is the more actionable classification.
fn validate_image_payload(payload: &[u8]) -> Result<(), ProviderError> {
    let head = String::from_utf8_lossy(&payload[..payload.len().min(256)]);
    let head = head.trim();
    for marker in PLACEHOLDER_MARKERS {
        if head.contains(marker) {
            return Err(ProviderError::NotReady(head.to_string()));
        }
    }

    if payload.len() < MIN_IMAGE_BYTES {
        return Err(ProviderError::Misconfigured(format!(
            "generation endpoint returned {} bytes, not an image",
            payload.len()
        )));
    }

    Ok(())
}
