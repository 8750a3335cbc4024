use std::path::Path;

use reqwest::{
    Client, Response, StatusCode,
    multipart::{Form, Part},
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    config::ClientConfig,
    error::{Result, StreamError},
};

pub const CLAIM_STREAM_PATH: &str = "process-claim-stream/";
pub const FILE_STREAM_PATH: &str = "process-claim-file-stream/";
pub const CHAT_STREAM_PATH: &str = "chat-stream/";

/// MIME types the file endpoint accepts
pub const ACCEPTED_FILE_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/bmp",
    "application/pdf",
];

#[derive(Debug, Serialize)]
struct ClaimRequest<'a> {
    claim_description: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    claim_data: &'a str,
    question: &'a str,
}

/// HTTP access to the three streaming endpoints.
///
/// Every method returns the response once headers arrive and the status is
/// a readable 2xx. The body is left unread for the caller to stream.
#[derive(Debug, Clone)]
pub struct ClaimsClient {
    http: Client,
    config: ClientConfig,
}

impl ClaimsClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        Ok(Self {
            http: builder.build()?,
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start the claim pipeline for free-text claim input
    pub async fn process_claim(&self, claim_description: &str) -> Result<Response> {
        let url = self.config.endpoint(CLAIM_STREAM_PATH)?;
        debug!(url = %url, length = claim_description.len(), "Posting claim text");
        let response = self
            .http
            .post(url)
            .json(&ClaimRequest { claim_description })
            .send()
            .await?;
        check_response(response).await
    }

    /// Start the claim pipeline for a scanned document or PDF
    pub async fn process_file(&self, path: &Path) -> Result<Response> {
        let form = file_form(path).await?;
        let url = self.config.endpoint(FILE_STREAM_PATH)?;
        debug!(url = %url, path = %path.display(), "Posting claim file");
        let response = self.http.post(url).multipart(form).send().await?;
        check_response(response).await
    }

    /// Ask a follow-up question about a finished claim
    pub async fn chat(&self, claim_data: &str, question: &str) -> Result<Response> {
        let url = self.config.endpoint(CHAT_STREAM_PATH)?;
        debug!(url = %url, "Posting chat question");
        let response = self
            .http
            .post(url)
            .json(&ChatRequest {
                claim_data,
                question,
            })
            .send()
            .await?;
        check_response(response).await
    }
}

/// MIME type for `path`, if the backend accepts it
pub fn accepted_mime(path: &Path) -> Result<&'static str> {
    let guess = mime_guess::from_path(path).first_or_octet_stream();
    ACCEPTED_FILE_TYPES
        .iter()
        .copied()
        .find(|accepted| *accepted == guess.essence_str())
        .ok_or_else(|| StreamError::UnsupportedFile {
            path: path.to_path_buf(),
            mime: guess.essence_str().to_string(),
        })
}

async fn file_form(path: &Path) -> Result<Form> {
    let mime = accepted_mime(path)?;
    let bytes = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());

    let part = Part::bytes(bytes).file_name(file_name).mime_str(mime)?;
    Ok(Form::new().part("file", part))
}

async fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), body = %body, "Backend rejected request");
        return Err(StreamError::Http {
            status: status.as_u16(),
            body,
        });
    }
    if status == StatusCode::NO_CONTENT || status == StatusCode::RESET_CONTENT {
        return Err(StreamError::UnreadableBody {
            status: status.as_u16(),
        });
    }
    Ok(response)
}
