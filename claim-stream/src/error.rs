use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the claim and chat pipelines
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Response body is not readable (HTTP {status})")]
    UnreadableBody { status: u16 },

    #[error("Failed to read response body: {0}")]
    Body(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Unsupported file type {mime} for {path}")]
    UnsupportedFile { path: PathBuf, mime: String },

    #[error("File error: {0}")]
    File(#[from] std::io::Error),

    #[error("Claim description is empty")]
    EmptyClaim,

    #[error("Question is empty")]
    EmptyQuestion,

    #[error("A chat request is already in flight")]
    ChatBusy,

    #[error("Request cancelled before completion")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, StreamError>;
