pub mod chat;
pub mod client;
pub mod config;
pub mod decoder;
pub mod error;
pub mod history;
pub mod pipeline;
pub mod progress;
pub mod record;
pub mod text;

// Re-export commonly used types
pub use chat::{CHAT_ERROR_MESSAGE, ChatObserver, ChatRole, ChatTurn, Conversation, TextAccumulator};
pub use client::ClaimsClient;
pub use config::ClientConfig;
pub use decoder::{LineDecoder, decode_records};
pub use error::{Result, StreamError};
pub use history::{
    ClaimHistory, ClaimHistoryEntry, ClaimStatus, FileStore, InMemoryStore, KeyValueStore,
};
pub use pipeline::{ChatSession, ClaimPipeline, summarize};
pub use progress::{ProgressObserver, ProgressState, RequestPhase};
pub use record::StreamRecord;

/// Serialize finished records as the `claim_data` sent with chat questions
pub fn claim_data(records: &[StreamRecord]) -> Result<String> {
    Ok(serde_json::to_string(records)?)
}
