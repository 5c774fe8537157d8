use serde::{Deserialize, Serialize};

/// Hard cap on buffered request bytes before a parse must have succeeded.
pub const MAX_REQUEST_BYTES: usize = 10_000;

/// The single JSON object a client sends per connection.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadRequest {
    pub bot_name: String,
    pub pack_number: String,
    #[serde(default)]
    pub send_progress: bool,
}

impl DownloadRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.bot_name.trim().is_empty() {
            return Err("bot_name must not be empty".to_string());
        }
        if self.pack_digits().is_empty() {
            return Err("pack_number must not be empty".to_string());
        }
        Ok(())
    }

    /// Pack number with the conventional leading `#` stripped.
    pub fn pack_digits(&self) -> String {
        self.pack_number
            .trim()
            .trim_start_matches('#')
            .to_string()
    }
}

/// Server-to-client messages, written as concatenated UTF-8 JSON objects
/// with no delimiter. Clients are expected to parse the catenated stream
/// best-effort.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Envelope {
    Downloading {
        message: String,
        pack_number: String,
    },
    Progress {
        filename: String,
        progress: u64,
        received: u64,
        total: u64,
    },
    Success {
        filename: String,
        path: String,
        size: u64,
        pack_number: String,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pack_number: Option<String>,
    },
}
