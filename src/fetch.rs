//! Resolution of remote references into document text.
//!
//! [`HttpFetcher`] downloads what a payload link points at and
//! [`read_document`] turns the bytes into text. Only text documents are read
//! here; binary office formats need a dedicated extractor and are rejected.

use std::time::Duration;

use reqwest::{Client, Url};
use thiserror::Error;
use tracing::debug;

use crate::error::PipelineError;

/// Extensions of formats that cannot be read as text.
const BINARY_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "zip"];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("could not download {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("'{filename}' is not a text document")]
    Unsupported { filename: String },

    #[error("'{filename}' contains no text")]
    Empty { filename: String },

    #[error("{url} is larger than {limit} bytes")]
    TooLarge { url: String, limit: usize },
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        match &err {
            FetchError::Network { .. } => PipelineError::TransientExternal(err.to_string()),
            FetchError::Status { status, .. } if *status >= 500 || *status == 429 => {
                PipelineError::TransientExternal(err.to_string())
            }
            _ => PipelineError::Validation(err.to_string()),
        }
    }
}

/// A downloaded object.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Downloads linked documents, refusing bodies over `max_bytes`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    max_bytes: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self { client, max_bytes })
    }

    pub async fn fetch(&self, url: &Url) -> Result<Fetched, FetchError> {
        let network = |source| FetchError::Network {
            url: url.to_string(),
            source,
        };
        let mut response = self.client.get(url.clone()).send().await.map_err(network)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let too_large = || FetchError::TooLarge {
            url: url.to_string(),
            limit: self.max_bytes,
        };
        let declared = response.content_length().unwrap_or(0);
        if declared > self.max_bytes as u64 {
            return Err(too_large());
        }

        // The declared length can be absent or wrong, so count while reading.
        let mut bytes = Vec::with_capacity(declared as usize);
        while let Some(chunk) = response.chunk().await.map_err(network)? {
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(too_large());
            }
            bytes.extend_from_slice(&chunk);
        }
        debug!(%url, bytes = bytes.len(), "document downloaded");
        Ok(Fetched {
            filename: filename_of(url),
            bytes,
        })
    }
}

fn filename_of(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .unwrap_or("document")
        .to_string()
}

/// Extract text from a document. Invalid UTF-8 sequences are replaced rather
/// than rejected.
pub fn read_document(bytes: &[u8], filename: &str) -> Result<String, FetchError> {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if BINARY_EXTENSIONS.contains(&extension.as_str()) || bytes.starts_with(b"%PDF") {
        return Err(FetchError::Unsupported {
            filename: filename.to_string(),
        });
    }

    let text = String::from_utf8_lossy(bytes).trim().to_string();
    if text.is_empty() {
        return Err(FetchError::Empty {
            filename: filename.to_string(),
        });
    }
    Ok(text)
}
