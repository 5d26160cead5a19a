//! Capture-side contract: turning a camera frame into an embedding.
//!
//! Detection and embedding extraction are external; the session only needs
//! a frame in and either an embedding or "no face" out.

use std::future::Future;

use thiserror::Error;

use crate::types::Embedding;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("extractor unavailable: {0}")]
    Unavailable(String),
    #[error("extractor failed: {0}")]
    Failed(String),
    #[error("extractor returned malformed output: {0}")]
    Malformed(String),
}

/// An encoded camera frame (JPEG/PNG bytes as delivered by the capture UI).
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    /// MIME type hint for the extractor, e.g. `image/jpeg`.
    pub content_type: Option<String>,
}

impl Frame {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, content_type: None }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// External face detector + embedding model.
pub trait EmbeddingExtractor: Send + Sync {
    /// `Ok(None)` means the frame contained no detectable face.
    fn extract(
        &self,
        frame: &Frame,
    ) -> impl Future<Output = Result<Option<Embedding>, CaptureError>> + Send;
}
