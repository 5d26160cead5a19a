//! Embedding extraction through an external program.
//!
//! The program receives the encoded frame on stdin and prints one JSON
//! object on stdout:
//!
//! ```json
//! {"embedding": [0.01, -0.2, ...], "model_version": "resnet34-128"}
//! {"embedding": null}
//! ```
//!
//! A `null` embedding means no face was found.

use std::process::Stdio;

use rollcall_core::{CaptureError, Embedding, EmbeddingExtractor, Frame};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Deserialize)]
struct ExtractorReply {
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    model_version: Option<String>,
}

pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
}

impl CommandExtractor {
    /// Split a command line on whitespace into program and arguments.
    pub fn from_command_line(command: &str) -> Result<Self, CaptureError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| CaptureError::Unavailable("empty extractor command".into()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl EmbeddingExtractor for CommandExtractor {
    async fn extract(&self, frame: &Frame) -> Result<Option<Embedding>, CaptureError> {
        if frame.is_empty() {
            return Ok(None);
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out submission drops this future; take the child with it.
            .kill_on_drop(true);
        if let Some(content_type) = &frame.content_type {
            command.env("ROLLCALL_CONTENT_TYPE", content_type);
        }

        let mut child = command
            .spawn()
            .map_err(|e| CaptureError::Unavailable(format!("{}: {e}", self.program)))?;

        // Feed stdin while stdout and stderr drain, or a chatty extractor can
        // fill a pipe and stall both sides.
        let stdin = child.stdin.take();
        let feed = async move {
            match stdin {
                Some(mut stdin) => stdin.write_all(&frame.data).await,
                None => Ok(()),
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| CaptureError::Failed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptureError::Failed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        match fed {
            // The program answered without reading the whole frame.
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                tracing::debug!(program = %self.program, "extractor closed stdin early");
            }
            Err(e) => return Err(CaptureError::Failed(format!("write frame: {e}"))),
            Ok(()) => {}
        }

        let embedding = parse_reply(&output.stdout)?;
        tracing::debug!(
            program = %self.program,
            face = embedding.is_some(),
            "extractor finished"
        );
        Ok(embedding)
    }
}

fn parse_reply(stdout: &[u8]) -> Result<Option<Embedding>, CaptureError> {
    let reply: ExtractorReply =
        serde_json::from_slice(stdout).map_err(|e| CaptureError::Malformed(e.to_string()))?;
    Ok(match reply.embedding {
        // An empty vector is still "no face", never an empty embedding.
        Some(values) if !values.is_empty() => Some(Embedding {
            values,
            model_version: reply.model_version,
        }),
        _ => None,
    })
}
