//! External face locator / embedding helper.
//!
//! The helper is a long-lived child process. Each request is one JSON
//! header line followed by `width * height` raw grayscale bytes on its
//! stdin; each reply is one JSON line on its stdout:
//!
//! ```text
//! -> {"op":"info","width":0,"height":0}
//! <- {"model_version":"dlib-r34"}
//! -> {"op":"locate","width":640,"height":480}   + pixels
//! <- {"faces":[{"x":10,"y":20,"width":80,"height":80,"confidence":0.98}]}
//! -> {"op":"embed","width":80,"height":80}      + pixels
//! <- {"embedding":[0.01, ...],"model_version":"dlib-r34"}
//! <- {"error":"no_face"}
//! ```

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use rollcall_core::{BoundingBox, Embedding, EmbeddingExtractor, ExtractError, FaceLocator, FaceRegion};
use serde::{Deserialize, Serialize};

const NO_FACE: &str = "no_face";

#[derive(Debug, Serialize)]
struct Header<'a> {
    op: &'a str,
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(untagged)]
enum Reply {
    Error {
        error: String,
    },
    Faces {
        faces: Vec<BoundingBox>,
    },
    Embedding {
        embedding: Vec<f32>,
        #[serde(default)]
        model_version: Option<String>,
    },
    Info {
        #[serde(default)]
        model_version: Option<String>,
    },
}

fn parse_reply(line: &str) -> Result<Reply, ExtractError> {
    serde_json::from_str(line.trim())
        .map_err(|e| ExtractError::Backend(format!("malformed helper reply: {e}")))
}

fn reply_error(error: String) -> ExtractError {
    if error == NO_FACE {
        ExtractError::NoFaceDetected
    } else {
        ExtractError::Backend(error)
    }
}

fn into_faces(reply: Reply) -> Result<Vec<BoundingBox>, ExtractError> {
    match reply {
        Reply::Faces { faces } => Ok(faces),
        Reply::Error { error } => Err(reply_error(error)),
        other => Err(ExtractError::Backend(format!("unexpected helper reply: {other:?}"))),
    }
}

fn into_embedding(reply: Reply, fallback_version: Option<&str>) -> Result<Embedding, ExtractError> {
    match reply {
        Reply::Embedding {
            embedding,
            model_version,
        } => {
            if embedding.is_empty() {
                return Err(ExtractError::Backend("helper returned an empty embedding".into()));
            }
            Ok(Embedding {
                values: embedding,
                model_version: model_version.or_else(|| fallback_version.map(str::to_owned)),
            })
        }
        Reply::Error { error } => Err(reply_error(error)),
        other => Err(ExtractError::Backend(format!("unexpected helper reply: {other:?}"))),
    }
}

/// A running helper process. Killed on drop.
pub struct HelperProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    model_version: Option<String>,
}

impl HelperProcess {
    /// Spawn the helper from a whitespace-separated command line and
    /// query its model version.
    pub fn spawn(command_line: &str) -> Result<Self, ExtractError> {
        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| ExtractError::Backend("empty extractor command".into()))?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| ExtractError::Backend(format!("failed to spawn {program}: {e}")))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(ExtractError::Backend("helper pipes unavailable".into()));
        };

        let mut helper = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            model_version: None,
        };

        match helper.request("info", 0, 0, &[])? {
            Reply::Info { model_version } => helper.model_version = model_version,
            Reply::Error { error } => return Err(reply_error(error)),
            other => {
                return Err(ExtractError::Backend(format!(
                    "unexpected helper handshake: {other:?}"
                )))
            }
        }

        tracing::info!(
            command = command_line,
            pid = helper.child.id(),
            model_version = helper.model_version.as_deref().unwrap_or("unknown"),
            "extractor helper started"
        );
        Ok(helper)
    }

    fn request(&mut self, op: &str, width: u32, height: u32, pixels: &[u8]) -> Result<Reply, ExtractError> {
        let header = serde_json::to_string(&Header { op, width, height })
            .map_err(|e| ExtractError::Backend(e.to_string()))?;

        let io = |e: std::io::Error| ExtractError::Backend(format!("helper io: {e}"));
        self.stdin.write_all(header.as_bytes()).map_err(io)?;
        self.stdin.write_all(b"\n").map_err(io)?;
        self.stdin.write_all(pixels).map_err(io)?;
        self.stdin.flush().map_err(io)?;

        let mut line = String::new();
        let read = self.stdout.read_line(&mut line).map_err(io)?;
        if read == 0 {
            return Err(ExtractError::Backend("helper closed its output".into()));
        }
        parse_reply(&line)
    }
}

impl FaceLocator for HelperProcess {
    fn locate(&mut self, gray: &[u8], width: u32, height: u32) -> Result<Vec<BoundingBox>, ExtractError> {
        let len = (width as usize) * (height as usize);
        let pixels = gray
            .get(..len)
            .ok_or_else(|| ExtractError::Backend(format!("frame buffer shorter than {len} bytes")))?;
        let reply = self.request("locate", width, height, pixels)?;
        into_faces(reply)
    }
}

impl EmbeddingExtractor for HelperProcess {
    fn extract(&mut self, region: &FaceRegion) -> Result<Embedding, ExtractError> {
        let reply = self.request("embed", region.width(), region.height(), region.pixels())?;
        into_embedding(reply, self.model_version.as_deref())
    }

    fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }
}

impl Drop for HelperProcess {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            tracing::debug!(error = %e, "helper already exited");
        }
        let _ = self.child.wait();
    }
}
