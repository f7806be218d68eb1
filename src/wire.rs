//! Wire protocol: newline-delimited JSON over TCP
//!
//! One connection carries one call. The client's first line is a
//! [`Request`]; the server answers with [`Response`] frames. During Record
//! the client streams [`RecordFrame`]s after the server's `accepted`.

use crate::address::NodeAddress;
use crate::session::{FinalStatus, RecordingState};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest frame a peer may send, newline excluded
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// First frame of every call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Record { conversation_id: String },
    Replay { conversation_id: String },
    Cancel { conversation_id: String },
    CheckRecordings { conversation_ids: Vec<String> },
    IsEnabled,
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Self::Record { .. } => "record",
            Self::Replay { .. } => "replay",
            Self::Cancel { .. } => "cancel",
            Self::CheckRecordings { .. } => "check_recordings",
            Self::IsEnabled => "is_enabled",
        }
    }

    /// Conversation the request is scoped to, if any.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::Record { conversation_id }
            | Self::Replay { conversation_id }
            | Self::Cancel { conversation_id } => Some(conversation_id),
            Self::CheckRecordings { .. } | Self::IsEnabled => None,
        }
    }
}

/// Producer frames sent after the server accepted a Record call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordFrame {
    Chunk { content: String },
    Complete,
    Fail { reason: String },
}

/// Terminal status reported to the producer of a Record call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Success,
    Cancelled,
    Error,
}

impl From<RecordingState> for RecordStatus {
    fn from(state: RecordingState) -> Self {
        match state {
            RecordingState::Completed => Self::Success,
            RecordingState::Cancelled => Self::Cancelled,
            RecordingState::Active | RecordingState::Error => Self::Error,
        }
    }
}

/// Server frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Record: the server owns the recording; stream chunks now
    Accepted,
    /// Record: this node is already recording the conversation
    AlreadyRecording,
    /// Another node owns the conversation; retry the same request there
    Redirect { address: NodeAddress },
    /// Replay: nothing recorded or retained for the conversation
    NotFound,
    /// Record: final status of the call
    Status {
        status: RecordStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    /// Replay: one recorded chunk
    Chunk { content: String },
    /// Replay: end of stream with the recording's final state
    End(FinalStatus),
    CancelResult { accepted: bool },
    Recordings { conversation_ids: Vec<String> },
    Enabled { enabled: bool },
    /// Malformed or failed request
    Error { message: String },
}

impl Response {
    pub fn status(status: &FinalStatus) -> Self {
        Self::Status {
            status: status.state.into(),
            error_message: status.error_message.clone(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Frame type as it appears on the wire, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::AlreadyRecording => "already_recording",
            Self::Redirect { .. } => "redirect",
            Self::NotFound => "not_found",
            Self::Status { .. } => "status",
            Self::Chunk { .. } => "chunk",
            Self::End(_) => "end",
            Self::CancelResult { .. } => "cancel_result",
            Self::Recordings { .. } => "recordings",
            Self::Enabled { .. } => "enabled",
            Self::Error { .. } => "error",
        }
    }
}

/// Convert a Record `status` frame back into a [`FinalStatus`].
pub fn final_status(status: RecordStatus, error_message: Option<String>) -> FinalStatus {
    match status {
        RecordStatus::Success => FinalStatus::completed(),
        RecordStatus::Cancelled => FinalStatus::cancelled(),
        RecordStatus::Error => {
            FinalStatus::error(error_message.unwrap_or_else(|| "recording failed".to_string()))
        }
    }
}

/// Write one frame followed by a newline, then flush.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(frame).map_err(std::io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Line reader with a per-line length cap.
///
/// Bytes of an unfinished line are kept across calls, so [`next_line`]
/// is cancel safe.
///
/// [`next_line`]: FrameReader::next_line
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
    max_len: usize,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_limit(reader, MAX_FRAME_BYTES)
    }

    pub fn with_limit(reader: R, max_len: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            max_len,
        }
    }

    /// Next line without its `\n` or `\r\n`. `Ok(None)` on end of stream.
    ///
    /// A line longer than the cap fails with `InvalidData`.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        // Room for the longest line plus its `\r\n`.
        let limit = self.max_len + 2;
        loop {
            let remaining = limit.saturating_sub(self.buf.len()) as u64;
            let read = (&mut self.reader)
                .take(remaining)
                .read_until(b'\n', &mut self.buf)
                .await?;
            if self.buf.last() == Some(&b'\n') || self.buf.len() >= limit {
                break;
            }
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                break;
            }
        }

        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        if line.len() > self.max_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame exceeds {} bytes", self.max_len),
            ));
        }
        String::from_utf8(line)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Read the next non-empty line as a frame. `Ok(None)` on end of stream.
///
/// Cancel safe: no line is lost if the future is dropped before completion.
pub async fn read_frame<R, T>(lines: &mut FrameReader<R>) -> std::io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        return serde_json::from_str(&line)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn request_wire_format() {
        let req = Request::Replay {
            conversation_id: "C1".into(),
        };
        assert_eq!(
            serde_json::to_string(&req).unwrap(),
            r#"{"op":"replay","conversation_id":"C1"}"#
        );
        assert_eq!(
            serde_json::to_string(&Request::IsEnabled).unwrap(),
            r#"{"op":"is_enabled"}"#
        );

        let parsed: Request =
            serde_json::from_str(r#"{"op":"check_recordings","conversation_ids":["a","b"]}"#)
                .unwrap();
        assert_eq!(parsed.op(), "check_recordings");
        assert_eq!(parsed.conversation_id(), None);
    }

    #[test]
    fn request_rejects_unknown_op() {
        assert!(serde_json::from_str::<Request>(r#"{"op":"delete","conversation_id":"C1"}"#).is_err());
        assert!(serde_json::from_str::<Request>(r#"{"op":"replay"}"#).is_err());
    }

    #[test]
    fn record_frames() {
        let frames = [
            r#"{"type":"chunk","content":"Hello"}"#,
            r#"{"type":"complete"}"#,
            r#"{"type":"fail","reason":"upstream timeout"}"#,
        ];
        for json in frames {
            let _frame: RecordFrame = serde_json::from_str(json).unwrap();
        }
    }

    #[test]
    fn response_wire_format() {
        let redirect = Response::Redirect {
            address: NodeAddress::parse("node-a:7420").unwrap(),
        };
        assert_eq!(
            serde_json::to_string(&redirect).unwrap(),
            r#"{"type":"redirect","address":"node-a:7420"}"#
        );
        assert_eq!(
            serde_json::to_string(&Response::End(FinalStatus::completed())).unwrap(),
            r#"{"type":"end","state":"completed"}"#
        );
        assert_eq!(
            serde_json::to_string(&Response::status(&FinalStatus::error("boom"))).unwrap(),
            r#"{"type":"status","status":"error","error_message":"boom"}"#
        );
        assert_eq!(
            serde_json::to_string(&Response::status(&FinalStatus::cancelled())).unwrap(),
            r#"{"type":"status","status":"cancelled"}"#
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(RecordStatus::from(RecordingState::Completed), RecordStatus::Success);
        assert_eq!(RecordStatus::from(RecordingState::Cancelled), RecordStatus::Cancelled);
        assert_eq!(RecordStatus::from(RecordingState::Error), RecordStatus::Error);
        assert_eq!(final_status(RecordStatus::Success, None), FinalStatus::completed());
        assert_eq!(
            final_status(RecordStatus::Error, Some("x".into())),
            FinalStatus::error("x")
        );
    }

    #[tokio::test]
    async fn frames_over_a_pipe() {
        let (client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut server, &Response::Accepted).await.unwrap();
        write_frame(&mut server, &Response::Chunk { content: "a\nb".into() })
            .await
            .unwrap();
        drop(server);

        let mut lines = FrameReader::new(BufReader::new(client));
        assert_eq!(
            read_frame::<_, Response>(&mut lines).await.unwrap(),
            Some(Response::Accepted)
        );
        assert_eq!(
            read_frame::<_, Response>(&mut lines).await.unwrap(),
            Some(Response::Chunk { content: "a\nb".into() })
        );
        assert_eq!(read_frame::<_, Response>(&mut lines).await.unwrap(), None);
    }

    #[tokio::test]
    async fn malformed_frame_is_invalid_data() {
        let input: &[u8] = b"\n{not json}\n";
        let mut lines = FrameReader::new(BufReader::new(input));
        let err = read_frame::<_, Request>(&mut lines).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut input = vec![b'x'; 64];
        input.extend_from_slice(b"\r\nshort\n");
        let mut lines = FrameReader::with_limit(BufReader::new(input.as_slice()), 16);
        let err = lines.next_line().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        let exact = b"0123456789abcdefghij\r\n{\"op\":\"is_enabled\"}";
        let mut lines = FrameReader::with_limit(BufReader::new(exact.as_slice()), 20);
        assert_eq!(
            lines.next_line().await.unwrap().as_deref(),
            Some("0123456789abcdefghij")
        );
        assert_eq!(
            read_frame::<_, Request>(&mut lines).await.unwrap(),
            Some(Request::IsEnabled)
        );
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn partial_line_survives_a_dropped_read() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut lines = FrameReader::new(BufReader::new(client));

        server.write_all(b"{\"type\":\"acc").await.unwrap();
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            read_frame::<_, Response>(&mut lines),
        )
        .await;
        assert!(pending.is_err());

        server.write_all(b"epted\"}\n").await.unwrap();
        assert_eq!(
            read_frame::<_, Response>(&mut lines).await.unwrap(),
            Some(Response::Accepted)
        );
    }
}
