//! Client side of the wire protocol
//!
//! Every call follows at most one redirect. A second redirect, or a redirect
//! target that cannot be reached, is treated as "no active recording".

use crate::session::{FinalStatus, RecordingState};
use crate::wire::{self, FrameReader, RecordFrame, Request, Response};
use std::time::Duration;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, trace};

/// Errors returned by client calls
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server closed the connection")]
    Closed,
    #[error("unexpected {0} frame from server")]
    Unexpected(&'static str),
    #[error("server error: {0}")]
    Server(String),
    #[error("conversation {0} is already being recorded")]
    AlreadyRecording(String),
    #[error("conversation {0} is owned by an unreachable node")]
    OwnerUnreachable(String),
    #[error("recording was cancelled")]
    Cancelled,
}

/// One open call
#[derive(Debug)]
struct Connection {
    address: String,
    lines: FrameReader<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(address: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| ClientError::Connect {
                address: address.to_string(),
                source,
            })?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            address: address.to_string(),
            lines: FrameReader::new(BufReader::new(read_half)),
            writer,
        })
    }

    async fn send<T: serde::Serialize>(&mut self, frame: &T) -> Result<(), ClientError> {
        wire::write_frame(&mut self.writer, frame).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Response, ClientError> {
        wire::read_frame(&mut self.lines)
            .await?
            .ok_or(ClientError::Closed)
    }

    /// A frame the server already sent, without waiting for one.
    async fn try_recv(&mut self) -> Result<Option<Response>, ClientError> {
        match tokio::time::timeout(Duration::ZERO, wire::read_frame(&mut self.lines)).await {
            Ok(frame) => Ok(frame?),
            Err(_) => Ok(None),
        }
    }
}

/// Where a call ended up after redirects
enum Hop {
    Served(Connection, Response),
    /// Redirect target unreachable or redirected again
    Lost(String),
}

async fn exchange(address: &str, request: &Request) -> Result<(Connection, Response), ClientError> {
    let mut conn = Connection::open(address).await?;
    conn.send(request).await?;
    let first = conn.recv().await?;
    trace!(%address, frame = first.kind(), "first response");
    Ok((conn, first))
}

async fn call(address: &str, request: &Request) -> Result<Hop, ClientError> {
    let (conn, first) = exchange(address, request).await?;
    let Response::Redirect { address: target } = first else {
        return Ok(Hop::Served(conn, first));
    };
    drop(conn);

    let target = target.authority();
    debug!(from = %address, to = %target, op = request.op(), "following redirect");
    match exchange(&target, request).await {
        Ok((_, Response::Redirect { address: again })) => {
            debug!(to = %again, "second redirect; giving up");
            Ok(Hop::Lost(target))
        }
        Ok((conn, frame)) => Ok(Hop::Served(conn, frame)),
        Err(ClientError::Connect { address, source }) => {
            debug!(%address, error = %source, "redirect target unreachable");
            Ok(Hop::Lost(address))
        }
        Err(e) => Err(e),
    }
}

fn server_error(frame: Response) -> ClientError {
    match frame {
        Response::Error { message } => ClientError::Server(message),
        other => ClientError::Unexpected(other.kind()),
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// Replay a conversation from offset zero. `None` when nothing is recorded.
pub async fn replay(address: &str, conversation_id: &str) -> Result<Option<ReplayStream>, ClientError> {
    let request = Request::Replay {
        conversation_id: conversation_id.to_string(),
    };
    match call(address, &request).await? {
        Hop::Lost(_) => Ok(None),
        Hop::Served(_, Response::NotFound) => Ok(None),
        Hop::Served(conn, first @ (Response::Chunk { .. } | Response::End(_))) => {
            Ok(Some(ReplayStream {
                served_by: conn.address.clone(),
                conn,
                pending: Some(first),
                status: None,
            }))
        }
        Hop::Served(_, other) => Err(server_error(other)),
    }
}

/// Chunks of a replayed recording, in append order
#[derive(Debug)]
pub struct ReplayStream {
    conn: Connection,
    served_by: String,
    pending: Option<Response>,
    status: Option<FinalStatus>,
}

impl ReplayStream {
    /// Address of the node streaming the chunks.
    pub fn served_by(&self) -> &str {
        &self.served_by
    }

    /// Final status, once [`next`](Self::next) has returned `None`.
    pub fn status(&self) -> Option<&FinalStatus> {
        self.status.as_ref()
    }

    pub async fn next(&mut self) -> Result<Option<String>, ClientError> {
        if self.status.is_some() {
            return Ok(None);
        }
        let frame = match self.pending.take() {
            Some(frame) => frame,
            None => self.conn.recv().await?,
        };
        match frame {
            Response::Chunk { content } => Ok(Some(content)),
            Response::End(status) => {
                self.status = Some(status);
                Ok(None)
            }
            other => Err(server_error(other)),
        }
    }

    /// Read the whole stream.
    pub async fn collect(mut self) -> Result<(Vec<String>, FinalStatus), ClientError> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next().await? {
            chunks.push(chunk);
        }
        let status = self.status.unwrap_or_else(FinalStatus::interrupted);
        Ok((chunks, status))
    }
}

// ---------------------------------------------------------------------------
// Cancel / CheckRecordings / IsEnabled
// ---------------------------------------------------------------------------

/// Request cancellation of an active recording. `true` when accepted.
pub async fn cancel(address: &str, conversation_id: &str) -> Result<bool, ClientError> {
    let request = Request::Cancel {
        conversation_id: conversation_id.to_string(),
    };
    match call(address, &request).await? {
        Hop::Lost(_) => Ok(false),
        Hop::Served(_, Response::CancelResult { accepted }) => Ok(accepted),
        Hop::Served(_, other) => Err(server_error(other)),
    }
}

/// Subset of `conversation_ids` with an active recording somewhere in the cluster.
pub async fn check_recordings(
    address: &str,
    conversation_ids: &[String],
) -> Result<Vec<String>, ClientError> {
    let request = Request::CheckRecordings {
        conversation_ids: conversation_ids.to_vec(),
    };
    let (_, frame) = exchange(address, &request).await?;
    match frame {
        Response::Recordings { conversation_ids } => Ok(conversation_ids),
        other => Err(server_error(other)),
    }
}

/// Whether the node can redirect across the cluster.
pub async fn is_enabled(address: &str) -> Result<bool, ClientError> {
    let (_, frame) = exchange(address, &Request::IsEnabled).await?;
    match frame {
        Response::Enabled { enabled } => Ok(enabled),
        other => Err(server_error(other)),
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Producer side of a remote Record call
#[derive(Debug)]
pub struct RemoteRecorder {
    conn: Connection,
    conversation_id: String,
    /// Status the server sent early (cancellation)
    early_status: Option<FinalStatus>,
}

impl RemoteRecorder {
    /// Start recording on the node that owns (or will own) the conversation.
    pub async fn begin(address: &str, conversation_id: &str) -> Result<Self, ClientError> {
        let request = Request::Record {
            conversation_id: conversation_id.to_string(),
        };
        match call(address, &request).await? {
            Hop::Served(conn, Response::Accepted) => {
                debug!(%conversation_id, node = %conn.address, "recording accepted");
                Ok(Self {
                    conn,
                    conversation_id: conversation_id.to_string(),
                    early_status: None,
                })
            }
            Hop::Served(_, Response::AlreadyRecording) => {
                Err(ClientError::AlreadyRecording(conversation_id.to_string()))
            }
            Hop::Lost(node) => Err(ClientError::OwnerUnreachable(node)),
            Hop::Served(_, other) => Err(server_error(other)),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Address of the node recording the conversation.
    pub fn node(&self) -> &str {
        &self.conn.address
    }

    /// Send one chunk. Fails with [`ClientError::Cancelled`] once the
    /// server reported that the recording was cancelled.
    pub async fn append(&mut self, chunk: &str) -> Result<(), ClientError> {
        self.check_early_status().await?;
        let frame = RecordFrame::Chunk {
            content: chunk.to_string(),
        };
        if let Err(e) = self.conn.send(&frame).await {
            // The server may have ended the call; its status explains why.
            if let Ok(Response::Status { status, error_message }) = self.conn.recv().await {
                self.early_status = Some(wire::final_status(status, error_message));
                return self.check_early_status().await;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Finish the recording successfully; returns the server's final status.
    pub async fn complete(self) -> Result<FinalStatus, ClientError> {
        self.finish(RecordFrame::Complete).await
    }

    /// Finish the recording with an upstream failure.
    pub async fn fail(self, reason: &str) -> Result<FinalStatus, ClientError> {
        self.finish(RecordFrame::Fail {
            reason: reason.to_string(),
        })
        .await
    }

    async fn finish(mut self, frame: RecordFrame) -> Result<FinalStatus, ClientError> {
        if let Some(status) = self.early_status.take() {
            return Ok(status);
        }
        // A write error here means the server already sent its status.
        let _ = self.conn.send(&frame).await;
        match self.conn.recv().await? {
            Response::Status {
                status,
                error_message,
            } => Ok(wire::final_status(status, error_message)),
            other => Err(server_error(other)),
        }
    }

    async fn check_early_status(&mut self) -> Result<(), ClientError> {
        if self.early_status.is_none()
            && let Some(frame) = self.conn.try_recv().await?
        {
            match frame {
                Response::Status {
                    status,
                    error_message,
                } => self.early_status = Some(wire::final_status(status, error_message)),
                other => return Err(server_error(other)),
            }
        }
        match &self.early_status {
            Some(status) if status.state == RecordingState::Cancelled => {
                Err(ClientError::Cancelled)
            }
            Some(status) => Err(ClientError::Server(
                status
                    .error_message
                    .clone()
                    .unwrap_or_else(|| format!("recording ended: {}", status.state)),
            )),
            None => Ok(()),
        }
    }
}
