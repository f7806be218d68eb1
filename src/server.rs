//! TCP server for the resumer wire protocol
//!
//! Each accepted connection carries one call. The first line is decoded as a
//! [`Request`] and routed; responses are newline-delimited JSON frames.

use crate::error::ResumerError;
use crate::registry::Recording;
use crate::router::{Routed, Router};
use crate::session::FinalStatus;
use crate::wire::{self, FrameReader, RecordFrame, Request, Response};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

/// How long a finished Record call keeps reading leftover producer frames
const LINGER: Duration = Duration::from_secs(2);

/// Accept connections forever, spawning one task per connection.
pub async fn serve(listener: TcpListener, router: Router) {
    if let Ok(addr) = listener.local_addr() {
        info!("resumer listening on {}", addr);
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let router = router.clone();
                tokio::spawn(async move {
                    trace!(%peer, "connection accepted");
                    if let Err(e) = handle_connection(stream, &router).await {
                        debug!(%peer, error = %e, "connection ended with error");
                    }
                });
            }
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, router: &Router) -> std::io::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = FrameReader::new(BufReader::new(read_half));

    let request = match wire::read_frame::<_, Request>(&mut lines).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            debug!(error = %e, "malformed request");
            let reply = Response::error(format!("malformed request: {e}"));
            return wire::write_frame(&mut writer, &reply).await;
        }
        Err(e) => return Err(e),
    };

    if request.conversation_id().is_some_and(|id| id.is_empty()) {
        let reply = Response::error("conversation_id must not be empty");
        return wire::write_frame(&mut writer, &reply).await;
    }
    debug!(op = request.op(), conversation_id = ?request.conversation_id(), "request");

    match request {
        Request::Record { conversation_id } => {
            handle_record(router, &conversation_id, &mut lines, &mut writer).await
        }
        Request::Replay { conversation_id } => {
            handle_replay(router, &conversation_id, &mut writer).await
        }
        Request::Cancel { conversation_id } => {
            let reply = match router.cancel(&conversation_id) {
                Routed::Local(accepted) => Response::CancelResult { accepted },
                Routed::Redirect(address) => Response::Redirect { address },
                Routed::NotFound => Response::CancelResult { accepted: false },
            };
            wire::write_frame(&mut writer, &reply).await
        }
        Request::CheckRecordings { conversation_ids } => {
            let conversation_ids = router.check_recordings(&conversation_ids);
            wire::write_frame(&mut writer, &Response::Recordings { conversation_ids }).await
        }
        Request::IsEnabled => {
            let enabled = router.is_enabled();
            wire::write_frame(&mut writer, &Response::Enabled { enabled }).await
        }
    }
}

async fn handle_record<R, W>(
    router: &Router,
    conversation_id: &str,
    lines: &mut FrameReader<R>,
    writer: &mut W,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let recording = match router.record(conversation_id) {
        Ok(Routed::Local(recording)) => recording,
        Ok(Routed::Redirect(address)) => {
            return wire::write_frame(writer, &Response::Redirect { address }).await;
        }
        Ok(Routed::NotFound) => {
            return wire::write_frame(writer, &Response::error("no node can record")).await;
        }
        Err(ResumerError::AlreadyRecording(_)) => {
            return wire::write_frame(writer, &Response::AlreadyRecording).await;
        }
        Err(e) => {
            warn!(%conversation_id, error = %e, "failed to start recording");
            return wire::write_frame(writer, &Response::error(e.to_string())).await;
        }
    };

    // A producer that vanished before seeing `accepted` abandons the recording.
    wire::write_frame(writer, &Response::Accepted).await?;
    let status = drive_recording(recording, lines).await;
    debug!(%conversation_id, state = %status.state, "record call finished");
    wire::write_frame(writer, &Response::status(&status)).await?;
    writer.shutdown().await?;

    // Frames still in flight are discarded so closing does not reset the
    // connection before the producer has read its status.
    let drain = async { while let Ok(Some(_)) = lines.next_line().await {} };
    let _ = tokio::time::timeout(LINGER, drain).await;
    Ok(())
}

/// Pump producer frames into the recording until it reaches a terminal state.
async fn drive_recording<R>(mut recording: Recording, lines: &mut FrameReader<R>) -> FinalStatus
where
    R: AsyncBufRead + Unpin,
{
    let mut state_rx = recording.subscribe();
    loop {
        tokio::select! {
            frame = wire::read_frame::<_, RecordFrame>(lines) => match frame {
                Ok(Some(RecordFrame::Chunk { content })) => {
                    if let Err(e) = recording.record(&content).await {
                        return settled_status(&recording, &e);
                    }
                }
                // End of stream without an explicit frame counts as success.
                Ok(Some(RecordFrame::Complete)) | Ok(None) => {
                    return recording.settle(FinalStatus::completed()).await;
                }
                Ok(Some(RecordFrame::Fail { reason })) => {
                    return recording.settle(FinalStatus::error(reason)).await;
                }
                Err(e) => {
                    let message = if e.kind() == std::io::ErrorKind::InvalidData {
                        format!("malformed record frame: {e}")
                    } else {
                        format!("producer connection lost: {e}")
                    };
                    return recording.settle(FinalStatus::error(message)).await;
                }
            },
            ended = async { state_rx.wait_for(|state| state.is_terminal()).await.map(|_| ()) } => {
                drop(ended);
                debug!(
                    conversation_id = recording.conversation_id(),
                    state = %recording.state(),
                    "recording ended outside the record call"
                );
                return recording.outcome().unwrap_or_else(FinalStatus::interrupted);
            }
        }
    }
}

/// Status the recording ended with; the error describes it only as a fallback.
fn settled_status(recording: &Recording, e: &ResumerError) -> FinalStatus {
    if let Some(status) = recording.outcome() {
        return status;
    }
    if e.is_cancelled() {
        FinalStatus::cancelled()
    } else {
        FinalStatus::error(e.to_string())
    }
}

async fn handle_replay<W>(router: &Router, conversation_id: &str, writer: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut reader = match router.replay(conversation_id) {
        Ok(Routed::Local(reader)) => reader,
        Ok(Routed::Redirect(address)) => {
            return wire::write_frame(writer, &Response::Redirect { address }).await;
        }
        Ok(Routed::NotFound) => return wire::write_frame(writer, &Response::NotFound).await,
        Err(e) => {
            warn!(%conversation_id, error = %e, "failed to open replay");
            return wire::write_frame(writer, &Response::error(e.to_string())).await;
        }
    };

    let mut sent = 0usize;
    loop {
        match reader.next().await {
            Ok(Some(content)) => {
                wire::write_frame(writer, &Response::Chunk { content }).await?;
                sent += 1;
            }
            Ok(None) => {
                let status = reader.status().cloned().unwrap_or_else(FinalStatus::interrupted);
                trace!(%conversation_id, chunks = sent, "replay finished");
                return wire::write_frame(writer, &Response::End(status)).await;
            }
            Err(e) => {
                warn!(%conversation_id, error = %e, "replay read failed");
                return wire::write_frame(writer, &Response::error(e.to_string())).await;
            }
        }
    }
}
