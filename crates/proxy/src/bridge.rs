use dbx_jsonrpc::{
    classify, error_response, read_line_limited, FrameKind, INVALID_REQUEST, PARSE_ERROR,
};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

/// Messages accepted by the writer task.
#[derive(Debug)]
pub enum Outbound {
    /// One serialized JSON-RPC frame, without the trailing newline.
    Frame(Vec<u8>),
    /// Flush everything written so far and acknowledge, then stop.
    Shutdown(oneshot::Sender<()>),
}

/// Serializes `frame` and queues it on the writer. Send failure means the
/// writer task is gone, which the caller treats as a broken pipe.
pub async fn send_frame(tx: &mpsc::Sender<Outbound>, frame: &Value) -> Result<(), ()> {
    let bytes = serde_json::to_vec(frame).map_err(|_| ())?;
    tx.send(Outbound::Frame(bytes)).await.map_err(|_| ())
}

/// Spawns the task that owns the output stream.
///
/// Every frame is written as one line and flushed immediately; an interactive
/// client is waiting on the other end. The task exits on [`Outbound::Shutdown`]
/// or a write error, and its join handle yields the terminal io result.
pub fn spawn_writer<W>(mut writer: W) -> (mpsc::Sender<Outbound>, JoinHandle<std::io::Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Outbound>(64);
    let handle = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Frame(mut bytes) => {
                    bytes.push(b'\n');
                    writer.write_all(&bytes).await?;
                    writer.flush().await?;
                }
                Outbound::Shutdown(ack) => {
                    writer.flush().await?;
                    let _ = ack.send(());
                    return Ok(());
                }
            }
        }
        Ok(())
    });
    (tx, handle)
}

/// A classified frame read from the client.
#[derive(Debug)]
pub struct InboundFrame {
    pub value: Value,
    pub kind: FrameKind,
}

/// One read's worth of outcome from the client stream.
#[derive(Debug)]
pub enum ReadEvent {
    Frame(InboundFrame),
    /// The line was unusable; the prepared error response goes straight back
    /// to the client and reading continues with the next line.
    Malformed(Value),
}

pub struct FrameReader<R> {
    reader: R,
    max_bytes: usize,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_bytes: usize) -> Self {
        Self { reader, max_bytes }
    }

    /// Reads the next frame. `Ok(None)` means the client closed its end.
    ///
    /// Malformed JSON and invalid frames are reported as [`ReadEvent::Malformed`]
    /// rather than errors; only real io failures propagate.
    pub async fn next(&mut self) -> std::io::Result<Option<ReadEvent>> {
        loop {
            let line = match read_line_limited(&mut self.reader, self.max_bytes).await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                    warn!("dropping oversized client message");
                    return Ok(Some(ReadEvent::Malformed(error_response(
                        Value::Null,
                        INVALID_REQUEST,
                        format!("message exceeds {} bytes", self.max_bytes),
                        None,
                    ))));
                }
                Err(err) => return Err(err),
            };

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let value: Value = match serde_json::from_slice(&line) {
                Ok(value) => value,
                Err(err) => {
                    warn!(error = %err, "unparseable client message");
                    return Ok(Some(ReadEvent::Malformed(error_response(
                        Value::Null,
                        PARSE_ERROR,
                        "invalid JSON",
                        None,
                    ))));
                }
            };

            match classify(&value) {
                Ok(kind) => return Ok(Some(ReadEvent::Frame(InboundFrame { value, kind }))),
                Err(err) => {
                    warn!(error = %err, "invalid client frame");
                    // Echo the id back when the frame at least carried one.
                    let id = value.get("id").cloned().unwrap_or(Value::Null);
                    return Ok(Some(ReadEvent::Malformed(error_response(
                        id,
                        INVALID_REQUEST,
                        err.to_string(),
                        None,
                    ))));
                }
            }
        }
    }
}
