//! Line-based message I/O over a child's stdin/stdout (or any async pipe).

use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::protocol::Message;

/// Sending half of a message channel. Sends never block.
pub type Outbound = mpsc::UnboundedSender<Message>;

/// One line read from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Message),
    /// A line that is not a protocol message (stray output).
    Text(String),
}

pub struct MessageReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Next non-blank frame; `None` on EOF.
    pub async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(match Message::from_line(&line) {
                Ok(message) => Frame::Message(message),
                Err(_) => Frame::Text(line),
            }));
        }
        Ok(None)
    }
}

/// Spawn a task that writes every queued message to `writer`, one line
/// each. The task ends when every [`Outbound`] is dropped (after draining
/// the queue) or when a write fails.
pub fn spawn_writer<W>(writer: W, peer: String) -> (Outbound, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let handle = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = rx.recv().await {
            let line = match message.to_line() {
                Ok(line) => line,
                Err(err) => {
                    warn!(peer = %peer, error = %err, "Dropping unserializable message");
                    continue;
                }
            };
            let written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            }
            .await;
            if let Err(err) = written {
                debug!(peer = %peer, error = %err, "Message channel closed");
                break;
            }
        }
    });
    (tx, handle)
}
