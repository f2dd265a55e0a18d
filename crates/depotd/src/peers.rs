//! The line-oriented control channel to peer server processes.
//!
//! The announcer publishes one line per advanced mailbox, of the form
//! `mailbox "NAME" uidnext=U nextmodseq=M`. Lines fan out to every
//! configured peer; a peer that is down just misses announcements until
//! it reconnects and re-reads mailbox state.

use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

pub struct PeerNotifier {
    sender: mpsc::UnboundedSender<String>,
}

impl PeerNotifier {
    /// Build a notifier and the receiving end of its line stream. The
    /// caller decides where the lines go: [`spawn_writer`] for real
    /// peers, or a plain receiver in tests.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }

    pub fn send(&self, line: String) {
        // A closed receiver means nobody is listening; that is fine.
        let _ = self.sender.send(line);
    }
}

/// Forward announcement lines to the configured peer addresses over TCP.
/// Connections are (re-)established lazily per line batch; a failed peer
/// is skipped with a warning.
pub fn spawn_writer(mut receiver: mpsc::UnboundedReceiver<String>, peers: Vec<String>) {
    if peers.is_empty() {
        tokio::spawn(async move { while receiver.recv().await.is_some() {} });
        return;
    }
    tokio::spawn(async move {
        let mut connections: Vec<(String, Option<tokio::net::TcpStream>)> =
            peers.into_iter().map(|p| (p, None)).collect();
        while let Some(line) = receiver.recv().await {
            let payload = format!("{line}\r\n");
            for (addr, slot) in connections.iter_mut() {
                if slot.is_none() {
                    match tokio::net::TcpStream::connect(addr.as_str()).await {
                        Ok(stream) => *slot = Some(stream),
                        Err(err) => {
                            tracing::warn!("cannot reach peer {addr}: {err}");
                            continue;
                        }
                    }
                }
                if let Some(stream) = slot {
                    if let Err(err) = stream.write_all(payload.as_bytes()).await {
                        tracing::warn!("lost connection to peer {addr}: {err}");
                        *slot = None;
                    }
                }
            }
        }
    });
}
