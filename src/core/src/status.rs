//! Build status channel.
//!
//! Progress lines ("STEP 2/5: RUN make") flow from the builder to a
//! consumer (CLI printer or RPC stream) over a bounded channel. The
//! producer side is closed exactly once, at the end of the build.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

/// Sending half of the build status channel.
#[derive(Clone)]
pub struct StatusSender {
    sender: Arc<Mutex<Option<mpsc::Sender<String>>>>,
    quiet: bool,
}

/// Receiving half of the build status channel.
pub struct StatusReceiver {
    receiver: mpsc::Receiver<String>,
}

/// Create a bounded status channel.
pub fn status_channel(capacity: usize) -> (StatusSender, StatusReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        StatusSender {
            sender: Arc::new(Mutex::new(Some(tx))),
            quiet: false,
        },
        StatusReceiver { receiver: rx },
    )
}

impl StatusSender {
    /// Suppress progress lines; the channel still closes normally.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Send one progress line. No-op once the channel is closed.
    pub async fn send(&self, line: impl Into<String>) {
        if self.quiet {
            return;
        }
        let tx = self.sender.lock().await.clone();
        if let Some(tx) = tx {
            // A dropped receiver only means nobody is watching.
            let _ = tx.send(line.into()).await;
        }
    }

    /// Send a warning line. Warnings are shown even in quiet mode.
    pub async fn warn(&self, line: impl Into<String>) {
        let tx = self.sender.lock().await.clone();
        if let Some(tx) = tx {
            let _ = tx.send(line.into()).await;
        }
    }

    /// Close the channel. Idempotent.
    pub async fn close(&self) {
        self.sender.lock().await.take();
    }

    /// Whether `close` has been called.
    #[cfg(test)]
    pub async fn is_closed(&self) -> bool {
        self.sender.lock().await.is_none()
    }
}

impl StatusReceiver {
    /// Receive the next line, or `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    /// Drain every line until the channel closes.
    pub async fn collect(mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = self.recv().await {
            lines.push(line);
        }
        lines
    }
}
