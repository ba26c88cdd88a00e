use std::io;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

/// Snapshot of a download in progress, broadcast to readers after every
/// committed write. After `done` is raised, `written` is frozen at its
/// final value.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Progress {
    pub written: u64,
    pub done: bool,
}

/// Write sink over the tempfile that publishes the committed byte count to
/// any number of concurrent readers. Sending progress never blocks: a slow
/// reader simply observes a later, larger value on its next wait.
pub(crate) struct TrackingWriter {
    file: File,
    written: u64,
    progress: watch::Sender<Progress>,
}

impl TrackingWriter {
    pub(crate) fn new(file: File) -> (Self, watch::Receiver<Progress>) {
        let (progress, subscription) = watch::channel(Progress {
            written: 0,
            done: false,
        });
        (
            Self {
                file,
                written: 0,
                progress,
            },
            subscription,
        )
    }

    /// Commit a chunk to the tempfile, then broadcast the new byte count.
    pub(crate) async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        self.progress.send_replace(Progress {
            written: self.written,
            done: false,
        });
        Ok(())
    }

    /// Flush and close the underlying file and raise the done signal.
    /// Returns the final committed byte count; the signal fires whether or
    /// not the flush succeeds, so parked readers always wake.
    pub(crate) async fn close(self) -> (u64, io::Result<()>) {
        let TrackingWriter {
            mut file,
            written,
            progress,
        } = self;
        let flushed = file.flush().await;
        drop(file);
        progress.send_replace(Progress { written, done: true });
        (written, flushed)
    }
}
