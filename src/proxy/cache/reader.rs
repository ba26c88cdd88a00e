use std::io::{self, SeekFrom};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;

use super::writer::Progress;

/// Seekable reader over a file whose writer may still be running.
///
/// Reads never cross the ready boundary published by the tracking writer: a
/// reader that catches up to the writer parks until either more bytes are
/// committed or the writer raises done. End-of-stream is reported at the
/// declared size, or at the final committed count when the download fell
/// short.
#[derive(Debug)]
pub(crate) struct PartialReader {
    file: File,
    size: u64,
    pos: u64,
    ready_pos: u64,
    seek_before_read: bool,
    progress: watch::Receiver<Progress>,
}

impl PartialReader {
    pub(crate) fn new(file: File, size: u64, progress: watch::Receiver<Progress>) -> Self {
        Self {
            file,
            size,
            pos: 0,
            ready_pos: 0,
            seek_before_read: false,
            progress,
        }
    }

    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.size {
            return Ok(0);
        }
        loop {
            let latest = *self.progress.borrow_and_update();
            self.ready_pos = latest.written;
            if self.pos < self.ready_pos {
                break;
            }
            if latest.done {
                // Writer finished below the declared size; the stream ends
                // at the last committed byte.
                return Ok(0);
            }
            if self.progress.changed().await.is_err() {
                // Writer dropped without closing; whatever was committed is
                // all there will ever be.
                self.ready_pos = self.progress.borrow().written;
                if self.pos >= self.ready_pos {
                    return Ok(0);
                }
                break;
            }
        }
        if self.seek_before_read {
            self.file.seek(SeekFrom::Start(self.pos)).await?;
            self.seek_before_read = false;
        }
        let limit = (self.ready_pos - self.pos).min(buf.len() as u64) as usize;
        let read = self.file.read(&mut buf[..limit]).await?;
        self.pos += read as u64;
        Ok(read)
    }

    pub(crate) fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = resolve_seek(pos, self.pos, self.size)?;
        self.pos = target;
        self.seek_before_read = true;
        Ok(target)
    }
}

/// Reader over a fully downloaded cache file. Same read/seek contract as
/// `PartialReader` with the ready boundary pinned at the file size.
#[derive(Debug)]
pub(crate) struct CompleteReader {
    file: File,
    size: u64,
    pos: u64,
    seek_before_read: bool,
}

impl CompleteReader {
    pub(crate) fn new(file: File, size: u64) -> Self {
        Self {
            file,
            size,
            pos: 0,
            seek_before_read: false,
        }
    }

    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.size {
            return Ok(0);
        }
        if self.seek_before_read {
            self.file.seek(SeekFrom::Start(self.pos)).await?;
            self.seek_before_read = false;
        }
        let limit = (self.size - self.pos).min(buf.len() as u64) as usize;
        let read = self.file.read(&mut buf[..limit]).await?;
        self.pos += read as u64;
        Ok(read)
    }

    pub(crate) fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = resolve_seek(pos, self.pos, self.size)?;
        self.pos = target;
        self.seek_before_read = true;
        Ok(target)
    }
}

/// The reader handed to the serve routine: either a stream over an
/// in-flight download or a completed cache file.
#[derive(Debug)]
pub(crate) enum ObjectReader {
    Streaming(PartialReader),
    Complete(CompleteReader),
}

impl ObjectReader {
    pub(crate) fn size(&self) -> u64 {
        match self {
            ObjectReader::Streaming(reader) => reader.size,
            ObjectReader::Complete(reader) => reader.size,
        }
    }

    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ObjectReader::Streaming(reader) => reader.read(buf).await,
            ObjectReader::Complete(reader) => reader.read(buf).await,
        }
    }

    pub(crate) fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            ObjectReader::Streaming(reader) => reader.seek(pos),
            ObjectReader::Complete(reader) => reader.seek(pos),
        }
    }
}

/// `SeekEnd` resolves against the declared size, not the ready boundary, so
/// range helpers can probe end-of-file without waiting on the writer.
/// Seeking past the size is allowed; the next read reports end-of-stream.
fn resolve_seek(pos: SeekFrom, current: u64, size: u64) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(offset) => offset as i128,
        SeekFrom::Current(delta) => current as i128 + delta as i128,
        SeekFrom::End(delta) => size as i128 + delta as i128,
    };
    if target < 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("seek position {target} < 0"),
        ));
    }
    Ok(target as u64)
}
