//! Rewindable stream adapter for replaying consumed bytes.
//!
//! `RewindStream` captures everything read from the inner stream until
//! buffering is stopped. Calling [`RewindStream::rewind`] repositions the
//! read cursor to the first byte ever read, so a later consumer observes the
//! exact original byte sequence. This is what lets a failed authentication
//! be handed to an HTTP backend as if no bytes had been consumed.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream wrapper that can replay its captured read prefix.
///
/// Three modes:
/// - *buffering* (default): reads pass through and are appended to the
///   capture buffer;
/// - *stopped*: reads pass through uncaptured; already-captured bytes stay
///   available for replay;
/// - *rewound*: reads are served from the capture buffer until it is
///   exhausted, then pass through again.
///
/// Writes are always pass-through.
pub struct RewindStream<S> {
    inner: S,
    captured: Vec<u8>,
    // Replay cursor. Equal to `captured.len()` when not replaying.
    pos: usize,
    buffering: bool,
}

impl<S> RewindStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            captured: Vec::new(),
            pos: 0,
            buffering: true,
        }
    }

    /// Pre-size the capture buffer.
    pub fn set_buffer_size(&mut self, n: usize) {
        self.captured.reserve(n);
    }

    /// Reposition the read cursor to offset zero of the captured prefix.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Disable further capture. Already-captured bytes remain replayable.
    pub fn stop_buffering(&mut self) {
        self.buffering = false;
    }

    /// Whether reads are still being captured.
    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    /// Number of bytes captured so far.
    pub fn captured_len(&self) -> usize {
        self.captured.len()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = &mut *self;

        // Serve the replay region first.
        if this.pos < this.captured.len() {
            let remaining = &this.captured[this.pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            this.pos += to_copy;
            return Poll::Ready(Ok(()));
        }

        let filled_before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if this.buffering {
                    let fresh = &buf.filled()[filled_before..];
                    this.captured.extend_from_slice(fresh);
                    this.pos = this.captured.len();
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
