//! Bidirectional byte-stream splicing with an idle timeout.
//!
//! Used by the redirector to join a client stream to the fallback HTTP
//! backend, and by downstream consumers to join authenticated streams to
//! their targets. Half-close is propagated: EOF on one side shuts down the
//! write half of the other.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, Instant};

/// Bytes transferred in each direction during a splice.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpliceStats {
    /// Bytes from `a` to `b`.
    pub a_to_b: u64,
    /// Bytes from `b` to `a`.
    pub b_to_a: u64,
}

impl SpliceStats {
    /// Total bytes transferred in both directions.
    pub fn total(self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

/// Copy bytes between `a` and `b` until both directions reach EOF, an I/O
/// error occurs, or neither direction transfers data for `idle_timeout`.
pub async fn splice_bidirectional<A, B>(
    a: A,
    b: B,
    idle_timeout: Duration,
    buffer_size: usize,
) -> io::Result<SpliceStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_rd, mut a_wr) = tokio::io::split(a);
    let (mut b_rd, mut b_wr) = tokio::io::split(b);

    let mut buf_a = vec![0u8; buffer_size];
    let mut buf_b = vec![0u8; buffer_size];
    let mut a_open = true;
    let mut b_open = true;
    let mut stats = SpliceStats::default();

    let idle = sleep(idle_timeout);
    tokio::pin!(idle);

    while a_open || b_open {
        tokio::select! {
            res = a_rd.read(&mut buf_a), if a_open => {
                match res? {
                    0 => {
                        a_open = false;
                        let _ = b_wr.shutdown().await;
                    }
                    n => {
                        b_wr.write_all(&buf_a[..n]).await?;
                        b_wr.flush().await?;
                        stats.a_to_b += n as u64;
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                    }
                }
            }
            res = b_rd.read(&mut buf_b), if b_open => {
                match res? {
                    0 => {
                        b_open = false;
                        let _ = a_wr.shutdown().await;
                    }
                    n => {
                        a_wr.write_all(&buf_b[..n]).await?;
                        a_wr.flush().await?;
                        stats.b_to_a += n as u64;
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                    }
                }
            }
            _ = &mut idle => break,
        }
    }

    Ok(stats)
}
