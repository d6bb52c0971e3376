use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{Grant, TokenBucket};

type GrantFuture = Pin<Box<dyn Future<Output = Grant> + Send>>;

/// An [`AsyncWrite`] wrapper that debits a data bucket before letting bytes
/// flow downstream.
///
/// When the bucket runs dry the writer returns `Pending` until its next
/// grant arrives, which stalls the sender instead of buffering. Reads pass
/// through untouched, so a whole connection stream can be wrapped. Without a
/// bucket the wrapper is a transparent passthrough.
#[pin_project]
pub struct RateLimitedWriter<W> {
    #[pin]
    inner: W,
    bucket: Option<Arc<TokenBucket>>,
    credit: u64,
    pending: Option<GrantFuture>,
}

impl<W> RateLimitedWriter<W> {
    pub(crate) fn new(inner: W, bucket: Option<Arc<TokenBucket>>) -> Self {
        Self {
            inner,
            bucket,
            credit: 0,
            pending: None,
        }
    }

    /// The wrapped stream.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W> AsyncWrite for RateLimitedWriter<W>
where
    W: AsyncWrite,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        let Some(bucket) = this.bucket else {
            return this.inner.poll_write(cx, buf);
        };
        if buf.is_empty() {
            return this.inner.poll_write(cx, buf);
        }

        loop {
            if *this.credit > 0 {
                let limit = (*this.credit).min(buf.len() as u64) as usize;
                let written = ready!(this.inner.as_mut().poll_write(cx, &buf[..limit]))?;
                *this.credit -= written as u64;
                return Poll::Ready(Ok(written));
            }

            let pending = this.pending.get_or_insert_with(|| {
                let bucket = Arc::clone(bucket);
                let want = buf.len() as u64;
                Box::pin(async move { bucket.acquire_up_to(want).await })
            });
            let grant = ready!(pending.as_mut().poll(cx));
            *this.pending = None;
            if grant.granted == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "data rate limiter stopped",
                )));
            }
            *this.credit = grant.granted;
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

impl<W> AsyncRead for RateLimitedWriter<W>
where
    W: AsyncRead,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}
