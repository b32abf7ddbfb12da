//! Stream wrapper that counts and fingerprints the bytes flowing through it.
//!
//! Uploads stream file content straight from disk, so the fingerprint taken
//! before the transfer can go stale. When an expected fingerprint is given,
//! the wrapper ends the stream with an error instead of a clean end-of-stream
//! if the bytes did not match. Stores treat that error like any other body
//! failure and keep nothing.

use bytes::Bytes;
use futures_util::Stream;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

#[derive(Debug, Default)]
struct Shared {
    bytes: AtomicU64,
    mismatched: AtomicBool,
}

/// Caller-side view of a [`DigestStream`], readable after the stream is consumed.
#[derive(Debug, Clone, Default)]
pub struct DigestCheck {
    shared: Arc<Shared>,
}

impl DigestCheck {
    pub fn bytes(&self) -> u64 {
        self.shared.bytes.load(Ordering::Acquire)
    }

    /// The stream ended with content other than the expected fingerprint.
    pub fn mismatched(&self) -> bool {
        self.shared.mismatched.load(Ordering::Acquire)
    }
}

pub struct DigestStream<S> {
    inner: S,
    context: Option<md5::Context>,
    expected: Option<String>,
    shared: Arc<Shared>,
}

impl<S> DigestStream<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    /// Wrap `inner`. With `expected` set, a content mismatch fails the stream.
    pub fn new(inner: S, expected: Option<String>) -> (Self, DigestCheck) {
        let check = DigestCheck::default();
        let stream = Self {
            inner,
            context: expected.as_ref().map(|_| md5::Context::new()),
            expected,
            shared: Arc::clone(&check.shared),
        };
        (stream, check)
    }
}

impl<S> Stream for DigestStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.shared.bytes.fetch_add(bytes.len() as u64, Ordering::AcqRel);
                if let Some(context) = self.context.as_mut() {
                    context.consume(&bytes);
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                // Checked once; later polls just report the end.
                let Some(context) = self.context.take() else {
                    return Poll::Ready(None);
                };
                let actual = format!("{:x}", context.compute());
                match self.expected.as_deref() {
                    Some(expected) if expected != actual => {
                        self.shared.mismatched.store(true, Ordering::Release);
                        Poll::Ready(Some(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("content fingerprint {} does not match {}", actual, expected),
                        ))))
                    }
                    _ => Poll::Ready(None),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
