//! [`LinkReader`] / [`LinkWriter`] over any tokio byte stream.
//!
//! Used by the TCP acceptor, and by tests with `tokio::io::duplex`.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Incoming, LinkReader, LinkWriter, TransportError};

/// Read buffer size per link. Radio links never come close.
const READ_BUF_SIZE: usize = 4096;

/// Reading half backed by an `AsyncRead`.
#[derive(Debug)]
pub struct StreamReader<R> {
    inner: R,
    buf: Box<[u8]>,
}

/// Writing half backed by an `AsyncWrite`.
#[derive(Debug)]
pub struct StreamWriter<W> {
    inner: W,
}

/// Constructors for stream-backed links.
#[derive(Debug)]
pub struct StreamLink;

impl StreamLink {
    /// Wrap separate read and write halves.
    pub fn new<R, W>(reader: R, writer: W) -> (StreamReader<R>, StreamWriter<W>)
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        (
            StreamReader {
                inner: reader,
                buf: vec![0u8; READ_BUF_SIZE].into_boxed_slice(),
            },
            StreamWriter { inner: writer },
        )
    }

    /// Build an [`Incoming`] from a bidirectional stream.
    pub fn incoming<S>(identity: impl Into<String>, stream: S) -> Incoming
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (reader, writer) = Self::new(read_half, write_half);
        Incoming {
            identity: identity.into(),
            supersedes: false,
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

#[async_trait]
impl<R> LinkReader for StreamReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read(&mut self) -> Result<Option<Bytes>, TransportError> {
        let n = self.inner.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&self.buf[..n])))
    }
}

#[async_trait]
impl<W> LinkWriter for StreamWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}
