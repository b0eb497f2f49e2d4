use pin_project::pin_project;
use sha2::{Digest, Sha256};
use std::{
    io,
    path::Path,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::AsyncWrite;

/// An [AsyncWrite] adapter that hashes everything written through it
#[pin_project]
#[derive(Debug)]
pub struct DigestWriter<W> {
    #[pin]
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: AsyncWrite> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        DigestWriter {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Number of bytes accepted by the inner writer so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Lowercase hex sha256 of everything accepted by the inner writer
    pub fn finalize_hex(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

impl<W: AsyncWrite> AsyncWrite for DigestWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.inner.poll_write(cx, buf) {
            Poll::Ready(Ok(actual_size)) => {
                // only the bytes the inner writer took count toward the digest
                this.hasher.update(&buf[..actual_size]);
                *this.written += actual_size as u64;
                Poll::Ready(Ok(actual_size))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Stream a file through sha256 without loading it into memory
pub async fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut writer = DigestWriter::new(tokio::io::sink());
    let size = tokio::io::copy(&mut file, &mut writer).await?;
    log::debug!("hashed {} bytes of {:?}", size, path);
    Ok(writer.finalize_hex())
}
