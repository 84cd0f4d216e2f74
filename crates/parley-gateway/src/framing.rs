use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

/// Upper bound on a single frame; a peer exceeding it is dropped.
const MAX_FRAME_LEN: usize = 64 * 1024;

/// Read side of the framing codec: yields one whitespace-trimmed text frame
/// per newline-delimited line.
pub struct FrameReader<R> {
    inner: FramedRead<R, LinesCodec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(read: R) -> Self {
        Self {
            inner: FramedRead::new(read, LinesCodec::new_with_max_length(MAX_FRAME_LEN)),
        }
    }

    /// The next complete frame, or `None` once the peer closed the stream.
    pub async fn next_frame(&mut self) -> Result<Option<String>, LinesCodecError> {
        match self.inner.next().await {
            Some(Ok(line)) => Ok(Some(line.trim().to_string())),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// Write side of the framing codec. Owned by a single writer task per
/// connection, which is what serializes concurrent sends to one peer.
pub struct FrameWriter<W> {
    inner: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(write: W) -> Self {
        Self {
            inner: BufWriter::new(write),
        }
    }

    /// Write one frame with its line terminator and flush, so partial
    /// frames are never left sitting in the buffer between sends.
    pub async fn write_frame(&mut self, frame: &str) -> std::io::Result<()> {
        self.inner.write_all(frame.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await
    }

    pub async fn close(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_with_trimming() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, client_write) = tokio::io::split(client);

        let mut writer = FrameWriter::new(client_write);
        let mut reader = FrameReader::new(server_read);

        writer.write_frame("  {\"type\":\"7ekey\"}  ").await.unwrap();
        writer.write_frame("second").await.unwrap();

        assert_eq!(
            reader.next_frame().await.unwrap().as_deref(),
            Some("{\"type\":\"7ekey\"}")
        );
        assert_eq!(reader.next_frame().await.unwrap().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn eof_yields_none() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, client_write) = tokio::io::split(client);

        let mut writer = FrameWriter::new(client_write);
        writer.write_frame("last").await.unwrap();
        writer.close().await.unwrap();
        drop(writer);
        drop(_client_read);

        let mut reader = FrameReader::new(server_read);
        assert_eq!(reader.next_frame().await.unwrap().as_deref(), Some("last"));
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }
}
