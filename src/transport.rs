//! Line transport — newline-delimited JSON framing over a byte stream.
//!
//! Frames a duplex byte stream (typically a subprocess's stdout/stdin pair)
//! as one JSON document per line. `write_frame` appends exactly one
//! newline-terminated frame and flushes immediately; `read_frame` blocks
//! until a full line arrives, an error occurs, or the stream closes. EOF is
//! sticky: once observed, every subsequent read returns EOF without
//! touching the stream.
//!
//! No length-prefixing is needed — JSON is self-terminating and the
//! protocol never embeds literal newlines inside a frame.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// One newline-framed duplex stream. Reader and writer types are erased so
/// sessions over child pipes and in-memory test streams share one type.
pub struct LineTransport {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    eof: bool,
}

impl LineTransport {
    /// Wrap a read half and a write half into a framed transport.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: BufReader::new(Box::new(reader)),
            writer: Box::new(writer),
            eof: false,
        }
    }

    /// Write one frame followed by a newline, flushing before returning so
    /// the frame reaches the peer before the next write is attempted.
    pub async fn write_frame(&mut self, frame: &str) -> std::io::Result<()> {
        debug_assert!(!frame.contains('\n'), "frame must not embed newlines");
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read one frame. `Ok(None)` signals EOF — the peer exited or closed
    /// its output — and is permanent for this transport instance.
    pub async fn read_frame(&mut self) -> std::io::Result<Option<String>> {
        if self.eof {
            return Ok(None);
        }
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            self.eof = true;
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Close the write half, signalling EOF to the peer's reader.
    pub async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}
