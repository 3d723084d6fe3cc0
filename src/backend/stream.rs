//! Terminated command/reply framing over any async byte stream.
//!
//! Serial ports and raw SCPI sockets share the same line discipline: append a write
//! termination, read until a read termination, give up after a timeout. Tests drive it with
//! `tokio::io::duplex`.

use crate::error::{DeviceError, DeviceResult};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

const READ_CHUNK: usize = 4096;

pub(crate) struct StreamTransport<S> {
    stream: S,
    /// Bytes received but not yet returned. Survives a timed-out read, so a reply split
    /// across the deadline is completed by the next read instead of losing its head.
    pending: Vec<u8>,
    write_termination: Vec<u8>,
    read_termination: Vec<u8>,
    timeout: Duration,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(
        stream: S,
        write_termination: &str,
        read_termination: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            stream,
            pending: Vec::new(),
            write_termination: write_termination.as_bytes().to_vec(),
            read_termination: read_termination.as_bytes().to_vec(),
            timeout,
        }
    }

    pub(crate) async fn write(&mut self, command: &[u8]) -> DeviceResult<()> {
        if !self.pending.is_empty() {
            // Leftover of a reply nobody waited for; it must not prefix the next one.
            debug!(bytes = self.pending.len(), "discarding unread reply bytes");
            self.pending.clear();
        }
        let mut frame = Vec::with_capacity(command.len() + self.write_termination.len());
        frame.extend_from_slice(command);
        frame.extend_from_slice(&self.write_termination);

        let port = &mut self.stream;
        let io = async {
            port.write_all(&frame).await?;
            port.flush().await
        };
        match tokio::time::timeout(self.timeout, io).await {
            Ok(Ok(())) => {
                trace!(command = %String::from_utf8_lossy(command), "wrote command");
                Ok(())
            }
            Ok(Err(e)) => Err(DeviceError::command(format!("write failed: {e}"))),
            Err(_) => Err(DeviceError::command_timeout("write", self.timeout)),
        }
    }

    pub(crate) async fn read(&mut self) -> DeviceResult<Vec<u8>> {
        let timeout = self.timeout;
        let outcome = tokio::time::timeout(timeout, self.next_frame()).await;
        match outcome {
            Ok(Ok(reply)) => {
                trace!(reply = %String::from_utf8_lossy(&reply), "read reply");
                Ok(reply)
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(DeviceError::command("connection closed by instrument"))
            }
            Ok(Err(e)) => Err(DeviceError::command(format!("read failed: {e}"))),
            Err(_) => {
                if !self.pending.is_empty() {
                    trace!(bytes = self.pending.len(), "partial reply held for next read");
                }
                Err(DeviceError::command_timeout("read", timeout))
            }
        }
    }

    /// Reads until `pending` holds a whole frame. Cancel safe: received bytes are moved into
    /// `pending` before the next await point.
    async fn next_frame(&mut self) -> std::io::Result<Vec<u8>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.take_frame() {
                return Ok(frame);
            }
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    fn take_frame(&mut self) -> Option<Vec<u8>> {
        let terminator = self.read_termination.as_slice();
        if terminator.is_empty() {
            // No framing: hand back whatever has arrived.
            return (!self.pending.is_empty()).then(|| std::mem::take(&mut self.pending));
        }
        let end = self
            .pending
            .windows(terminator.len())
            .position(|window| window == terminator)?;
        let frame = self.pending[..end].to_vec();
        self.pending.drain(..end + terminator.len());
        Some(frame)
    }

    /// Discard stale input until the line stays quiet for `window`.
    pub(crate) async fn drain(&mut self, window: Duration) -> usize {
        let mut total = self.pending.len();
        self.pending.clear();

        let mut discard = [0u8; 256];
        loop {
            match tokio::time::timeout(window, self.stream.read(&mut discard)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => total += n,
                Ok(Err(_)) | Err(_) => break,
            }
        }
        if total > 0 {
            debug!(bytes = total, "discarded stale input");
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_terminated_query_over_duplex() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut transport = StreamTransport::new(local, "\n", "\r\n", Duration::from_secs(1));

        transport.write(b":ATT?").await.unwrap();
        let mut sent = [0u8; 6];
        remote.read_exact(&mut sent).await.unwrap();
        assert_eq!(&sent, b":ATT?\n");

        remote.write_all(b"10.5\r\n").await.unwrap();
        assert_eq!(transport.read().await.unwrap(), b"10.5");
    }

    #[tokio::test]
    async fn test_lone_terminator_byte_is_kept() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut transport = StreamTransport::new(local, "\n", "\r\n", Duration::from_secs(1));
        remote.write_all(b"a\nb\r\n").await.unwrap();
        assert_eq!(transport.read().await.unwrap(), b"a\nb");
    }

    #[tokio::test]
    async fn test_read_timeout_is_flagged() {
        let (local, _remote) = tokio::io::duplex(64);
        let mut transport = StreamTransport::new(local, "\n", "\n", Duration::from_millis(20));
        let err = transport.read().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_closed_peer_is_command_error() {
        let (local, remote) = tokio::io::duplex(64);
        drop(remote);
        let mut transport = StreamTransport::new(local, "\n", "\n", Duration::from_secs(1));
        let err = transport.read().await.unwrap_err();
        assert!(matches!(err, DeviceError::Command { timed_out: false, .. }));
    }

    #[tokio::test]
    async fn test_drain_discards_pending_bytes() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut transport = StreamTransport::new(local, "\n", "\n", Duration::from_secs(1));
        remote.write_all(b"stale garbage").await.unwrap();
        let discarded = transport.drain(Duration::from_millis(20)).await;
        assert_eq!(discarded, 13);

        remote.write_all(b"fresh\n").await.unwrap();
        assert_eq!(transport.read().await.unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_reply_split_across_timeout_is_reassembled() {
        let (local, mut remote) = tokio::io::duplex(256);
        let mut transport = StreamTransport::new(local, "\n", "\n", Duration::from_millis(30));

        remote.write_all(b"$GPGGA,123519,4807.038").await.unwrap();
        let err = transport.read().await.unwrap_err();
        assert!(err.is_timeout());

        remote.write_all(b",N,01131.000,E*47\n$GPZDA").await.unwrap();
        assert_eq!(
            transport.read().await.unwrap(),
            b"$GPGGA,123519,4807.038,N,01131.000,E*47"
        );

        remote.write_all(b",201530.00*6B\n").await.unwrap();
        assert_eq!(transport.read().await.unwrap(), b"$GPZDA,201530.00*6B");
    }

    #[tokio::test]
    async fn test_drain_drops_partial_reply() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut transport = StreamTransport::new(local, "\n", "\n", Duration::from_millis(20));
        remote.write_all(b"half").await.unwrap();
        assert!(transport.read().await.unwrap_err().is_timeout());

        assert_eq!(transport.drain(Duration::from_millis(20)).await, 4);
        remote.write_all(b"whole\n").await.unwrap();
        assert_eq!(transport.read().await.unwrap(), b"whole");
    }

    #[tokio::test]
    async fn test_new_command_drops_stale_partial_reply() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut transport = StreamTransport::new(local, "\n", "\n", Duration::from_millis(20));
        remote.write_all(b"12.").await.unwrap();
        assert!(transport.read().await.unwrap_err().is_timeout());

        transport.write(b":ATT?").await.unwrap();
        remote.write_all(b"7.5\n").await.unwrap();
        assert_eq!(transport.read().await.unwrap(), b"7.5");
    }
}
