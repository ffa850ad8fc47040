//! One-shot client: connect, send one frame, read one frame, close.

use crate::error::ClientError;
use crate::protocols::echo::parser::{self, FrameDecodeResult, HEADER_LEN};
use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Read buffer growth step
const READ_CHUNK: usize = 4096;

/// Connect to `addr`, send `payload` as one frame and return the payload of
/// the single frame sent back. The whole exchange is bounded by `timeout`.
pub async fn send(
    addr: &str,
    payload: &[u8],
    max_frame_size: usize,
    timeout: Duration,
) -> Result<Bytes, ClientError> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(addr, len = payload.len(), "Sending frame");

        let response = request(&mut stream, payload, max_frame_size).await?;
        stream.shutdown().await?;
        Ok::<_, ClientError>(response)
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ClientError::Timeout)?
}

/// Write one framed request to `stream` and read one framed response.
pub async fn request<S>(stream: &mut S, payload: &[u8], max_frame_size: usize) -> Result<Bytes, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut out = BytesMut::new();
    parser::encode_into(payload, max_frame_size, &mut out)?;

    stream.write_all(&out).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    read_frame(stream, &mut buf, max_frame_size).await
}

/// Read exactly one frame, however the bytes are split across reads.
///
/// `buf` carries bytes read past the end of the frame into the next call, so
/// a caller reading several frames from one stream must reuse it.
pub async fn read_frame<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    max_frame_size: usize,
) -> Result<Bytes, ClientError>
where
    S: AsyncRead + Unpin,
{
    loop {
        match parser::decode(buf, max_frame_size) {
            FrameDecodeResult::Frame { consumed, .. } => {
                let mut frame = buf.split_to(consumed);
                frame.advance(HEADER_LEN);
                return Ok(frame.freeze());
            }
            FrameDecodeResult::Invalid(invalid) => return Err(invalid.into()),
            FrameDecodeResult::Incomplete => {}
        }

        buf.reserve(READ_CHUNK);
        if stream.read_buf(buf).await? == 0 {
            return Err(ClientError::UnexpectedEof);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    const MAX: usize = 1024;

    #[tokio::test]
    async fn test_request_ping() {
        let mut mock = Builder::new()
            .write(b"\x00\x00\x00\x04ping")
            .read(b"\x00\x00\x00\x04ping")
            .build();

        let reply = request(&mut mock, b"ping", MAX).await.unwrap();
        assert_eq!(&reply[..], b"ping");
    }

    #[tokio::test]
    async fn test_response_split_across_reads() {
        let mut mock = Builder::new()
            .write(b"\x00\x00\x00\x05hello")
            .read(b"\x00\x00")
            .read(b"\x00\x05he")
            .read(b"llo")
            .build();

        let reply = request(&mut mock, b"hello", MAX).await.unwrap();
        assert_eq!(&reply[..], b"hello");
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let mut mock = Builder::new()
            .write(b"\x00\x00\x00\x00")
            .read(b"\x00\x00\x00\x00")
            .build();

        let reply = request(&mut mock, b"", MAX).await.unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn test_eof_mid_frame() {
        let mut mock = Builder::new().read(b"\x00\x00\x00\x04pi").build();

        let err = read_frame(&mut mock, &mut BytesMut::new(), MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_oversized_response_rejected() {
        let mut mock = Builder::new().read(&[0x00, 0x10, 0x00, 0x00]).build();

        let err = read_frame(&mut mock, &mut BytesMut::new(), MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_two_frames_in_one_read() {
        let mut mock = Builder::new()
            .read(b"\x00\x00\x00\x01a\x00\x00\x00\x02bb")
            .build();
        let mut buf = BytesMut::new();

        let first = read_frame(&mut mock, &mut buf, MAX).await.unwrap();
        assert_eq!(&first[..], b"a");
        let second = read_frame(&mut mock, &mut buf, MAX).await.unwrap();
        assert_eq!(&second[..], b"bb");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_request_not_sent() {
        // No actions: any write would fail the mock.
        let mut mock = Builder::new().build();

        let err = request(&mut mock, &[0u8; MAX + 1], MAX).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Frame(crate::error::FrameError::PayloadTooLarge { .. })
        ));
    }
}
