use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{messages::ChannelId, transform::DataTransform};
use crate::{GridError, GridResult};

/// 默认的最大帧长度
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// 发送通道标识（不经过数据变换）
pub async fn write_channel_id<W: AsyncWrite + Unpin>(writer: &mut W, id: ChannelId) -> GridResult<()> {
    writer.write_u32(id.as_u32()).await?;
    writer.flush().await?;
    Ok(())
}

/// 读取通道标识
pub async fn read_channel_id<R: AsyncRead + Unpin>(reader: &mut R) -> GridResult<ChannelId> {
    let raw = reader.read_u32().await.map_err(map_eof)?;
    ChannelId::try_from(raw).map_err(|v| GridError::protocol(format!("未知的通道标识: {v:#x}")))
}

fn map_eof(e: std::io::Error) -> GridError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        GridError::ConnectionClosed
    } else {
        GridError::Io(e)
    }
}

/// 读取长度前缀帧
pub struct FramedReader<R> {
    inner: R,
    transform: Arc<dyn DataTransform>,
    max_frame_size: usize,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R, transform: Arc<dyn DataTransform>) -> Self {
        Self {
            inner,
            transform,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            bytes_read: 0,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// 读取一帧并还原
    ///
    /// 对端在帧边界关闭连接时返回 [`GridError::ConnectionClosed`]。
    pub async fn read_frame(&mut self) -> GridResult<Vec<u8>> {
        let len = self.inner.read_u32().await.map_err(map_eof)? as usize;
        if len > self.max_frame_size {
            return Err(GridError::protocol(format!(
                "帧长度 {} 超过上限 {}",
                len, self.max_frame_size
            )));
        }
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await.map_err(map_eof)?;
        self.bytes_read += 4 + len as u64;
        self.transform.unwrap(buf)
    }

    /// 读取一帧 JSON 消息
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> GridResult<T> {
        let frame = self.read_frame().await?;
        serde_json::from_slice(&frame).map_err(|e| GridError::protocol(format!("无效的消息: {e}")))
    }

    /// 返回上次调用以来读取的字节数并清零
    pub fn take_bytes_read(&mut self) -> u64 {
        std::mem::take(&mut self.bytes_read)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// 写入长度前缀帧
pub struct FramedWriter<W> {
    inner: W,
    transform: Arc<dyn DataTransform>,
    bytes_written: u64,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(inner: W, transform: Arc<dyn DataTransform>) -> Self {
        Self {
            inner,
            transform,
            bytes_written: 0,
        }
    }

    pub async fn write_frame(&mut self, data: &[u8]) -> GridResult<()> {
        let wrapped = self.transform.wrap(data.to_vec())?;
        let len = u32::try_from(wrapped.len())
            .map_err(|_| GridError::protocol(format!("帧过大: {} 字节", wrapped.len())))?;
        self.inner.write_u32(len).await?;
        self.inner.write_all(&wrapped).await?;
        self.bytes_written += 4 + wrapped.len() as u64;
        Ok(())
    }

    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> GridResult<()> {
        let bytes = serde_json::to_vec(message)?;
        self.write_frame(&bytes).await
    }

    pub async fn flush(&mut self) -> GridResult<()> {
        self.inner.flush().await?;
        Ok(())
    }

    /// 返回上次调用以来写出的字节数并清零
    pub fn take_bytes_written(&mut self) -> u64 {
        std::mem::take(&mut self.bytes_written)
    }

    pub async fn shutdown(&mut self) -> GridResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{IdentityTransform, JobHeader, MockDataTransform, RequestType};

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FramedWriter::new(client, Arc::new(IdentityTransform));
        let mut reader = FramedReader::new(server, Arc::new(IdentityTransform));

        let header = JobHeader::request(RequestType::Statistics, "r1", "app");
        writer.write_message(&header).await.unwrap();
        writer.write_frame(b"payload").await.unwrap();
        writer.flush().await.unwrap();

        let decoded: JobHeader = reader.read_message().await.unwrap();
        assert_eq!(decoded, header);
        assert_eq!(reader.read_frame().await.unwrap(), b"payload");
        assert_eq!(reader.take_bytes_read(), writer.take_bytes_written());
        assert_eq!(reader.take_bytes_read(), 0);
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = FramedReader::new(server, Arc::new(IdentityTransform));
        assert!(matches!(reader.read_frame().await, Err(GridError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_protocol_error() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_u32(10_000).await.unwrap();
        let mut reader = FramedReader::new(server, Arc::new(IdentityTransform)).with_max_frame_size(100);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, GridError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_transform_applied_to_every_frame() {
        let mut mock = MockDataTransform::new();
        mock.expect_wrap()
            .times(2)
            .returning(|data| Ok(data.into_iter().map(|b| b ^ 0x5a).collect()));
        mock.expect_unwrap()
            .times(2)
            .returning(|data| Ok(data.into_iter().map(|b| b ^ 0x5a).collect()));
        let transform: Arc<dyn DataTransform> = Arc::new(mock);

        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FramedWriter::new(client, transform.clone());
        let mut reader = FramedReader::new(server, transform);

        writer.write_frame(b"abc").await.unwrap();
        writer.write_frame(b"").await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(reader.read_frame().await.unwrap(), b"abc");
        assert!(reader.read_frame().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_channel_id() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_channel_id(&mut client, ChannelId::ClientJobData).await.unwrap();
        assert_eq!(read_channel_id(&mut server).await.unwrap(), ChannelId::ClientJobData);

        client.write_u32(42).await.unwrap();
        assert!(read_channel_id(&mut server).await.is_err());
    }
}
