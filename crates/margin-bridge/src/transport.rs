//! Message transport over native-messaging frames

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, Stdin, Stdout};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use crate::codec::NativeMessageCodec;
use crate::error::{BridgeError, Result};

/// Transport trait for host communication
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&mut self, message: Value) -> Result<()>;
    /// Next message, or `None` once the peer closed the stream
    async fn receive(&mut self) -> Result<Option<Value>>;
    async fn close(&mut self) -> Result<()>;
}

/// Framed transport over any reader/writer pair
pub struct FramedTransport<R, W> {
    reader: FramedRead<R, NativeMessageCodec>,
    writer: Option<FramedWrite<W, NativeMessageCodec>>,
}

impl<R, W> FramedTransport<R, W>
where
    R: AsyncRead + Unpin + Send + Sync,
    W: AsyncWrite + Unpin + Send + Sync,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_codec(reader, writer, NativeMessageCodec::new())
    }

    pub fn with_codec(reader: R, writer: W, codec: NativeMessageCodec) -> Self {
        Self {
            reader: FramedRead::new(reader, codec.clone()),
            writer: Some(FramedWrite::new(writer, codec)),
        }
    }
}

impl FramedTransport<Stdin, Stdout> {
    /// Bind to the process' stdin and stdout, as a native-messaging host does
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

#[async_trait]
impl<R, W> Transport for FramedTransport<R, W>
where
    R: AsyncRead + Unpin + Send + Sync,
    W: AsyncWrite + Unpin + Send + Sync,
{
    async fn send(&mut self, message: Value) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(BridgeError::Closed)?;
        writer.send(message).await
    }

    async fn receive(&mut self) -> Result<Option<Value>> {
        match self.reader.next().await {
            Some(frame) => frame.map(Some),
            None => {
                debug!("Peer closed the frame stream");
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.close().await?;
        }
        Ok(())
    }
}
