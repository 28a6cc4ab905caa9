//! Convert between native-messaging frames and JSON lines

use anyhow::Context;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use margin_bridge::{FramedTransport, Transport};

/// Read frames from `input` and write one JSON document per line
pub async fn decode<R, W>(input: R, mut output: W) -> anyhow::Result<usize>
where
    R: AsyncRead + Unpin + Send + Sync,
    W: AsyncWrite + Unpin,
{
    let mut transport = FramedTransport::new(input, tokio::io::sink());
    let mut count = 0;
    while let Some(message) = transport.receive().await? {
        let line = serde_json::to_string(&message)?;
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
        count += 1;
    }
    output.flush().await?;
    Ok(count)
}

/// Read JSON lines from `input` and write each as a frame; blank lines are skipped
pub async fn encode<R, W>(input: R, output: W) -> anyhow::Result<usize>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + Sync,
{
    let mut transport = FramedTransport::new(tokio::io::empty(), output);
    let mut lines = BufReader::new(input).lines();
    let mut line_number = 0;
    let mut count = 0;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line)
            .with_context(|| format!("Line {} is not valid JSON", line_number))?;
        transport.send(value).await?;
        count += 1;
    }
    transport.close().await?;
    Ok(count)
}
