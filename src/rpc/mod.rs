//! RPC Module
//!
//! Framed transport for talking to a shard leader: an 8-byte header
//! (length, crc32) followed by a bincode body.

mod client;
pub mod protocol;

pub use client::RpcLeaderClient;
pub use protocol::{FrameHeader, Request, Response};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Read a framed message from a reader
pub async fn read_frame<T, R>(reader: &mut R) -> Result<T>
where
    T: DeserializeOwned,
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Network(format!("Frame too large: {} bytes", header.length)));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    Ok(bincode::deserialize(&body)?)
}

/// Write a framed message to a writer
pub async fn write_frame<T, W>(writer: &mut W, message: &T) -> Result<()>
where
    T: Serialize,
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let body = bincode::serialize(message)?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_frame_over_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &Response::Count { count: 90 }).await.unwrap();

        match read_frame::<Response, _>(&mut b).await.unwrap() {
            Response::Count { count } => assert_eq!(count, 90),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_corrupted_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let body = bincode::serialize(&Response::Ok).unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 0xdead_beef;
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        let err = read_frame::<Response, _>(&mut b).await.unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }
}
