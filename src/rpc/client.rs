//! RPC Leader Client
//!
//! `LeaderClient` over framed TCP. One connection per request; every
//! request runs under the timeout the caller passes.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{read_frame, write_frame, Request, Response};
use crate::error::{Error, ErrorCode, Result};
use crate::job::LockId;
use crate::leader::{AddFollowerRequest, LeaderClient, LockGrant, LockRequest};

/// Leader client speaking the framed protocol
pub struct RpcLeaderClient {
    connect_timeout: Duration,
}

impl RpcLeaderClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Send a request and wait for the response
    pub async fn call(&self, endpoint: &str, request: Request, request_timeout: Duration) -> Result<Response> {
        let address = endpoint.strip_prefix("tcp://").unwrap_or(endpoint);
        tracing::trace!("Sending {} to {}", request.type_name(), address);

        let mut stream = self.connect(address).await?;
        let result = timeout(request_timeout, async {
            let (mut reader, mut writer) = stream.split();
            write_frame(&mut writer, &request).await?;
            read_frame::<Response, _>(&mut reader).await
        })
        .await;

        match result {
            Ok(Ok(Response::Error { code, message })) => Err(match code {
                ErrorCode::WrongChecksum => Error::ChecksumMismatch(message),
                code => Error::rpc(code, message),
            }),
            Ok(inner) => inner,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }
}

fn unexpected(op: &str, response: Response) -> Error {
    Error::Network(format!("unexpected response to {}: {:?}", op, response))
}

#[async_trait::async_trait]
impl LeaderClient for RpcLeaderClient {
    async fn new_lock_id(&self, endpoint: &str, database: &str, timeout: Duration) -> Result<LockId> {
        let request = Request::NewLockId { database: database.to_string() };
        match self.call(endpoint, request, timeout).await? {
            Response::LockId { id } => Ok(id),
            other => Err(unexpected("NewLockId", other)),
        }
    }

    async fn acquire_lock(&self, endpoint: &str, request: &LockRequest, timeout: Duration) -> Result<LockGrant> {
        let request = Request::AcquireLock { request: request.clone() };
        match self.call(endpoint, request, timeout).await? {
            Response::LockGranted { grant } => Ok(grant),
            Response::Ok => Ok(LockGrant::default()),
            other => Err(unexpected("AcquireLock", other)),
        }
    }

    async fn cancel_lock(
        &self,
        endpoint: &str,
        database: &str,
        lock_id: LockId,
        client_id: &str,
        timeout: Duration,
    ) -> Result<()> {
        let request = Request::CancelLock {
            database: database.to_string(),
            lock_id,
            client_id: client_id.to_string(),
        };
        match self.call(endpoint, request, timeout).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected("CancelLock", other)),
        }
    }

    async fn add_follower(&self, endpoint: &str, request: &AddFollowerRequest, timeout: Duration) -> Result<()> {
        let request = Request::AddFollower { request: request.clone() };
        match self.call(endpoint, request, timeout).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected("AddFollower", other)),
        }
    }

    async fn collection_count(&self, endpoint: &str, database: &str, shard: &str, timeout: Duration) -> Result<u64> {
        let request = Request::CollectionCount {
            database: database.to_string(),
            shard: shard.to_string(),
        };
        match self.call(endpoint, request, timeout).await? {
            Response::Count { count } => Ok(count),
            other => Err(unexpected("CollectionCount", other)),
        }
    }

    async fn recalculate_count(&self, endpoint: &str, database: &str, shard: &str, timeout: Duration) -> Result<u64> {
        let request = Request::RecalculateCount {
            database: database.to_string(),
            shard: shard.to_string(),
        };
        match self.call(endpoint, request, timeout).await? {
            Response::Count { count } => Ok(count),
            other => Err(unexpected("RecalculateCount", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Answer every request on one accepted connection with `reply`
    async fn serve_once(reply: impl Fn(Request) -> Response + Send + 'static) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = stream.split();
            let request: Request = read_frame(&mut reader).await.unwrap();
            write_frame(&mut writer, &reply(request)).await.unwrap();
        });
        address
    }

    #[tokio::test]
    async fn test_hard_lock_grant() {
        let address = serve_once(|request| match request {
            Request::AcquireLock { request } if !request.mode.is_soft() => Response::LockGranted {
                grant: LockGrant { following_term_id: Some(77), last_log_tick: Some(1234) },
            },
            _ => Response::Error { code: ErrorCode::Internal, message: "bad".into() },
        })
        .await;

        let client = RpcLeaderClient::new(Duration::from_secs(1));
        let request = LockRequest {
            database: "db".into(),
            lock_id: 9,
            collection: "s1".into(),
            ttl: Duration::from_secs(600),
            server_id: "F".into(),
            client_id: "db42s1L".into(),
            reboot_id: 1,
            mode: crate::leader::LockMode::Hard,
            want_following_term: true,
        };
        let grant = client
            .acquire_lock(&format!("tcp://{}", address), &request, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(grant.following_term().0, 77);
        assert_eq!(grant.last_log_tick, Some(1234));
    }

    #[tokio::test]
    async fn test_wrong_checksum_is_typed() {
        let address = serve_once(|_| Response::Error {
            code: ErrorCode::WrongChecksum,
            message: "leader has 100 documents".into(),
        })
        .await;

        let client = RpcLeaderClient::new(Duration::from_secs(1));
        let request = AddFollowerRequest {
            database: "db".into(),
            follower_id: "F".into(),
            shard: "s1".into(),
            checksum: 90,
            syncer_id: Default::default(),
            client_id: "db42s1L".into(),
            client_info: String::new(),
            lock_id: 9,
        };
        let err = client
            .add_follower(&address, &request, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch(_)));
    }

    #[tokio::test]
    async fn test_cancel_carries_client_id() {
        let address = serve_once(|request| match request {
            Request::CancelLock { lock_id: 9, client_id, .. } if client_id == "db42s1L" => Response::Ok,
            _ => Response::Error { code: ErrorCode::LockNotFound, message: "unknown lock".into() },
        })
        .await;

        let client = RpcLeaderClient::new(Duration::from_secs(1));
        client
            .cancel_lock(&address, "db", 9, "db42s1L", Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = RpcLeaderClient::new(Duration::from_millis(500));
        let err = client
            .collection_count(&address, "db", "s1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_connect_failure() || matches!(err, Error::ConnectionTimeout(_)));
    }
}
