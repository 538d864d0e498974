//! A single socket to a server node

use crate::auth::{Authenticator, Credentials, SessionInfo};
use crate::error::{Error, Result};
use crate::policy::ClientPolicy;
use aerie_protocol::{info, Host};
use bytes::BytesMut;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// One leased socket plus its reusable buffer.
///
/// Held by exactly one caller at a time; goes back to the node pool or gets closed.
/// Any I/O failure closes the socket.
pub struct Connection {
    stream: Option<TcpStream>,
    host: Host,
    buffer: BytesMut,
    socket_timeout: Option<Duration>,
    idle_timeout: Duration,
    idle_deadline: Instant,
}

impl Connection {
    /// Open a connection within `timeout`
    pub async fn connect(host: &Host, timeout: Duration, idle_timeout: Duration) -> Result<Self> {
        let stream = timed(Some(timeout), TcpStream::connect(host.address()))
            .await
            .map_err(|e| e.with_node(host))?;
        stream.set_nodelay(true)?;

        debug!("Connected to {}", host);

        Ok(Self {
            stream: Some(stream),
            host: host.clone(),
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            socket_timeout: Some(timeout),
            idle_timeout,
            idle_deadline: Instant::now() + idle_timeout,
        })
    }

    /// Host this connection was opened to
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Deadline applied to every read and write (`None` disables it)
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.socket_timeout = timeout.filter(|t| !t.is_zero());
    }

    /// Reusable byte buffer
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Unused for longer than the idle timeout
    pub fn is_idle(&self) -> bool {
        !self.idle_timeout.is_zero() && Instant::now() >= self.idle_deadline
    }

    /// Push the idle deadline out after the connection was used
    pub fn refresh(&mut self) {
        self.idle_deadline = Instant::now() + self.idle_timeout;
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closed connection to {}", self.host);
        }
    }

    /// Write the whole buffer
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let timeout = self.socket_timeout;
        let result = match self.stream.as_mut() {
            Some(stream) => timed(timeout, stream.write_all(data)).await,
            None => Err(not_connected()),
        };
        self.close_on_error(result)
    }

    /// Fill `buf` completely
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let timeout = self.socket_timeout;
        let result = match self.stream.as_mut() {
            Some(stream) => timed(timeout, stream.read_exact(buf)).await.map(|_| ()),
            None => Err(not_connected()),
        };
        self.close_on_error(result)
    }

    /// Send an info request and return the raw response body
    pub async fn request_info_raw<S: AsRef<str>>(&mut self, names: &[S]) -> Result<String> {
        let mut buf = std::mem::take(&mut self.buffer);
        info::encode_request(names, &mut buf);
        let written = self.write(&buf).await;
        self.buffer = buf;
        written?;

        let mut header = [0u8; info::HEADER_SIZE];
        self.read(&mut header).await?;
        let len = match info::decode_header(&header) {
            Ok(len) => len,
            Err(e) => {
                self.close();
                return Err(e.into());
            }
        };

        let mut body = std::mem::take(&mut self.buffer);
        body.clear();
        body.resize(len, 0);
        let read = self.read(&mut body).await;
        let text = read.and_then(|_| Ok(info::body_to_str(&body)?.to_string()));
        self.buffer = body;
        self.refresh();
        text
    }

    /// Send an info request and return the response as a name → value map
    pub async fn request_info<S: AsRef<str>>(
        &mut self,
        names: &[S],
    ) -> Result<HashMap<String, String>> {
        let body = self.request_info_raw(names).await?;
        Ok(info::parse_response(&body))
    }

    fn close_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.close();
        }
        result.map_err(|e| e.with_node(&self.host))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Opens connections and logs them in when the cluster requires it
#[derive(Clone)]
pub struct Connector {
    policy: Arc<ClientPolicy>,
    credentials: Option<Credentials>,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl Connector {
    pub fn new(policy: Arc<ClientPolicy>, authenticator: Option<Arc<dyn Authenticator>>) -> Self {
        Self {
            credentials: policy.credentials(),
            policy,
            authenticator,
        }
    }

    pub fn policy(&self) -> &ClientPolicy {
        &self.policy
    }

    /// Connect to `host` and authenticate. The session is `None` when the cluster
    /// is not secured.
    pub async fn open(&self, host: &Host) -> Result<(Connection, Option<SessionInfo>)> {
        let mut conn = Connection::connect(host, self.policy.timeout, self.policy.idle_timeout).await?;

        let session = match (&self.credentials, &self.authenticator) {
            (None, _) => None,
            (Some(credentials), Some(authenticator)) => {
                match authenticator.authenticate(&mut conn, credentials).await {
                    Ok(session) => Some(session),
                    Err(e) => {
                        conn.close();
                        return Err(e.with_node(host));
                    }
                }
            }
            (Some(_), None) => {
                conn.close();
                return Err(Error::NOT_AUTHENTICATED.err().with_node(host));
            }
        };

        Ok((conn, session))
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("credentials", &self.credentials)
            .field("authenticator", &self.authenticator.is_some())
            .finish()
    }
}

fn not_connected() -> Error {
    Error::wrap(
        crate::error::ResultCode::NetworkError,
        std::io::Error::from(std::io::ErrorKind::NotConnected),
    )
}

async fn timed<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match timeout {
        Some(t) => Ok(tokio::time::timeout(t, fut).await??),
        None => Ok(fut.await?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn one_shot_info_server(reply: &'static [(&'static str, &'static str)]) -> Host {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = [0u8; info::HEADER_SIZE];
            socket.read_exact(&mut header).await.unwrap();
            let len = info::decode_header(&header).unwrap();
            let mut body = vec![0u8; len];
            socket.read_exact(&mut body).await.unwrap();

            let mut out = BytesMut::new();
            info::encode_response(reply, &mut out);
            socket.write_all(&out).await.unwrap();
        });

        Host::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_request_info() {
        let host = one_shot_info_server(&[("node", "A1"), ("partition-generation", "4")]).await;
        let mut conn = Connection::connect(&host, Duration::from_secs(1), Duration::from_secs(5))
            .await
            .unwrap();

        let map = conn.request_info(&["node", "partition-generation"]).await.unwrap();
        assert_eq!(map["node"], "A1");
        assert_eq!(map["partition-generation"], "4");
        assert!(conn.is_connected());
        assert!(!conn.is_idle());
    }

    #[tokio::test]
    async fn test_read_failure_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = Host::new("127.0.0.1", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut conn = Connection::connect(&host, Duration::from_secs(1), Duration::from_secs(5))
            .await
            .unwrap();
        let err = conn.request_info(&["node"]).await.unwrap_err();
        assert!(err.is_network_error());
        assert!(!conn.is_connected());
        assert_eq!(err.node(), Some(host.to_string().as_str()));
    }

    #[tokio::test]
    async fn test_read_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = Host::new("127.0.0.1", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut conn = Connection::connect(&host, Duration::from_secs(1), Duration::from_secs(5))
            .await
            .unwrap();
        conn.set_timeout(Some(Duration::from_millis(50)));
        let err = conn.request_info(&["node"]).await.unwrap_err();
        assert!(err.is(&Error::NETWORK_TIMEOUT));
        assert!(!conn.is_connected());
    }

    struct Reject;

    #[async_trait::async_trait]
    impl Authenticator for Reject {
        async fn authenticate(
            &self,
            _conn: &mut Connection,
            _credentials: &Credentials,
        ) -> Result<SessionInfo> {
            Err(Error::NOT_AUTHENTICATED.err())
        }
    }

    #[tokio::test]
    async fn test_connector_requires_authenticator() {
        let host = one_shot_info_server(&[]).await;
        let policy = Arc::new(ClientPolicy::builder().credentials("admin", "pw").build());

        let err = Connector::new(policy.clone(), None).open(&host).await.unwrap_err();
        assert!(err.is(&Error::NOT_AUTHENTICATED));

        let host = one_shot_info_server(&[]).await;
        let err = Connector::new(policy, Some(Arc::new(Reject)))
            .open(&host)
            .await
            .unwrap_err();
        assert!(err.is(&Error::NOT_AUTHENTICATED));
    }

    #[tokio::test]
    async fn test_connector_without_credentials() {
        let host = one_shot_info_server(&[("node", "A1")]).await;
        let connector = Connector::new(Arc::new(ClientPolicy::default()), Some(Arc::new(Reject)));
        let (mut conn, session) = connector.open(&host).await.unwrap();
        assert!(session.is_none());
        assert_eq!(conn.request_info(&["node"]).await.unwrap()["node"], "A1");
    }

    #[tokio::test]
    async fn test_idle_deadline() {
        let host = one_shot_info_server(&[]).await;
        let mut conn = Connection::connect(&host, Duration::from_secs(1), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(conn.is_idle());
        conn.refresh();
        assert!(!conn.is_idle());
    }
}
