// JDWP connection management
//
// Handles listening, attaching and the handshake. The server side always
// reads the debugger's handshake first and echoes it back.

use crate::protocol::*;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Listening socket waiting for a debugger
#[derive(Debug)]
pub struct JdwpListener {
    listener: TcpListener,
    timeout: Option<Duration>,
}

impl JdwpListener {
    pub async fn bind(address: &str, timeout: Option<Duration>) -> JdwpResult<Self> {
        let listener = TcpListener::bind(address).await?;
        debug!("Bound JDWP listener on {}", listener.local_addr()?);
        Ok(Self { listener, timeout })
    }

    pub fn local_addr(&self) -> JdwpResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one debugger and complete the handshake
    pub async fn accept(&self) -> JdwpResult<JdwpConnection> {
        let (mut stream, peer) = with_timeout(self.timeout, "accept", self.listener.accept()).await??;
        info!("Debugger connected from {}", peer);

        handshake(&mut stream, self.timeout).await?;
        Ok(JdwpConnection { stream, peer })
    }
}

/// A handshaken debugger connection
#[derive(Debug)]
pub struct JdwpConnection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl JdwpConnection {
    /// Attach to a debugger that is listening at `address`
    pub async fn attach(address: &str, timeout: Option<Duration>) -> JdwpResult<Self> {
        info!("Attaching to debugger at {}", address);

        let mut stream = with_timeout(timeout, "attach", TcpStream::connect(address)).await??;
        let peer = stream.peer_addr()?;

        handshake(&mut stream, timeout).await?;
        Ok(Self { stream, peer })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}

/// Perform the server side of the JDWP handshake
pub async fn handshake<S>(stream: &mut S, timeout: Option<Duration>) -> JdwpResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Performing JDWP handshake");

    let mut buf = vec![0u8; JDWP_HANDSHAKE.len()];
    match with_timeout(timeout, "handshake", stream.read_exact(&mut buf)).await? {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            warn!("Debugger closed the connection during handshake");
            return Err(JdwpError::InvalidHandshake);
        }
        Err(e) => return Err(e.into()),
    }

    if buf != JDWP_HANDSHAKE {
        warn!("Invalid handshake: {:?}", String::from_utf8_lossy(&buf));
        return Err(JdwpError::InvalidHandshake);
    }

    stream.write_all(JDWP_HANDSHAKE).await?;
    stream.flush().await?;

    info!("JDWP handshake successful");
    Ok(())
}

async fn with_timeout<F: Future>(timeout: Option<Duration>, what: &'static str, future: F) -> JdwpResult<F::Output> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| JdwpError::Timeout(what)),
        None => Ok(future.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_handshake_is_echoed() {
        let (mut client, mut server) = duplex(64);

        let debugger = tokio::spawn(async move {
            client.write_all(JDWP_HANDSHAKE).await.unwrap();
            let mut echo = vec![0u8; JDWP_HANDSHAKE.len()];
            client.read_exact(&mut echo).await.unwrap();
            echo
        });

        handshake(&mut server, None).await.unwrap();
        assert_eq!(debugger.await.unwrap(), JDWP_HANDSHAKE);
    }

    #[tokio::test]
    async fn test_wrong_handshake_is_rejected() {
        let (mut client, mut server) = duplex(64);
        client.write_all(b"JDWP-Handshakf").await.unwrap();

        assert!(matches!(handshake(&mut server, None).await, Err(JdwpError::InvalidHandshake)));
    }

    #[tokio::test]
    async fn test_truncated_handshake_is_rejected() {
        let (mut client, mut server) = duplex(64);
        client.write_all(b"JDWP-Hand").await.unwrap();
        drop(client);

        assert!(matches!(handshake(&mut server, None).await, Err(JdwpError::InvalidHandshake)));
    }

    #[tokio::test]
    async fn test_silent_debugger_times_out() {
        let (_client, mut server) = duplex(64);

        let result = handshake(&mut server, Some(Duration::from_millis(20))).await;
        assert!(matches!(result, Err(JdwpError::Timeout("handshake"))));
    }

    #[tokio::test]
    async fn test_accept_and_attach_over_loopback() {
        let listener = JdwpListener::bind("127.0.0.1:0", Some(Duration::from_secs(5))).await.unwrap();
        let address = listener.local_addr().unwrap();

        // A debugger in attach mode connects, then sends its handshake
        let debugger = tokio::spawn(async move {
            let mut stream = TcpStream::connect(address).await.unwrap();
            stream.write_all(JDWP_HANDSHAKE).await.unwrap();
            let mut echo = vec![0u8; JDWP_HANDSHAKE.len()];
            stream.read_exact(&mut echo).await.unwrap();
            echo
        });

        let connection = listener.accept().await.unwrap();
        assert_eq!(connection.peer_addr().ip(), address.ip());
        assert_eq!(debugger.await.unwrap(), JDWP_HANDSHAKE);

        // A listening debugger receives our connection
        let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();
        let debugger = tokio::spawn(async move {
            let (mut stream, _) = remote.accept().await.unwrap();
            stream.write_all(JDWP_HANDSHAKE).await.unwrap();
            let mut echo = vec![0u8; JDWP_HANDSHAKE.len()];
            stream.read_exact(&mut echo).await.unwrap();
            echo
        });

        let connection = JdwpConnection::attach(&remote_addr.to_string(), None).await.unwrap();
        assert_eq!(connection.peer_addr(), remote_addr);
        assert_eq!(debugger.await.unwrap(), JDWP_HANDSHAKE);
    }
}
