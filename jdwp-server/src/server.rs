// JDWP server
//
// Wires a transport connection to a `DebugSession` and its event loop.

use crate::bridge::{DebuggeeBridge, SymbolLookup};
use crate::config::JdwpOptions;
use crate::connection::{JdwpConnection, JdwpListener};
use crate::dispatcher::EventDispatcher;
use crate::eventloop::{spawn_event_loop, EventLoopHandle, PacketSender};
use crate::protocol::JdwpResult;
use crate::session::DebugSession;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

pub struct JdwpServer {
    options: JdwpOptions,
    listener: Option<JdwpListener>,
}

impl JdwpServer {
    /// Bind the listening socket in server mode. Attach mode connects
    /// lazily in `connect`.
    pub async fn bind(options: JdwpOptions) -> JdwpResult<Self> {
        let listener = if options.server {
            let listener = JdwpListener::bind(&options.address(), options.timeout()).await?;
            info!(
                "Listening for transport {} at address: {}",
                options.transport,
                listener.local_addr()?.port()
            );
            Some(listener)
        } else {
            None
        };

        Ok(Self { options, listener })
    }

    pub fn options(&self) -> &JdwpOptions {
        &self.options
    }

    /// Port actually bound, when listening
    pub fn local_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|addr| addr.port())
    }

    /// Wait for (or reach out to) the debugger and complete the handshake
    pub async fn connect(&self) -> JdwpResult<JdwpConnection> {
        match &self.listener {
            Some(listener) => listener.accept().await,
            None => JdwpConnection::attach(&self.options.address(), self.options.timeout()).await,
        }
    }

    /// Start a session over a handshaken connection. Must be called from
    /// within the tokio runtime.
    pub fn serve(
        &self,
        connection: JdwpConnection,
        bridge: Arc<dyn DebuggeeBridge>,
        symbols: Arc<dyn SymbolLookup>,
    ) -> ServerHandle {
        let peer = connection.peer_addr();
        let (outbound, outbound_rx) = PacketSender::new(self.options.queue_capacity);
        let session = DebugSession::new(bridge, symbols, outbound);

        let (reader, writer) = connection.into_split();
        let event_loop = spawn_event_loop(reader, writer, session.clone(), outbound_rx);
        info!("Debug session started with {}", peer);

        ServerHandle {
            session,
            event_loop,
            peer,
        }
    }
}

/// A running debug session
pub struct ServerHandle {
    session: Arc<DebugSession>,
    event_loop: EventLoopHandle,
    peer: SocketAddr,
}

impl ServerHandle {
    pub fn session(&self) -> &Arc<DebugSession> {
        &self.session
    }

    pub fn dispatcher(&self) -> EventDispatcher {
        self.session.dispatcher()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Resolves once the debugger has gone and the session is disposed
    pub async fn closed(self) {
        self.event_loop.join().await;
        info!("Debug session with {} ended", self.peer);
    }
}

/// Bind, wait for one debugger and start serving it
pub async fn start(
    options: JdwpOptions,
    bridge: Arc<dyn DebuggeeBridge>,
    symbols: Arc<dyn SymbolLookup>,
) -> JdwpResult<ServerHandle> {
    let server = JdwpServer::bind(options).await?;
    let connection = server.connect().await?;
    Ok(server.serve(connection, bridge, symbols))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{command_sets, event_kinds, thread_commands, vm_commands};
    use crate::eventloop::read_packet;
    use crate::eventrequest::{EventModifier, EventRequest, SuspendPolicy};
    use crate::events::{parse_event_packet, EventKind};
    use crate::mock::FakeDebuggee;
    use crate::protocol::{CommandPacket, JdwpError, Packet, ReplyPacket, JDWP_HANDSHAKE};
    use crate::types::{Location, NULL_OBJECT};
    use bytes::BufMut;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn listen_options() -> JdwpOptions {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        JdwpOptions::parse("transport=dt_socket,server=y,address=127.0.0.1:0,timeout=5000").unwrap()
    }

    async fn attach_debugger(port: u16) -> TcpStream {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(JDWP_HANDSHAKE).await.unwrap();
        let mut echo = vec![0u8; JDWP_HANDSHAKE.len()];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(echo, JDWP_HANDSHAKE);
        stream
    }

    async fn next_packet(stream: &mut TcpStream) -> Packet {
        let frame = tokio::time::timeout(Duration::from_secs(5), read_packet(stream))
            .await
            .unwrap()
            .unwrap();
        Packet::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_session_over_loopback() {
        let vm = Arc::new(FakeDebuggee::new());
        vm.add_thread(1);
        vm.set_reply(command_sets::VIRTUAL_MACHINE, vm_commands::VERSION, vec![1, 2, 3]);

        let server = JdwpServer::bind(listen_options()).await.unwrap();
        let port = server.local_port().unwrap();
        assert_ne!(port, 0);

        let debugger = tokio::spawn(attach_debugger(port));
        let connection = server.connect().await.unwrap();
        let handle = server.serve(connection, vm.clone(), vm.clone());
        let mut stream = debugger.await.unwrap();

        // Forwarded command
        stream
            .write_all(&CommandPacket::new(1, command_sets::VIRTUAL_MACHINE, vm_commands::VERSION).encode())
            .await
            .unwrap();
        assert_eq!(next_packet(&mut stream).await, Packet::Reply(ReplyPacket::new(1, vec![1, 2, 3])));

        // Handled command
        let mut data = Vec::new();
        data.put_u64(1);
        stream
            .write_all(&CommandPacket::with_data(2, command_sets::THREAD_REFERENCE, thread_commands::SUSPEND, data).encode())
            .await
            .unwrap();
        assert_eq!(next_packet(&mut stream).await, Packet::Reply(ReplyPacket::new(2, vec![])));
        assert!(vm.is_stopped(1));

        drop(stream);
        let session = handle.session().clone();
        tokio::time::timeout(Duration::from_secs(5), handle.closed()).await.unwrap();
        assert!(session.is_disposed());
        assert!(!vm.is_stopped(1));
    }

    #[tokio::test]
    async fn test_all_policy_event_arrives_after_suspension() {
        let vm = Arc::new(FakeDebuggee::new());
        vm.add_thread(1);
        vm.add_thread(2);

        let server = JdwpServer::bind(listen_options()).await.unwrap();
        let debugger = tokio::spawn(attach_debugger(server.local_port().unwrap()));
        let connection = server.connect().await.unwrap();
        let handle = server.serve(connection, vm.clone(), vm.clone());
        let mut stream = debugger.await.unwrap();

        let location = Location::new(1, 2, 3);
        let request = EventRequest::new(event_kinds::BREAKPOINT, SuspendPolicy::All)
            .with_modifier(EventModifier::LocationOnly(location));
        stream
            .write_all(&CommandPacket::with_data(1, command_sets::EVENT_REQUEST, 1, request.encode()).encode())
            .await
            .unwrap();
        assert!(matches!(next_packet(&mut stream).await, Packet::Reply(r) if !r.is_error()));

        let dispatcher = handle.dispatcher();
        let debuggee = std::thread::spawn(move || dispatcher.on_breakpoint(1, location, NULL_OBJECT));

        match next_packet(&mut stream).await {
            Packet::Command(event) => {
                let set = parse_event_packet(&event.data).unwrap();
                assert_eq!(set.events[0].details, EventKind::Breakpoint { thread: 1, location });
            }
            other => panic!("expected event, got {:?}", other),
        }
        assert!(vm.is_stopped(2));
        assert_eq!(handle.session().threads().suspend_count(2), Ok(1));

        stream
            .write_all(&CommandPacket::new(2, command_sets::VIRTUAL_MACHINE, vm_commands::RESUME).encode())
            .await
            .unwrap();
        assert!(matches!(next_packet(&mut stream).await, Packet::Reply(r) if r.id == 2));
        assert!(tokio::task::spawn_blocking(move || debuggee.join().unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_bad_handshake_starts_no_session() {
        let server = JdwpServer::bind(listen_options()).await.unwrap();
        let port = server.local_port().unwrap();

        let debugger = tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            stream.write_all(b"HTTP/1.1 GET /").await.unwrap();
            // Whatever the server does, no JDWP packet ever arrives
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
            rest
        });

        assert!(matches!(server.connect().await, Err(JdwpError::InvalidHandshake)));
        assert!(debugger.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attach_mode_without_debugger_fails() {
        let options = JdwpOptions::parse("server=n,address=127.0.0.1:1,timeout=2000").unwrap();
        let server = JdwpServer::bind(options).await.unwrap();
        assert_eq!(server.local_port(), None);
        assert!(server.connect().await.is_err());
    }
}
