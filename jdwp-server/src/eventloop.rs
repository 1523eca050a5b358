// JDWP Event Loop
//
// Three tasks per connection:
//   reader    decodes packets from the debugger and queues commands
//   commands  runs each command on the blocking pool, strictly in arrival order
//   writer    drains the outbound queue (replies and events) onto the socket
//
// Debuggee threads enqueue events with `PacketSender::send_blocking`.

use crate::protocol::{JdwpError, JdwpResult, Packet, HEADER_SIZE, MAX_PACKET_SIZE};
use crate::session::DebugSession;
use bytes::BytesMut;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Producer side of the outbound packet queue
#[derive(Clone, Debug)]
pub struct PacketSender {
    tx: mpsc::Sender<Packet>,
    next_id: Arc<AtomicU32>,
}

impl PacketSender {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(capacity);
        let sender = Self {
            tx,
            next_id: Arc::new(AtomicU32::new(1)),
        };
        (sender, rx)
    }

    /// Generate next packet ID for server-initiated commands
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Enqueue from a thread outside the async runtime, waiting for room
    pub fn send_blocking(&self, packet: Packet) -> JdwpResult<()> {
        match self.tx.try_send(packet) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(packet)) => {
                debug!("Outbound queue full, waiting");
                self.tx
                    .blocking_send(packet)
                    .map_err(|_| JdwpError::ConnectionClosed)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(JdwpError::ConnectionClosed),
        }
    }

    pub async fn send(&self, packet: Packet) -> JdwpResult<()> {
        self.tx.send(packet).await.map_err(|_| JdwpError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Handle to the tasks serving one connection
#[derive(Debug)]
pub struct EventLoopHandle {
    reader: JoinHandle<()>,
    commands: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl EventLoopHandle {
    /// Wait until the debugger has gone and the session is torn down
    pub async fn join(self) {
        for (name, task) in [("reader", self.reader), ("commands", self.commands), ("writer", self.writer)] {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Event loop {} task failed: {}", name, e);
                }
            }
        }
    }

    pub fn abort(&self) {
        self.reader.abort();
        self.commands.abort();
        self.writer.abort();
    }
}

/// Start serving `session` over an established, handshaken stream
pub fn spawn_event_loop<R, W>(
    reader: R,
    writer: W,
    session: Arc<DebugSession>,
    outbound_rx: mpsc::Receiver<Packet>,
) -> EventLoopHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(32);
    let shutdown = Arc::new(Notify::new());

    let reader = tokio::spawn(reader_task(reader, command_tx));
    let commands = tokio::spawn(command_task(command_rx, session, shutdown.clone()));
    let writer = tokio::spawn(writer_task(writer, outbound_rx, shutdown));

    EventLoopHandle {
        reader,
        commands,
        writer,
    }
}

async fn reader_task<R>(mut reader: R, command_tx: mpsc::Sender<crate::protocol::CommandPacket>)
where
    R: AsyncRead + Unpin,
{
    info!("Event loop started");

    loop {
        let frame = match read_packet(&mut reader).await {
            Ok(frame) => frame,
            Err(JdwpError::ConnectionClosed) => {
                info!("Debugger disconnected");
                break;
            }
            Err(e) => {
                error!("Failed to read packet: {}", e);
                break;
            }
        };

        match Packet::decode(&frame) {
            Ok(Packet::Command(command)) => {
                debug!(
                    "Received command id={} set={} cmd={}",
                    command.id, command.command_set, command.command
                );
                if command_tx.send(command).await.is_err() {
                    break;
                }
            }
            Ok(Packet::Reply(reply)) => {
                warn!("Ignoring reply from debugger id={}", reply.id);
            }
            Err(e) => {
                error!("Failed to decode packet: {}", e);
                break;
            }
        }
    }
}

async fn command_task(
    mut command_rx: mpsc::Receiver<crate::protocol::CommandPacket>,
    session: Arc<DebugSession>,
    shutdown: Arc<Notify>,
) {
    let outbound = session.outbound().clone();

    while let Some(command) = command_rx.recv().await {
        let handler = session.clone();
        match tokio::task::spawn_blocking(move || handler.handle_command(&command)).await {
            Ok(Some(reply)) => {
                if let Err(e) = outbound.send(Packet::Reply(reply)).await {
                    warn!("Failed to queue reply: {}", e);
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => error!("Command handler failed: {}", e),
        }
    }

    // The debugger is gone: behave as if it had sent VirtualMachine.Dispose
    let disposing = session.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || disposing.dispose()).await {
        error!("Session dispose failed: {}", e);
    }
    shutdown.notify_one();
    info!("Event loop shutting down");
}

async fn writer_task<W>(mut writer: W, mut outbound_rx: mpsc::Receiver<Packet>, shutdown: Arc<Notify>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            packet = outbound_rx.recv() => match packet {
                Some(packet) => {
                    if let Err(e) = write_packet(&mut writer, &packet).await {
                        error!("Failed to write packet id={}: {}", packet.id(), e);
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown.notified() => {
                while let Ok(packet) = outbound_rx.try_recv() {
                    if write_packet(&mut writer, &packet).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Socket shutdown failed: {}", e);
    }
}

async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> JdwpResult<()> {
    writer.write_all(&packet.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one complete packet (header included) from the stream
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> JdwpResult<Vec<u8>> {
    let mut header = BytesMut::with_capacity(HEADER_SIZE);
    header.resize(HEADER_SIZE, 0);

    reader.read_exact(&mut header).await.map_err(map_eof)?;

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;

    if length < HEADER_SIZE {
        return Err(JdwpError::Protocol(format!("Invalid packet length: {}", length)));
    }

    if length > MAX_PACKET_SIZE {
        return Err(JdwpError::Protocol(format!(
            "Packet too large: {} bytes (max: {} bytes)",
            length, MAX_PACKET_SIZE
        )));
    }

    let data_len = length - HEADER_SIZE;
    let mut full_packet = header.to_vec();

    if data_len > 0 {
        let mut data = vec![0u8; data_len];
        reader.read_exact(&mut data).await.map_err(map_eof)?;
        full_packet.extend_from_slice(&data);
    }

    Ok(full_packet)
}

fn map_eof(e: std::io::Error) -> JdwpError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        JdwpError::ConnectionClosed
    } else {
        JdwpError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{command_sets, thread_commands, vm_commands};
    use crate::mock::FakeDebuggee;
    use crate::protocol::{CommandPacket, ReplyPacket};
    use bytes::BufMut;
    use std::time::Duration;
    use tokio::io::{duplex, split, DuplexStream};

    fn serve(vm: Arc<FakeDebuggee>) -> (Arc<DebugSession>, EventLoopHandle, DuplexStream) {
        let (client, server) = duplex(64 * 1024);
        let (outbound, outbound_rx) = PacketSender::new(16);
        let session = DebugSession::new(vm.clone(), vm, outbound);
        let (reader, writer) = split(server);
        let handle = spawn_event_loop(reader, writer, session.clone(), outbound_rx);
        (session, handle, client)
    }

    async fn roundtrip(client: &mut DuplexStream, command: CommandPacket) -> ReplyPacket {
        client.write_all(&command.encode()).await.unwrap();
        let frame = read_packet(client).await.unwrap();
        ReplyPacket::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_read_packet_rejects_bad_lengths() {
        let short = [0u8, 0, 0, 5, 0, 0, 0, 1, 0, 1, 1];
        assert!(matches!(read_packet(&mut &short[..]).await, Err(JdwpError::Protocol(_))));

        let mut huge = vec![];
        huge.put_u32((MAX_PACKET_SIZE + 1) as u32);
        huge.extend_from_slice(&[0; 7]);
        assert!(matches!(read_packet(&mut &huge[..]).await, Err(JdwpError::Protocol(_))));

        let truncated = CommandPacket::with_data(1, 1, 1, vec![1, 2, 3]).encode();
        assert!(matches!(
            read_packet(&mut &truncated[..truncated.len() - 1]).await,
            Err(JdwpError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_commands_are_answered_in_order() {
        let vm = Arc::new(FakeDebuggee::new());
        vm.add_thread(3);
        let (_session, _handle, mut client) = serve(vm);

        let reply = roundtrip(&mut client, CommandPacket::new(1, command_sets::VIRTUAL_MACHINE, vm_commands::SUSPEND)).await;
        assert_eq!(reply.id, 1);
        assert!(!reply.is_error());

        let mut data = Vec::new();
        data.put_u64(3);
        let reply = roundtrip(
            &mut client,
            CommandPacket::with_data(2, command_sets::THREAD_REFERENCE, thread_commands::SUSPEND_COUNT, data),
        )
        .await;
        assert_eq!(reply.id, 2);
        assert_eq!(reply.data(), &[0, 0, 0, 1]);
    }

    #[tokio::test]
    async fn test_disconnect_disposes_session() {
        let vm = Arc::new(FakeDebuggee::new());
        vm.add_thread(3);
        let (session, handle, mut client) = serve(vm);

        roundtrip(&mut client, CommandPacket::new(1, command_sets::VIRTUAL_MACHINE, vm_commands::SUSPEND)).await;
        drop(client);

        tokio::time::timeout(Duration::from_secs(5), handle.join()).await.unwrap();
        assert!(session.is_disposed());
    }

    #[test]
    fn test_send_blocking_after_close_fails() {
        let (sender, rx) = PacketSender::new(1);
        sender
            .send_blocking(Packet::Reply(ReplyPacket::new(1, vec![])))
            .unwrap();
        drop(rx);

        assert!(sender.is_closed());
        assert!(matches!(
            sender.send_blocking(Packet::Reply(ReplyPacket::new(2, vec![]))),
            Err(JdwpError::ConnectionClosed)
        ));
        assert_eq!(sender.next_id(), 1);
        assert_eq!(sender.next_id(), 2);
    }
}
