use crate::core::dispatch;
use crate::BroadcastMessage;
use lasso_core::SessionEngine;
use lasso_proto::protocol::{
    Broadcast, Command, ErrorKind, Message, MAX_FRAME_LEN, PROTOCOL_VERSION,
};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

pub fn start_server(
    bind_address: String,
    port: u16,
    engine: Arc<SessionEngine>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);

        let mut client_id = 0usize;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    info!("Client {} connected from {}", id, peer);

                    let engine = engine.clone();
                    let bcast_rx = broadcast_tx.subscribe();
                    tokio::spawn(async move {
                        let (read_half, write_half) = stream.into_split();
                        handle_client(read_half, write_half, &engine, id, bcast_rx).await;
                        info!("Client {} disconnected", id);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

async fn handle_client<R, W>(
    mut read_half: R,
    mut write_half: W,
    engine: &SessionEngine,
    client_id: usize,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Hello with the current snapshot on connect
    if let Ok(encoded) = encode_hello(engine).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            let Some(frame_len) = Message::frame_len(&read_buf) else { break };
                            if frame_len - 4 > MAX_FRAME_LEN {
                                // No way to find the next frame boundary.
                                warn!("Client {} announced a {} byte frame, closing", client_id, frame_len - 4);
                                let reply = malformed("frame too large".to_string());
                                if let Ok(encoded) = Message::Broadcast(reply).encode() {
                                    let _ = write_half.write_all(&encoded).await;
                                }
                                return;
                            }
                            if read_buf.len() < frame_len { break; }

                            let decoded = Message::decode(&read_buf);
                            read_buf.drain(..frame_len);
                            let reply = match decoded {
                                Ok((Message::Command(cmd), _)) => {
                                    info!("Client {} sent command: {:?}", client_id, cmd);
                                    run_command(engine, cmd).await
                                }
                                Ok(_) => continue,
                                Err(e) => {
                                    warn!("Client {} sent a malformed frame: {}", client_id, e);
                                    malformed(e.to_string())
                                }
                            };
                            if let Ok(encoded) = Message::Broadcast(reply).encode() {
                                if write_half.write_all(&encoded).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                match msg {
                    Ok(BroadcastMessage::StateUpdated) => {
                        if let Ok(encoded) = encode_state(engine).await {
                            if write_half.write_all(&encoded).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(BroadcastMessage::Log(message)) => {
                        let broadcast = Broadcast::Log { message };
                        if let Ok(encoded) = Message::Broadcast(broadcast).encode() {
                            let _ = write_half.write_all(&encoded).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        if let Ok(encoded) = encode_state(engine).await {
                            let _ = write_half.write_all(&encoded).await;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

/// The direct reply to a command: the resulting state, or why it was refused.
async fn run_command(engine: &SessionEngine, cmd: Command) -> Broadcast {
    let name = cmd.name();
    match dispatch(engine, cmd).await {
        Ok(snapshot) => Broadcast::State { data: snapshot },
        Err(e) => Broadcast::CommandFailed {
            command: name.to_string(),
            kind: e.kind(),
            message: e.to_string(),
        },
    }
}

/// Reply to a frame that is not a command.  Nothing is dispatched, so it is
/// reported as a contract violation with state unchanged.
fn malformed(message: String) -> Broadcast {
    Broadcast::CommandFailed {
        command: "unknown".to_string(),
        kind: ErrorKind::InvalidTransition,
        message: format!("malformed command: {}", message),
    }
}

async fn encode_hello(engine: &SessionEngine) -> anyhow::Result<Vec<u8>> {
    let state = engine.snapshot().await;
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        daemon_rev: state.rev,
        state,
    })
    .encode()
}

async fn encode_state(engine: &SessionEngine) -> anyhow::Result<Vec<u8>> {
    let state = engine.snapshot().await;
    Message::Broadcast(Broadcast::State { data: state }).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::engine_with_users;
    use lasso_proto::protocol::SessionState;
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};

    async fn read_broadcast(reader: &mut ReadHalf<DuplexStream>) -> Broadcast {
        let mut len = [0u8; 4];
        reader.read_exact(&mut len).await.unwrap();
        let mut frame = len.to_vec();
        frame.resize(4 + u32::from_be_bytes(len) as usize, 0);
        reader.read_exact(&mut frame[4..]).await.unwrap();
        match Message::decode(&frame).unwrap().0 {
            Message::Broadcast(b) => b,
            other => panic!("expected a broadcast, got {other:?}"),
        }
    }

    async fn send(writer: &mut WriteHalf<DuplexStream>, cmd: Command) {
        let encoded = Message::Command(cmd).encode().unwrap();
        writer.write_all(&encoded).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hello_then_command_replies() {
        let engine = Arc::new(engine_with_users(&["alice"]));
        let (tx, _) = broadcast::channel(16);
        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);

        let handler_engine = engine.clone();
        let rx = tx.subscribe();
        let handler = tokio::spawn(async move {
            handle_client(server_read, server_write, &handler_engine, 1, rx).await;
        });

        let (mut reader, mut writer) = tokio::io::split(client);
        match read_broadcast(&mut reader).await {
            Broadcast::Hello {
                protocol_version,
                state,
                ..
            } => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(state.state, SessionState::NotStarted);
            }
            other => panic!("expected hello, got {other:?}"),
        }

        send(&mut writer, Command::Pause).await;
        match read_broadcast(&mut reader).await {
            Broadcast::CommandFailed { command, kind, .. } => {
                assert_eq!(command, "pause");
                assert_eq!(kind, ErrorKind::InvalidTransition);
            }
            other => panic!("expected failure, got {other:?}"),
        }

        send(
            &mut writer,
            Command::Start {
                username: "alice".into(),
            },
        )
        .await;
        match read_broadcast(&mut reader).await {
            Broadcast::State { data } => {
                assert_eq!(data.state, SessionState::Active);
                assert_eq!(data.target_username.as_deref(), Some("alice"));
            }
            other => panic!("expected state, got {other:?}"),
        }

        drop(writer);
        drop(reader);
        handler.await.unwrap();
        engine.shutdown().await;
    }

    fn spawn_handler(
        engine: &Arc<SessionEngine>,
    ) -> (
        ReadHalf<DuplexStream>,
        WriteHalf<DuplexStream>,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, _) = broadcast::channel(16);
        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let handler_engine = engine.clone();
        let rx = tx.subscribe();
        let handler = tokio::spawn(async move {
            // Keep the sender alive for the handler's lifetime so the
            // broadcast channel does not close underneath it.
            let _tx = tx;
            handle_client(server_read, server_write, &handler_engine, 7, rx).await;
        });
        let (reader, writer) = tokio::io::split(client);
        (reader, writer, handler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_is_answered_and_skipped() {
        let engine = Arc::new(engine_with_users(&["alice"]));
        let (mut reader, mut writer, handler) = spawn_handler(&engine);
        assert!(matches!(read_broadcast(&mut reader).await, Broadcast::Hello { .. }));

        let mut garbage = 9u32.to_be_bytes().to_vec();
        garbage.extend_from_slice(b"{not json");
        writer.write_all(&garbage).await.unwrap();
        match read_broadcast(&mut reader).await {
            Broadcast::CommandFailed { command, kind, .. } => {
                assert_eq!(command, "unknown");
                assert_eq!(kind, ErrorKind::InvalidTransition);
            }
            other => panic!("expected failure, got {other:?}"),
        }

        // The connection still takes commands.
        send(&mut writer, Command::Pause).await;
        match read_broadcast(&mut reader).await {
            Broadcast::CommandFailed { command, .. } => assert_eq!(command, "pause"),
            other => panic!("expected failure, got {other:?}"),
        }
        send(&mut writer, Command::GetState).await;
        assert!(matches!(read_broadcast(&mut reader).await, Broadcast::State { .. }));

        drop(writer);
        drop(reader);
        handler.await.unwrap();
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_frame_closes_connection() {
        let engine = Arc::new(engine_with_users(&["alice"]));
        let (mut reader, mut writer, handler) = spawn_handler(&engine);
        assert!(matches!(read_broadcast(&mut reader).await, Broadcast::Hello { .. }));

        let header = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        writer.write_all(&header).await.unwrap();
        match read_broadcast(&mut reader).await {
            Broadcast::CommandFailed { message, .. } => assert!(message.contains("too large")),
            other => panic!("expected failure, got {other:?}"),
        }
        handler.await.unwrap();
        engine.shutdown().await;
    }
}
