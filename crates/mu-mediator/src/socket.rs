use crate::core::{ConsumerId, MediatorEvent};
use crate::stream_store::{ChunkPayload, StreamStore};
use crate::BroadcastMessage;
use mu_proto::protocol::{frame_len, Broadcast, Command, Message, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

pub fn start_server(
    bind_address: String,
    port: u16,
    store: StreamStore,
    event_tx: mpsc::Sender<MediatorEvent>,
    log_tx: broadcast::Sender<BroadcastMessage>,
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
        serve(listener, store, event_tx, log_tx).await;
    })
}

/// Accept consumers on an already-bound listener until it fails for good.
pub async fn serve(
    listener: TcpListener,
    store: StreamStore,
    event_tx: mpsc::Sender<MediatorEvent>,
    log_tx: broadcast::Sender<BroadcastMessage>,
) {
    let mut consumer_id: ConsumerId = 0;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                consumer_id += 1;
                let id = consumer_id;
                info!("Consumer {} connected from {}", id, peer);

                let store = store.clone();
                let evt_tx = event_tx.clone();
                let log_rx = log_tx.subscribe();

                tokio::spawn(async move {
                    handle_consumer(stream, id, store, evt_tx.clone(), log_rx).await;
                    info!("Consumer {} disconnected", id);
                    let _ = evt_tx.send(MediatorEvent::ConsumerGone(id)).await;
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_consumer(
    stream: TcpStream,
    consumer_id: ConsumerId,
    store: StreamStore,
    event_tx: mpsc::Sender<MediatorEvent>,
    mut log_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();
    let mut logs_open = true;

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Broadcast>();
    if event_tx
        .send(MediatorEvent::ConsumerConnected {
            id: consumer_id,
            outbound: outbound_tx,
        })
        .await
        .is_err()
    {
        warn!("MediatorEvent channel closed");
        return;
    }

    let hello = Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        consumer_id,
    };
    if write_broadcast(&mut write_half, hello).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Consumer {} closed connection", consumer_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            if read_buf.len() < 4 { break; }
                            let len = match frame_len([read_buf[0], read_buf[1], read_buf[2], read_buf[3]]) {
                                Ok(len) => len,
                                Err(e) => {
                                    warn!("Consumer {} dropped: {}", consumer_id, e);
                                    return;
                                }
                            };
                            if read_buf.len() < 4 + len { break; }
                            match Message::decode(&read_buf) {
                                Ok((Message::Command(cmd), consumed)) => {
                                    read_buf.drain(..consumed);
                                    if is_stream_command(&cmd) {
                                        if serve_stream_command(&mut write_half, &store, &cmd).await.is_err() {
                                            return;
                                        }
                                        continue;
                                    }
                                    debug!("Consumer {} sent command: {}", consumer_id, command_name(&cmd));
                                    if event_tx.send(MediatorEvent::Command(consumer_id, cmd)).await.is_err() {
                                        warn!("MediatorEvent channel closed");
                                        return;
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(e) => {
                                    warn!("Consumer {} sent an unreadable frame: {}", consumer_id, e);
                                    read_buf.drain(..4 + len);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from consumer {}: {}", consumer_id, e);
                        break;
                    }
                }
            }

            msg = outbound_rx.recv() => {
                match msg {
                    Some(broadcast) => {
                        if write_broadcast(&mut write_half, broadcast).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            msg = log_rx.recv(), if logs_open => {
                match msg {
                    Ok(BroadcastMessage::Log(message)) => {
                        let _ = write_broadcast(&mut write_half, Broadcast::Log { message }).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Consumer {} missed {} log messages", consumer_id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => logs_open = false,
                }
            }
        }
    }
}

fn is_stream_command(cmd: &Command) -> bool {
    matches!(cmd, Command::GetChunk { .. } | Command::ReleaseStream { .. })
}

fn command_name(cmd: &Command) -> &'static str {
    match cmd {
        Command::Hello { .. } => "Hello",
        Command::Observe { .. } => "Observe",
        Command::ProcessCurrentVisible => "ProcessCurrentVisible",
        Command::RunWithPreload { .. } => "RunWithPreload",
        Command::GetStatus => "GetStatus",
        Command::SettingsChanged { .. } => "SettingsChanged",
        Command::GetChunk { .. } => "GetChunk",
        Command::ReleaseStream { .. } => "ReleaseStream",
        Command::StreamFailed { .. } => "StreamFailed",
        Command::ClearBackendCache => "ClearBackendCache",
        Command::DownloadModels { .. } => "DownloadModels",
    }
}

/// Chunk pulls bypass the core so they never queue behind a cycle.
async fn serve_stream_command<W>(
    writer: &mut W,
    store: &StreamStore,
    cmd: &Command,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match cmd {
        Command::GetChunk {
            stream_id,
            index,
            encoding,
        } => match store.get_chunk_as(stream_id, *index, *encoding) {
            Ok(ChunkPayload::Raw(bytes)) => {
                let header = Broadcast::ChunkRaw {
                    stream_id: stream_id.clone(),
                    index: *index,
                    len: bytes.len() as u32,
                };
                writer.write_all(&Message::Broadcast(header).encode()?).await?;
                writer.write_all(&bytes).await?;
            }
            Ok(ChunkPayload::Base64(data)) => {
                let chunk = Broadcast::Chunk {
                    stream_id: stream_id.clone(),
                    index: *index,
                    data,
                };
                write_broadcast(writer, chunk).await?;
            }
            Err(e) => {
                debug!("GetChunk {}#{} ({:?}) failed: {}", stream_id, index, encoding, e);
                let failure = Broadcast::ChunkError {
                    stream_id: stream_id.clone(),
                    index: *index,
                    encoding: *encoding,
                    message: e.to_string(),
                };
                write_broadcast(writer, failure).await?;
            }
        },
        Command::ReleaseStream { stream_id } => {
            if !store.delete(stream_id) {
                debug!("ReleaseStream {}: already gone", stream_id);
            }
        }
        _ => {}
    }
    Ok(())
}

async fn write_broadcast<W>(writer: &mut W, broadcast: Broadcast) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = Message::Broadcast(broadcast).encode()?;
    writer.write_all(&encoded).await?;
    Ok(())
}
