/// Native-messaging driver for the backend's process supervisor.
///
/// Architecture:
///
/// ```text
///   HostDriver::spawn()
///         │
///         ├── writer_task   ← receives PendingCommand via mpsc, frames → child stdin
///         └── reader_task   ← reads LE-length frames from child stdout
///                                └── ack → oldest pending oneshot (FIFO)
/// ```
///
/// The host answers strictly in order, so replies are matched to requests
/// by position instead of by id.  A command whose reply never arrives times
/// out; the late reply still pops its own slot, keeping the queue aligned.
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mu_proto::config::SupervisorConfig;
use mu_proto::native::{encode_frame, frame_len, SupervisorAck, SupervisorCommand};
use mu_proto::platform;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

type Pending = Arc<Mutex<VecDeque<oneshot::Sender<anyhow::Result<SupervisorAck>>>>>;

/// Best-effort control of the process that launches the backend.
#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn command(&self, cmd: SupervisorCommand) -> anyhow::Result<SupervisorAck>;
}

struct PendingCommand {
    cmd: SupervisorCommand,
    frame: Vec<u8>,
    reply: oneshot::Sender<anyhow::Result<SupervisorAck>>,
}

// ── public handle ─────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct HostHandle {
    tx: mpsc::Sender<PendingCommand>,
    ack_timeout: Duration,
}

impl HostHandle {
    pub async fn send(&self, cmd: SupervisorCommand) -> anyhow::Result<SupervisorAck> {
        let frame = encode_frame(&cmd)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingCommand {
                cmd,
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("host writer task gone"))?;

        tokio::time::timeout(self.ack_timeout, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("host ack timeout for {}", cmd.as_str()))?
            .map_err(|_| anyhow::anyhow!("host reply channel dropped for {}", cmd.as_str()))?
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Wire a handle to an already-open pair of pipes.
pub fn start_io_tasks<W, R>(writer: W, reader: R, ack_timeout: Duration) -> HostHandle
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    let pending: Pending = Arc::new(Mutex::new(VecDeque::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingCommand>(16);
    tokio::spawn(writer_task(writer, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending));
    HostHandle {
        tx: cmd_tx,
        ack_timeout,
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the host child process.
pub struct HostDriver {
    program: PathBuf,
    args: Vec<String>,
    ack_timeout: Duration,
    process: Option<tokio::process::Child>,
    handle: Option<HostHandle>,
}

impl HostDriver {
    pub fn new(cfg: &SupervisorConfig) -> Self {
        Self {
            program: cfg.host_program.clone(),
            args: cfg.host_args.clone(),
            ack_timeout: Duration::from_secs(cfg.ack_timeout_secs),
            process: None,
            handle: None,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    pub async fn kill(&mut self) {
        self.handle = None;
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    /// Live handle, spawning a fresh host when the old one died.
    pub async fn handle(&mut self) -> anyhow::Result<HostHandle> {
        let usable = self.process_alive() && self.handle.as_ref().map_or(false, |h| !h.is_closed());
        if !usable {
            self.spawn().await?;
        }
        self.handle
            .clone()
            .ok_or_else(|| anyhow::anyhow!("host handle missing after spawn"))
    }

    async fn spawn(&mut self) -> anyhow::Result<()> {
        self.kill().await;
        let program = if self.program.as_os_str().is_empty() {
            platform::find_host_binary()
                .ok_or_else(|| anyhow::anyhow!("native host binary not found"))?
        } else {
            self.program.clone()
        };
        info!("supervisor: spawning {}", program.display());
        let mut child = tokio::process::Command::new(&program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("host stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("host stdout unavailable"))?;
        self.process = Some(child);
        self.handle = Some(start_io_tasks(stdin, stdout, self.ack_timeout));
        Ok(())
    }
}

/// [`Supervisor`] backed by a long-lived native-messaging host.
pub struct NativeHostSupervisor {
    driver: Mutex<HostDriver>,
}

impl NativeHostSupervisor {
    pub fn new(cfg: &SupervisorConfig) -> Self {
        Self {
            driver: Mutex::new(HostDriver::new(cfg)),
        }
    }
}

#[async_trait]
impl Supervisor for NativeHostSupervisor {
    async fn command(&self, cmd: SupervisorCommand) -> anyhow::Result<SupervisorAck> {
        let mut driver = self.driver.lock().await;
        let handle = driver.handle().await?;
        match handle.send(cmd).await {
            Ok(ack) => {
                if !ack.ok {
                    warn!(
                        "supervisor: {} refused: {}",
                        cmd.as_str(),
                        ack.error.as_deref().unwrap_or("no reason given")
                    );
                }
                Ok(ack)
            }
            Err(e) => {
                // Respawn on the next command.
                driver.kill().await;
                Err(e)
            }
        }
    }
}

// ── io tasks ──────────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingCommand>, pending: Pending)
where
    W: AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Queue the reply slot before writing so the reader can match it.
        pending.lock().await.push_back(req.reply);
        debug!("supervisor writer: send {}", req.cmd.as_str());
        let written = async {
            writer.write_all(&req.frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!("supervisor writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.pop_back() {
                let _ = tx.send(Err(anyhow::anyhow!("host write error: {}", e)));
            }
            break;
        }
    }
    debug!("supervisor writer: task exiting");
}

async fn reader_task<R>(mut reader: R, pending: Pending)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader).await {
            Ok(body) => {
                let ack = serde_json::from_slice::<SupervisorAck>(&body)
                    .map_err(|e| anyhow::anyhow!("bad host reply: {}", e));
                match pending.lock().await.pop_front() {
                    Some(tx) => {
                        let _ = tx.send(ack);
                    }
                    None => debug!("supervisor reader: unsolicited frame ignored"),
                }
            }
            Err(e) => {
                debug!("supervisor reader: {}", e);
                break;
            }
        }
    }
    for tx in pending.lock().await.drain(..) {
        let _ = tx.send(Err(anyhow::anyhow!("host closed its output")));
    }
    debug!("supervisor reader: task exiting");
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = frame_len(header)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
