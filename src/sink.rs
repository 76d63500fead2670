use std::path::{Path, PathBuf};

use anyhow::Context;
use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Item placed on the sink queue: a payload to write, or one of the two
/// control tokens.
#[derive(Debug, Clone)]
pub enum SinkMessage {
    Payload { range: String, bytes: Bytes },
    Reset,
    Last,
}

/// Consumes ordered piece buffers; supports `reset` and `finish` signals.
/// A handle wraps an `mpsc::Sender`, with the worker task itself owning the
/// file handles.
pub trait PieceSink: Send + 'static {
    fn handle_message(
        &mut self,
        message: SinkMessage,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;

    /// Whether the sink used a temporary path instead of `client_file_path`
    /// directly (exposed after join).
    fn across_write(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct SinkHandle {
    pub message_tx: mpsc::Sender<SinkMessage>,
}

impl SinkHandle {
    pub async fn send(&self, message: SinkMessage) -> anyhow::Result<()> {
        self.message_tx
            .send(message)
            .await
            .context("sink worker has shut down")
    }
}

/// Spawns `sink`'s message loop on `task_tracker`, returning a handle and a
/// join future that resolves once `Last` has been processed (or the
/// cancellation token fires).
pub fn spawn<S: PieceSink>(
    mut sink: S,
    queue_capacity: usize,
    task_tracker: &TaskTracker,
    cancellation_token: CancellationToken,
) -> (SinkHandle, tokio::sync::oneshot::Receiver<anyhow::Result<bool>>) {
    let (message_tx, mut message_rx) = mpsc::channel(queue_capacity.max(1));
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    task_tracker.spawn(async move {
        let result = loop {
            tokio::select! {
                Some(message) = message_rx.recv() => {
                    let is_last = matches!(message, SinkMessage::Last);
                    if let Err(e) = sink.handle_message(message).await {
                        break Err(e);
                    }
                    if is_last {
                        break Ok(sink.across_write());
                    }
                }
                _ = cancellation_token.cancelled() => {
                    break Err(anyhow::anyhow!("sink cancelled before completion"));
                }
                else => break Err(anyhow::anyhow!("sink queue closed unexpectedly")),
            }
        };
        let _ = done_tx.send(result);
    });
    (SinkHandle { message_tx }, done_rx)
}

/// File-backed `PieceSink`: writes payloads at their byte-range offset into
/// `client_file_path`, and on `Last` hardlinks (falling back to copy)
/// `service_file_path` from it.
#[derive(Debug)]
pub struct FileSink {
    client_file_path: PathBuf,
    service_file_path: PathBuf,
    file: Option<fs::File>,
    across_write: bool,
}

impl FileSink {
    pub fn new(client_file_path: impl Into<PathBuf>, service_file_path: impl Into<PathBuf>) -> Self {
        Self {
            client_file_path: client_file_path.into(),
            service_file_path: service_file_path.into(),
            file: None,
            across_write: false,
        }
    }

    async fn file(&mut self) -> anyhow::Result<&mut fs::File> {
        if self.file.is_none() {
            if let Some(parent) = self.client_file_path.parent() {
                fs::create_dir_all(parent).await.context("create save directory")?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&self.client_file_path)
                .await
                .context("open client file")?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut().expect("just inserted"))
    }

    /// `"start-end"` -> `(start, length)`.
    fn parse_range(range: &str) -> anyhow::Result<(u64, u64)> {
        let (start, end) = range
            .split_once('-')
            .with_context(|| format!("malformed range {range:?}"))?;
        let start: u64 = start.parse().with_context(|| format!("bad range start in {range:?}"))?;
        let end: u64 = end.parse().with_context(|| format!("bad range end in {range:?}"))?;
        anyhow::ensure!(end >= start, "range end before start in {range:?}");
        Ok((start, end - start + 1))
    }

    async fn write_payload(&mut self, range: &str, bytes: &Bytes) -> anyhow::Result<()> {
        let (offset, length) = Self::parse_range(range)?;
        anyhow::ensure!(
            length as usize == bytes.len(),
            "range {range} declares {length} bytes but payload has {}",
            bytes.len()
        );
        let file = self.file().await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(bytes).await?;
        Ok(())
    }

    async fn finalize(&mut self) -> anyhow::Result<()> {
        if let Some(file) = &mut self.file {
            file.flush().await?;
        }
        if !self.client_file_path.exists() {
            return Ok(());
        }
        match fs::hard_link(&self.client_file_path, &self.service_file_path).await {
            Ok(()) => {}
            Err(e) => {
                tracing::debug!("Hardlink failed ({e}), falling back to copy for service file");
                fs::copy(&self.client_file_path, &self.service_file_path)
                    .await
                    .context("copy client file to service file")?;
                self.across_write = true;
            }
        }
        Ok(())
    }
}

impl PieceSink for FileSink {
    async fn handle_message(&mut self, message: SinkMessage) -> anyhow::Result<()> {
        match message {
            SinkMessage::Payload { range, bytes } => self.write_payload(&range, &bytes).await,
            SinkMessage::Reset => {
                tracing::info!("Resetting sink: piece size renegotiated");
                if let Some(file) = self.file.take() {
                    drop(file);
                }
                if self.client_file_path.exists() {
                    fs::remove_file(&self.client_file_path)
                        .await
                        .context("remove client file on reset")?;
                }
                Ok(())
            }
            SinkMessage::Last => self.finalize().await,
        }
    }

    fn across_write(&self) -> bool {
        self.across_write
    }
}

/// Moves (or copies, across filesystems) the assembled file to its final
/// target location, verifying an optional checksum first.
pub async fn move_to_target(
    from: &Path,
    target: &Path,
    expected_sha256: Option<&str>,
) -> anyhow::Result<()> {
    if let Some(expected) = expected_sha256 {
        verify_checksum(from, expected).await?;
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await.context("create target directory")?;
    }
    match fs::rename(from, target).await {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, target).await.context("copy to target file")?;
            fs::remove_file(from).await.ok();
            Ok(())
        }
    }
}

async fn verify_checksum(path: &Path, expected_sha256: &str) -> anyhow::Result<()> {
    use sha2::{Digest, Sha256};
    let bytes = fs::read(path).await.context("read file for checksum verification")?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hasher.finalize();
    let actual = hex_encode(&digest);
    anyhow::ensure!(
        actual.eq_ignore_ascii_case(expected_sha256),
        "checksum mismatch: expected {expected_sha256}, got {actual}"
    );
    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
