use std::path::Path;

use anyhow::Context;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;

/// Back-to-source fallback: downloads the whole file directly, bypassing
/// the supernode/peer network entirely.
pub trait SourceDownloader: Send + Sync {
    fn download(
        &self,
        target: &Path,
    ) -> impl std::future::Future<Output = anyhow::Result<u64>> + Send;
}

/// Streams `source_url` straight to `target` in one pass, never buffering
/// the whole body in memory.
#[derive(Debug, Clone)]
pub struct HttpSourceDownloader {
    client: reqwest::Client,
    source_url: String,
}

impl HttpSourceDownloader {
    pub fn new(client: reqwest::Client, source_url: impl Into<String>) -> Self {
        Self {
            client,
            source_url: source_url.into(),
        }
    }
}

impl SourceDownloader for HttpSourceDownloader {
    async fn download(&self, target: &Path) -> anyhow::Result<u64> {
        tracing::info!(url = %self.source_url, "Falling back to back-to-source download");
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.context("create target directory")?;
        }
        let response = self
            .client
            .get(&self.source_url)
            .send()
            .await
            .context("send back-to-source request")?
            .error_for_status()
            .context("source server returned error status")?;

        let mut file = fs::File::create(target).await.context("create back-to-source target file")?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("read back-to-source response chunk")?;
            file.write_all(&chunk).await.context("write back-to-source chunk")?;
            written += chunk.len() as u64;
        }
        file.flush().await.context("flush back-to-source file")?;
        Ok(written)
    }
}
