use anyhow::Context;
use serde::Deserialize;

/// Result of an (initial or migration) registration call.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResult {
    pub node: String,
    pub task_id: String,
    pub piece_size: i32,
    pub file_length: u64,
}

/// Contract for registering (or re-registering, on migration) with a
/// supernode. Out of scope to design beyond the interface; in scope to
/// implement one concrete HTTP transport.
pub trait Registrar: Send + Sync {
    fn register(
        &self,
        peer_port: u16,
    ) -> impl std::future::Future<Output = anyhow::Result<RegisterResult>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpRegistrar {
    client: reqwest::Client,
    registry_url: String,
    file_url: String,
}

impl HttpRegistrar {
    pub fn new(client: reqwest::Client, registry_url: impl Into<String>, file_url: impl Into<String>) -> Self {
        Self {
            client,
            registry_url: registry_url.into(),
            file_url: file_url.into(),
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct RegisterRequest<'a> {
    url: &'a str,
    port: u16,
}

impl Registrar for HttpRegistrar {
    async fn register(&self, peer_port: u16) -> anyhow::Result<RegisterResult> {
        tracing::info!(url = %self.registry_url, "Registering with supernode");
        let response = self
            .client
            .post(&self.registry_url)
            .json(&RegisterRequest {
                url: &self.file_url,
                port: peer_port,
            })
            .send()
            .await
            .context("send register request")?;
        let result: RegisterResult = response.json().await.context("decode register response")?;
        Ok(result)
    }
}
