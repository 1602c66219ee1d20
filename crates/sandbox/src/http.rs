//! HTTP sandbox provider client.
//!
//! Speaks a small REST surface on the provider named by
//! `SANDBOX_PROVIDER_URL`:
//!
//! - `POST   /sandboxes`                  — provision
//! - `POST   /sandboxes/{id}/start|stop`  — lifecycle
//! - `POST   /sandboxes/{id}/exec`        — run a shell command
//! - `GET    /sandboxes/{id}/files?path=` — read
//! - `PUT    /sandboxes/{id}/files?path=` — write
//! - `DELETE /sandboxes/{id}/files?path=` — delete
//! - `GET    /sandboxes/{id}/dir?path=`   — list
//!
//! Provisioning gets one retry within its timeout budget; all other calls
//! fail straight through.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use relay_domain::config::SandboxConfig;
use relay_domain::error::{Error, Result};

use crate::{ExecOutput, FileEntry, SandboxHandle, SandboxProvider};

pub struct HttpSandboxProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    provision_timeout: Duration,
}

impl HttpSandboxProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, provision_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            provision_timeout,
        }
    }

    pub fn from_config(cfg: &SandboxConfig) -> Self {
        Self::new(&cfg.provider_url, &cfg.api_key, cfg.provision_timeout)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::UpstreamTimeout(format!("sandbox provider: {e}"))
                } else {
                    Error::UpstreamFailure(format!("sandbox provider: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamFailure(format!("sandbox provider returned {status}: {text}")));
        }
        Ok(response)
    }

    async fn provision_once(&self, project_id: Uuid) -> Result<SandboxHandle> {
        let response = self
            .send(
                self.client
                    .post(self.url("/sandboxes"))
                    .timeout(self.provision_timeout)
                    .json(&serde_json::json!({ "project_id": project_id })),
            )
            .await?;
        let v: Value = response
            .json()
            .await
            .map_err(|e| Error::UpstreamFailure(format!("decoding sandbox response: {e}")))?;
        let sandbox_id = v
            .get("sandbox_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::UpstreamFailure("sandbox response missing sandbox_id".into()))?;
        Ok(SandboxHandle { sandbox_id: sandbox_id.to_owned() })
    }
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn create(&self, project_id: Uuid) -> Result<SandboxHandle> {
        match self.provision_once(project_id).await {
            Ok(handle) => Ok(handle),
            Err(first) => {
                tracing::warn!(%project_id, error = %first, "sandbox provisioning failed, retrying once");
                self.provision_once(project_id).await
            }
        }
    }

    async fn start(&self, sandbox_id: &str) -> Result<()> {
        self.send(self.client.post(self.url(&format!("/sandboxes/{sandbox_id}/start"))))
            .await?;
        Ok(())
    }

    async fn stop(&self, sandbox_id: &str) -> Result<()> {
        self.send(self.client.post(self.url(&format!("/sandboxes/{sandbox_id}/stop"))))
            .await?;
        Ok(())
    }

    async fn exec(&self, sandbox_id: &str, command: &str) -> Result<ExecOutput> {
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("/sandboxes/{sandbox_id}/exec")))
                    .json(&serde_json::json!({ "command": command })),
            )
            .await?;
        response
            .json()
            .await
            .map_err(|e| Error::UpstreamFailure(format!("decoding exec output: {e}")))
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>> {
        let response = self
            .send(
                self.client
                    .get(self.url(&format!("/sandboxes/{sandbox_id}/files")))
                    .query(&[("path", path)]),
            )
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::UpstreamFailure(format!("reading file body: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn write_file(&self, sandbox_id: &str, path: &str, contents: &[u8]) -> Result<()> {
        self.send(
            self.client
                .put(self.url(&format!("/sandboxes/{sandbox_id}/files")))
                .query(&[("path", path)])
                .body(contents.to_vec()),
        )
        .await?;
        Ok(())
    }

    async fn delete_file(&self, sandbox_id: &str, path: &str) -> Result<()> {
        self.send(
            self.client
                .delete(self.url(&format!("/sandboxes/{sandbox_id}/files")))
                .query(&[("path", path)]),
        )
        .await?;
        Ok(())
    }

    async fn list_dir(&self, sandbox_id: &str, path: &str) -> Result<Vec<FileEntry>> {
        let response = self
            .send(
                self.client
                    .get(self.url(&format!("/sandboxes/{sandbox_id}/dir")))
                    .query(&[("path", path)]),
            )
            .await?;
        response
            .json()
            .await
            .map_err(|e| Error::UpstreamFailure(format!("decoding dir listing: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let p = HttpSandboxProvider::new("https://sbx.test/", "k", Duration::from_secs(30));
        assert_eq!(p.url("/sandboxes"), "https://sbx.test/sandboxes");
    }
}
