//! HTTP client for a Jupyter-style kernel gateway.
//!
//! Lifecycle calls use the gateway's REST API. Output arrives as
//! newline-delimited Jupyter messages from `/api/kernels/{id}/messages`.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::protocol::ExecuteRequest;

use super::{GatewayClient, RemoteKernel, RemoteMessages, translate_remote};

/// Gateway client over HTTP.
pub struct HttpGatewayClient {
    http: Client,
    base_url: String,
    auth_token: Option<String>,
    request_timeout: std::time::Duration,
}

impl HttpGatewayClient {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.ping_timeout)
            .build()
            .map_err(|e| Error::Gateway(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.url.clone(),
            auth_token: config.auth_token.clone(),
            request_timeout: config.request_timeout,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        match &self.auth_token {
            Some(token) => builder.header("Authorization", format!("token {}", token)),
            None => builder,
        }
    }

    /// Send a lifecycle request with the request timeout and check its status.
    async fn call(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| Error::Gateway(e.to_string()))?;
        response
            .error_for_status()
            .map_err(|e| Error::Gateway(e.to_string()))
    }

    async fn kernel(&self, response: Response) -> Result<RemoteKernel> {
        response
            .json::<RemoteKernel>()
            .await
            .map_err(|e| Error::Gateway(format!("unexpected kernel payload: {}", e)))
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn ping(&self) -> Result<()> {
        self.call(self.request(Method::GET, "/api")).await?;
        Ok(())
    }

    async fn start_kernel(&self, spec_name: &str) -> Result<RemoteKernel> {
        let response = self
            .call(
                self.request(Method::POST, "/api/kernels")
                    .json(&json!({ "name": spec_name })),
            )
            .await?;
        self.kernel(response).await
    }

    async fn execute(&self, kernel_id: &str, request: &ExecuteRequest) -> Result<()> {
        self.call(
            self.request(Method::POST, &format!("/api/kernels/{}/execute", kernel_id))
                .json(request),
        )
        .await?;
        Ok(())
    }

    async fn interrupt(&self, kernel_id: &str) -> Result<()> {
        self.call(self.request(Method::POST, &format!("/api/kernels/{}/interrupt", kernel_id)))
            .await?;
        Ok(())
    }

    async fn shutdown(&self, kernel_id: &str) -> Result<()> {
        self.call(self.request(Method::DELETE, &format!("/api/kernels/{}", kernel_id)))
            .await?;
        Ok(())
    }

    async fn restart(&self, kernel_id: &str) -> Result<RemoteKernel> {
        let response = self
            .call(self.request(Method::POST, &format!("/api/kernels/{}/restart", kernel_id)))
            .await?;
        self.kernel(response).await
    }

    async fn open_messages(&self, kernel_id: &str, capacity: usize) -> Result<RemoteMessages> {
        // No overall timeout: the stream stays open for the kernel's lifetime.
        let response = self
            .request(Method::GET, &format!("/api/kernels/{}/messages", kernel_id))
            .send()
            .await
            .and_then(Response::error_for_status)
            .map_err(|e| Error::Gateway(e.to_string()))?;

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let kernel_id = kernel_id.to_string();

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();

            'stream: while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!("Gateway stream for kernel {} failed: {}", kernel_id, e);
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let Some(message) = decode_line(&kernel_id, &line) else {
                        continue;
                    };
                    if tx.send(Some(message)).await.is_err() {
                        break 'stream;
                    }
                }
            }

            let _ = tx.send(None).await;
        });

        Ok(rx)
    }
}

fn decode_line(kernel_id: &str, line: &[u8]) -> Option<crate::protocol::KernelMessage> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let parsed = serde_json::from_str::<Value>(text)
        .map_err(|e| Error::Decode(e.to_string()))
        .and_then(translate_remote);
    match parsed {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!("Skipping gateway record for kernel {}: {}", kernel_id, e);
            None
        }
    }
}
