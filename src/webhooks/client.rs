//! HTTP transport for the homebridge-http-webhooks endpoint.
//!
//! Every call is a `GET http://host:port/?accessoryId=..[&state=..|&currentstate=..]`
//! and the plugin answers with a small JSON document.

use crate::config::WebhooksConfig;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;

/// Performs one webhook call.
///
/// The dispatcher owns spacing and the overall timeout; implementations only
/// perform the request and classify failures.
#[async_trait]
pub trait WebhookTransport: Send + Sync + 'static {
    async fn call(&self, accessory_id: &str, params: &[(&'static str, String)]) -> Result<Value>;
}

pub struct HttpTransport {
    http: Client,
    base: Url,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &WebhooksConfig, timeout: Duration) -> Result<Self> {
        let base = Url::parse(&format!("http://{}:{}/", config.host, config.port))
            .map_err(|e| BridgeError::config(format!("invalid webhook address: {}", e)))?;
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| BridgeError::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base,
            timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url_for(&self, params: &[(&'static str, String)]) -> Url {
        let mut url = self.base.clone();
        url.query_pairs_mut()
            .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));
        url
    }
}

fn transport_error(accessory_id: &str, reason: impl Into<String>) -> BridgeError {
    BridgeError::DispatchTransport {
        accessory_id: accessory_id.to_string(),
        reason: reason.into(),
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn call(&self, accessory_id: &str, params: &[(&'static str, String)]) -> Result<Value> {
        let url = self.url_for(params);
        debug!("[Webhook] GET {}", url);

        let response = self.http.get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                BridgeError::DispatchTimeout {
                    accessory_id: accessory_id.to_string(),
                    timeout: self.timeout,
                }
            } else {
                transport_error(
                    accessory_id,
                    format!("HTTP request exception {} for url='{}'", e, url),
                )
            }
        })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(transport_error(
                accessory_id,
                format!("bad status={} for url='{}'", status.as_u16(), url),
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(accessory_id, format!("reading body failed: {}", e)))?;
        serde_json::from_slice(&body)
            .map_err(|e| transport_error(accessory_id, format!("invalid JSON response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_test::{assert_err, assert_ok};

    /// Serve one request with a canned response and hand back the request line.
    async fn serve_once(
        status_line: &'static str,
        body: &'static str,
    ) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let response = format!(
                "{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            request.lines().next().unwrap_or_default().to_string()
        });
        (port, handle)
    }

    fn transport(port: u16) -> HttpTransport {
        let config = WebhooksConfig {
            host: "127.0.0.1".to_string(),
            port,
            delay: 0.4,
        };
        HttpTransport::new(&config, Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_contact_update_request_shape() {
        let (port, server) = serve_once("HTTP/1.1 200 OK", r#"{"success":true}"#).await;
        let transport = transport(port);

        let params = vec![("accessoryId", "zone 1".to_string()), ("state", "true".to_string())];
        let value = assert_ok!(transport.call("zone 1", &params).await);
        assert_eq!(value["success"], Value::Bool(true));

        let request_line = server.await.unwrap();
        assert_eq!(request_line, "GET /?accessoryId=zone+1&state=true HTTP/1.1");
    }

    #[tokio::test]
    async fn test_bad_status_is_transport_error() {
        let (port, server) = serve_once("HTTP/1.1 404 Not Found", "{}").await;
        let transport = transport(port);

        let params = vec![("accessoryId", "zone1".to_string())];
        let err = assert_err!(transport.call("zone1", &params).await);
        assert!(matches!(err, BridgeError::DispatchTransport { .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_body_is_transport_error() {
        let (port, server) = serve_once("HTTP/1.1 200 OK", "not json").await;
        let transport = transport(port);

        let params = vec![("accessoryId", "alarm".to_string())];
        let err = assert_err!(transport.call("alarm", &params).await);
        assert!(matches!(err, BridgeError::DispatchTransport { .. }));
        server.await.unwrap();
    }

    #[test]
    fn test_base_url() {
        let transport = transport(51828);
        assert_eq!(transport.base_url().as_str(), "http://127.0.0.1:51828/");
    }
}
