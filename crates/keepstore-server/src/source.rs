//! Fetches blocks from peer keepstore servers over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use keepstore::{BlockSource, KeepError, KeepResult, Locator, BLOCK_SIZE};
use reqwest::{Client, StatusCode};
use tracing::debug;

/// [`BlockSource`] backed by an HTTP client.
#[derive(Debug, Clone)]
pub struct HttpBlockSource {
    client: Client,
}

impl HttpBlockSource {
    /// Client with a per-request `timeout`.
    pub fn new(timeout: Duration) -> KeepResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KeepError::Config {
                reason: format!("http client: {}", e),
            })?;
        Ok(Self { client })
    }
}

/// URL of `locator` on `server`. Servers given without a scheme use http.
pub fn block_url(server: &str, locator: &str) -> String {
    let server = server.trim_end_matches('/');
    if server.starts_with("http://") || server.starts_with("https://") {
        format!("{}/{}", server, locator)
    } else {
        format!("http://{}/{}", server, locator)
    }
}

/// Largest body accepted for `locator`: its size hint, never more than one block.
pub fn body_limit(locator: &str) -> usize {
    Locator::parse(locator)
        .ok()
        .and_then(|l| l.size)
        .map_or(BLOCK_SIZE, |size| size.min(BLOCK_SIZE as u64) as usize)
}

#[async_trait]
impl BlockSource for HttpBlockSource {
    async fn fetch(&self, server: &str, locator: &str, token: &str) -> KeepResult<Vec<u8>> {
        let url = block_url(server, locator);
        let fail = |reason: String| KeepError::Fetch {
            server: server.to_string(),
            reason,
        };

        let mut request = self.client.get(&url);
        if !token.is_empty() {
            request = request.bearer_auth(token);
        }
        let mut response = request.send().await.map_err(|e| fail(e.to_string()))?;
        match response.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => return Err(KeepError::not_found(&locator[..locator.len().min(32)])),
            s => return Err(fail(format!("status {}", s))),
        }

        let limit = body_limit(locator);
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(fail(format!("body exceeds {} bytes", limit)));
        }
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| fail(e.to_string()))? {
            if body.len() + chunk.len() > limit {
                return Err(fail(format!("body exceeds {} bytes", limit)));
            }
            body.extend_from_slice(&chunk);
        }
        debug!(server, size = body.len(), "fetched block");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_url() {
        let loc = "acbd18db4cc2f85cedef654fccc4a4d8+3";
        assert_eq!(block_url("keep0:25107", loc), format!("http://keep0:25107/{}", loc));
        assert_eq!(block_url("https://keep0/", loc), format!("https://keep0/{}", loc));
    }

    #[test]
    fn test_body_limit() {
        assert_eq!(body_limit("acbd18db4cc2f85cedef654fccc4a4d8+3"), 3);
        assert_eq!(body_limit("acbd18db4cc2f85cedef654fccc4a4d8"), BLOCK_SIZE);
        assert_eq!(body_limit("acbd18db4cc2f85cedef654fccc4a4d8+999999999"), BLOCK_SIZE);
    }

    /// Serve one HTTP response with `body` on a local port.
    async fn serve_once(body: &'static [u8]) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(body).await;
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn test_fetch_rejects_oversized_body() {
        let server = serve_once(b"0123456789").await;
        let source = HttpBlockSource::new(Duration::from_secs(5)).unwrap();
        let err = source
            .fetch(&server, "acbd18db4cc2f85cedef654fccc4a4d8+3", "")
            .await
            .unwrap_err();
        assert!(matches!(err, KeepError::Fetch { .. }));
    }

    #[tokio::test]
    async fn test_fetch_body_within_limit() {
        let server = serve_once(b"foo").await;
        let source = HttpBlockSource::new(Duration::from_secs(5)).unwrap();
        let data = source
            .fetch(&server, "acbd18db4cc2f85cedef654fccc4a4d8+3", "")
            .await
            .unwrap();
        assert_eq!(data, b"foo");
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let source = HttpBlockSource::new(Duration::from_millis(500)).unwrap();
        let err = source
            .fetch("127.0.0.1:1", "acbd18db4cc2f85cedef654fccc4a4d8+3", "tok")
            .await
            .unwrap_err();
        assert!(matches!(err, KeepError::Fetch { .. }));
    }
}
