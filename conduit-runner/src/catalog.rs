//! HTTP action catalog client
//!
//! Reads action definitions from the catalog service:
//! `GET {base_url}/api/v1/namespaces/{namespace}/actions/{name}/versions/{version}`.
//! A 404 is reported as [`CatalogError::NotFound`]; anything else that fails
//! is a transport error and is retried by the caller.

use async_trait::async_trait;
use conduit_core::domain::{Action, ActionRef};
use reqwest::{Client, StatusCode};
use tracing::debug;

pub use conduit_core::{ActionCatalog, CatalogError, StaticActionCatalog};

/// Action catalog served over HTTP
#[derive(Debug, Clone)]
pub struct HttpActionCatalog {
    /// Base URL of the catalog (e.g., "http://catalog:8080")
    base_url: String,
    client: Client,
}

impl HttpActionCatalog {
    /// Create a new catalog client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the catalog service
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new catalog client with a custom HTTP client
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn action_url(&self, namespace: &str, action: &ActionRef) -> String {
        format!(
            "{}/api/v1/namespaces/{}/actions/{}/versions/{}",
            self.base_url, namespace, action.name, action.version
        )
    }
}

#[async_trait]
impl ActionCatalog for HttpActionCatalog {
    async fn describe_action(
        &self,
        namespace: &str,
        action: &ActionRef,
    ) -> Result<Action, CatalogError> {
        let url = self.action_url(namespace, action);
        debug!("Describing action {} from {}", action, url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CatalogError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CatalogError::not_found(namespace, action));
        }

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CatalogError::Transport(format!(
                "HTTP {}: {}",
                status.as_u16(),
                error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| CatalogError::Transport(format!("Failed to parse action: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned response per connection
    async fn serve(status: u16, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8 * 1024];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        format!("http://{}/", addr)
    }

    #[test]
    fn test_action_url() {
        let catalog = HttpActionCatalog::new("http://catalog:8080/");
        let url = catalog.action_url("default", &"build@v2".parse().unwrap());
        assert_eq!(
            url,
            "http://catalog:8080/api/v1/namespaces/default/actions/build/versions/v2"
        );
    }

    #[tokio::test]
    async fn test_describe_action() {
        let base = serve(
            200,
            r#"{"name":"build","version":"v2","runner_type":"docker","runner_params":{"image":"alpine"}}"#,
        )
        .await;
        let catalog = HttpActionCatalog::new(base);

        let action = catalog
            .describe_action("default", &"build@v2".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(action.runner_type, "docker");
        assert_eq!(action.runner_params["image"], "alpine");
        assert!(action.required_params.is_empty());
    }

    #[tokio::test]
    async fn test_not_found_is_distinct_from_transport() {
        let missing = HttpActionCatalog::new(serve(404, "").await);
        let err = missing
            .describe_action("default", &"build@v9".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let broken = HttpActionCatalog::new(serve(503, "down").await);
        let err = broken
            .describe_action("default", &"build@v9".parse().unwrap())
            .await
            .unwrap_err();
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("503"));
    }
}
