//! HTTP client for the backend's "all user history" endpoint.

use crate::config::Config;
use tracing::debug;

pub struct HistoryClient {
    http: reqwest::Client,
    url: String,
    api_token: Option<String>,
}

impl HistoryClient {
    pub fn new(config: &Config) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            url: config.history_url(),
            api_token: config.api_token.clone(),
        })
    }

    /// Request URL for a user's history
    pub fn request_url(&self, user_id: Option<&str>) -> String {
        match user_id {
            Some(id) => format!("{}?user_id={}", self.url, urlencoding::encode(id)),
            None => self.url.clone(),
        }
    }

    /// Fetch the raw history payload
    pub async fn fetch_all(
        &self,
        user_id: Option<&str>,
    ) -> Result<serde_json::Value, Box<dyn std::error::Error + Send + Sync>> {
        let url = self.request_url(user_id);
        debug!("Fetching chat history from {}", url);

        let mut request = self.http.get(&url).header("accept", "application/json");
        if let Some(ref token) = self.api_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("History API error {}: {}", status, body).into());
        }

        let body: serde_json::Value = response.json().await?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_url_encodes_user_id() {
        let config = Config {
            api_url: "http://backend:8000".to_string(),
            ..Config::default()
        };
        let client = HistoryClient::new(&config).unwrap();
        assert_eq!(
            client.request_url(Some("ana maría@corp")),
            "http://backend:8000/get_all_user_history?user_id=ana%20mar%C3%ADa%40corp"
        );
        assert_eq!(client.request_url(None), "http://backend:8000/get_all_user_history");
    }

    async fn spawn_upstream(upstream: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, upstream).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_fetch_all_rejects_error_status() {
        let upstream = axum::Router::new().route(
            "/get_all_user_history",
            axum::routing::get(|| async { (axum::http::StatusCode::UNAUTHORIZED, "bad token") }),
        );
        let config = Config {
            api_url: spawn_upstream(upstream).await,
            ..Config::default()
        };
        let client = HistoryClient::new(&config).unwrap();

        let err = client.fetch_all(Some("u1")).await.unwrap_err().to_string();
        assert!(err.contains("401"));
        assert!(err.contains("bad token"));
    }

    #[tokio::test]
    async fn test_fetch_all_sends_user_and_token() {
        use axum::extract::Query;
        use axum::http::HeaderMap;
        use std::collections::HashMap;

        let upstream = axum::Router::new().route(
            "/get_all_user_history",
            axum::routing::get(|headers: HeaderMap, Query(params): Query<HashMap<String, String>>| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                axum::Json(serde_json::json!({"auth": auth, "user": params.get("user_id")}))
            }),
        );
        let config = Config {
            api_url: spawn_upstream(upstream).await,
            api_token: Some("secret".to_string()),
            ..Config::default()
        };
        let client = HistoryClient::new(&config).unwrap();

        let body = client.fetch_all(Some("u 1")).await.unwrap();
        assert_eq!(body["auth"], "Bearer secret");
        assert_eq!(body["user"], "u 1");
    }
}
