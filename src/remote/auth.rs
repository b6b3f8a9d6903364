//! 认证会话获取 - OAuth2 客户端凭据流

use super::RemoteError;
use crate::config::SyncSettings;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// 访问令牌来源抽象,引擎不关心令牌如何获得
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, RemoteError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// 客户端凭据流实现,令牌缓存到临近过期
pub struct ClientCredentials {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    cached: Mutex<Option<CachedToken>>,
}

impl ClientCredentials {
    pub fn new(settings: &SyncSettings) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(super::OP_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            token_url: format!(
                "https://{}/{}/oauth2/v2.0/token",
                settings.login_endpoint, settings.tenant_id
            ),
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            // /.default 表示使用应用已被授予的全部权限
            scope: format!("https://{}/.default", settings.graph_endpoint),
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TokenSource for ClientCredentials {
    async fn access_token(&self) -> Result<String, RemoteError> {
        let mut cached = self.cached.lock().await;

        // 提前 60 秒视为过期,避免请求途中令牌失效
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + Duration::from_secs(60) {
                return Ok(token.value.clone());
            }
        }

        debug!("正在获取访问令牌: {}", self.token_url);

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail: TokenErrorResponse = serde_json::from_str(&body).unwrap_or_else(|_| {
                TokenErrorResponse {
                    error: "unknown_error".to_string(),
                    error_description: body.chars().take(200).collect(),
                }
            });
            tracing::error!("认证失败: {} - {}", detail.error, detail.error_description);
            return Err(RemoteError::Permission { status: status.as_u16() });
        }

        let token: TokenResponse = response.json().await?;
        let value = token.access_token.clone();
        *cached = Some(CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });

        debug!("令牌获取成功,有效期 {} 秒", token.expires_in);
        Ok(value)
    }
}
