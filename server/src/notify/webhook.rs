use crate::errors::ServerError;
use crate::notify::{EventDelivery, NotificationEvent};
use async_trait::async_trait;
use std::time::Duration;

const USER_AGENT: &str = concat!("livecast/", env!("CARGO_PKG_VERSION"));

/// Posts each event as JSON to a configured url.
pub struct WebhookDelivery {
    url: reqwest::Url,
    client: reqwest::Client,
}

impl WebhookDelivery {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ServerError> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| ServerError::ConfigError(format!("webhook url '{}': {}", url, e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ServerError::ConfigError(format!("webhook client: {}", e)))?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl EventDelivery for WebhookDelivery {
    fn name(&self) -> &str {
        self.url.as_str()
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), ServerError> {
        let res = self
            .client
            .post(self.url.clone())
            .json(event)
            .send()
            .await
            .map_err(|e| ServerError::NetworkError(format!("{}: {}", self.url, e)))?;

        let status = res.status();
        if !status.is_success() {
            return Err(ServerError::RequestError(format!("webhook answered {}", status)));
        }
        Ok(())
    }
}
