use crate::{BillingClient, BillingError, Result};
use agentbox_common::Tier;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balance: u64,
    tier: Tier,
}

#[derive(Debug, Serialize)]
struct DebitBody<'a> {
    tokens: u64,
    reason: &'a str,
}

#[derive(Debug, Deserialize)]
struct InsufficientBody {
    required: u64,
    available: u64,
}

/// Client for the external billing service.
///
/// * `GET  {base}/v1/accounts/{user}` returns `{balance, tier}`
/// * `POST {base}/v1/accounts/{user}/debits` with `{tokens, reason}`;
///   `402` carries `{required, available}`
#[derive(Clone, Debug)]
pub struct HttpBillingClient {
    client: Client,
    base_url: Url,
}

impl HttpBillingClient {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BillingError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BillingError::InvalidResponse(format!("base URL {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn account(&self, user_id: &str) -> Result<AccountResponse> {
        let url = self.endpoint(&["v1", "accounts", user_id])?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BillingError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(BillingError::AccountNotFound(user_id.to_string())),
            status if status.is_success() => response
                .json::<AccountResponse>()
                .await
                .map_err(|e| BillingError::InvalidResponse(e.to_string())),
            status => Err(BillingError::Unavailable(format!(
                "account lookup returned {status}"
            ))),
        }
    }
}

#[async_trait]
impl BillingClient for HttpBillingClient {
    async fn get_balance(&self, user_id: &str) -> Result<u64> {
        Ok(self.account(user_id).await?.balance)
    }

    async fn get_tier(&self, user_id: &str) -> Result<Tier> {
        Ok(self.account(user_id).await?.tier)
    }

    #[instrument(skip(self))]
    async fn debit(&self, user_id: &str, tokens: u64, reason: &str) -> Result<()> {
        let url = self.endpoint(&["v1", "accounts", user_id, "debits"])?;
        let response = self
            .client
            .post(url)
            .json(&DebitBody { tokens, reason })
            .send()
            .await
            .map_err(|e| BillingError::Unavailable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                debug!(tokens, "debit accepted");
                Ok(())
            }
            StatusCode::PAYMENT_REQUIRED => {
                let body = response
                    .json::<InsufficientBody>()
                    .await
                    .map_err(|e| BillingError::InvalidResponse(e.to_string()))?;
                Err(BillingError::InsufficientBalance {
                    required: body.required,
                    available: body.available,
                })
            }
            StatusCode::NOT_FOUND => Err(BillingError::AccountNotFound(user_id.to_string())),
            status => {
                warn!(%status, "debit rejected by billing service");
                Err(BillingError::Unavailable(format!("debit returned {status}")))
            }
        }
    }
}
