//! HTTP Bank Registry client
//!
//! `GET {base_url}/banks/{bank_id}` returning a JSON bank document. Transport
//! and status errors are mapped to failure categories at the source so the
//! circuit breaker and recovery service never inspect message text.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::ingestion::{
    BankId, BankInfo, BankRegistryClient, BankStatus, FailureCategory, IngestionError,
};

const SERVICE: &str = "bank-registry";

/// Registry response body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BankDto {
    bank_id: String,
    bank_name: String,
    bank_country: String,
    status: String,
    last_updated: DateTime<Utc>,
}

impl BankDto {
    fn into_domain(self, requested: &BankId) -> Result<BankInfo, IngestionError> {
        if self.bank_id != requested.as_str() {
            return Err(IngestionError::dependency(
                SERVICE,
                FailureCategory::Unknown,
                format!(
                    "registry answered for {} when asked for {}",
                    self.bank_id, requested
                ),
            ));
        }
        let status = BankStatus::from_str_opt(&self.status.to_ascii_uppercase()).ok_or_else(|| {
            IngestionError::dependency(
                SERVICE,
                FailureCategory::Unknown,
                format!("unknown bank status '{}'", self.status),
            )
        })?;
        Ok(BankInfo::new(
            requested.clone(),
            self.bank_name,
            self.bank_country,
            status,
            self.last_updated,
        ))
    }
}

/// Reqwest-backed registry client
pub struct HttpBankRegistryClient {
    client: Client,
    base_url: String,
}

impl HttpBankRegistryClient {
    /// # Errors
    ///
    /// Returns an error when the reqwest client cannot be constructed.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn bank_url(&self, bank_id: &BankId) -> String {
        format!("{}/banks/{}", self.base_url, bank_id)
    }
}

#[async_trait]
impl BankRegistryClient for HttpBankRegistryClient {
    async fn fetch(&self, bank_id: &BankId) -> Result<BankInfo, IngestionError> {
        let url = self.bank_url(bank_id);
        debug!(bank_id = %bank_id, url = %url, "Fetching bank info");

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(IngestionError::BankNotFound(bank_id.clone()));
        }
        if !status.is_success() {
            return Err(map_status_error(status));
        }

        let body = response.bytes().await.map_err(map_transport_error)?;
        parse_bank(body.as_ref(), bank_id)
    }
}

fn parse_bank(body: &[u8], bank_id: &BankId) -> Result<BankInfo, IngestionError> {
    let dto: BankDto = serde_json::from_slice(body).map_err(|e| {
        IngestionError::dependency(
            SERVICE,
            FailureCategory::Unknown,
            format!("invalid registry payload: {}", e),
        )
    })?;
    dto.into_domain(bank_id)
}

fn map_transport_error(error: reqwest::Error) -> IngestionError {
    let category = if error.is_timeout() {
        FailureCategory::Timeout
    } else if error.is_connect() {
        FailureCategory::Connection
    } else if error.is_builder() {
        FailureCategory::Unknown
    } else {
        FailureCategory::Network
    };
    IngestionError::dependency(SERVICE, category, error.to_string())
}

fn map_status_error(status: StatusCode) -> IngestionError {
    let category = match status {
        StatusCode::UNAUTHORIZED => FailureCategory::Authentication,
        StatusCode::FORBIDDEN => FailureCategory::Authorization,
        StatusCode::TOO_MANY_REQUESTS => FailureCategory::Throttling,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => FailureCategory::Timeout,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => FailureCategory::Unavailable,
        s if s.is_server_error() => FailureCategory::Temporary,
        _ => FailureCategory::Unknown,
    };
    IngestionError::dependency(SERVICE, category, format!("registry returned HTTP {}", status))
}
