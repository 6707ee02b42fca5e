// REST client for the competitions API.
//
// Every state-mutating competition intent goes through the server first; the
// confirmed record it returns is what feeds the state machine.

use std::collections::HashSet;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use campus_core::protocol::{
    CompetitionRecord, CompetitionStatus, CreateCompetitionRequest, ProtocolError,
    UpdateCompetitionRequest,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("unexpected response body: {0}")]
    Protocol(#[from] ProtocolError),
}

/// The competitions REST collaborator.
#[async_trait]
pub trait CompetitionApi: Send + Sync + 'static {
    /// Create a challenge from `request.sender_id` to `request.receiver_id`.
    async fn create(
        &self,
        request: &CreateCompetitionRequest,
    ) -> Result<CompetitionRecord, ApiError>;

    /// Move competition `id` to `status`. Rejecting and cancelling both send
    /// `none`.
    async fn update_status(
        &self,
        id: &str,
        status: CompetitionStatus,
    ) -> Result<CompetitionRecord, ApiError>;

    /// Every competition `user_id` sent or received.
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<CompetitionRecord>, ApiError>;

    /// Use `token` for every request from now on.
    fn set_token(&self, token: &str);
}

// ---------------------------------------------------------------------------
// HttpCompetitionApi
// ---------------------------------------------------------------------------

pub struct HttpCompetitionApi {
    http: reqwest::Client,
    base_url: String,
    token: RwLock<String>,
}

impl HttpCompetitionApi {
    pub fn new(base_url: &str, token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(token),
        }
    }

    fn token(&self) -> String {
        match self.token.read() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/api/competitions/", self.base_url)
    }

    fn item_url(&self, id: &str) -> String {
        format!("{}/api/competitions/{id}/", self.base_url)
    }

    async fn list_by(&self, role: &str, user_id: &str) -> Result<Vec<CompetitionRecord>, ApiError> {
        let response = self
            .http
            .get(self.collection_url())
            .bearer_auth(self.token())
            .query(&[(role, user_id)])
            .send()
            .await?;
        let body = read_json(response).await?;

        // Plain arrays and paginated `{ "results": [...] }` bodies both occur.
        let items = match body {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("results") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };

        let mut records = Vec::with_capacity(items.len());
        for item in items {
            match CompetitionRecord::from_value(item) {
                Ok(record) => records.push(record),
                Err(e) => warn!(role, error = %e, "skipping malformed competition in listing"),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl CompetitionApi for HttpCompetitionApi {
    async fn create(
        &self,
        request: &CreateCompetitionRequest,
    ) -> Result<CompetitionRecord, ApiError> {
        debug!(receiver = %request.receiver_id, "creating competition");
        let response = self
            .http
            .post(self.collection_url())
            .bearer_auth(self.token())
            .json(request)
            .send()
            .await?;
        Ok(CompetitionRecord::from_value(read_json(response).await?)?)
    }

    async fn update_status(
        &self,
        id: &str,
        status: CompetitionStatus,
    ) -> Result<CompetitionRecord, ApiError> {
        debug!(id, %status, "updating competition status");
        let response = self
            .http
            .patch(self.item_url(id))
            .bearer_auth(self.token())
            .json(&UpdateCompetitionRequest { status })
            .send()
            .await?;
        Ok(CompetitionRecord::from_value(read_json(response).await?)?)
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<CompetitionRecord>, ApiError> {
        let mut records = self.list_by("sender", user_id).await?;
        records.extend(self.list_by("receiver", user_id).await?);

        let mut seen = HashSet::new();
        records.retain(|r| seen.insert(r.id.clone()));
        Ok(records)
    }

    fn set_token(&self, token: &str) {
        let mut current = match self.token.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = token.to_owned();
    }
}

/// Decode a JSON body, turning non-2xx responses into `ApiError::Status`.
async fn read_json(response: reqwest::Response) -> Result<Value, ApiError> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            detail: error_detail(&text),
        });
    }
    Ok(response.json::<Value>().await?)
}

/// The backend reports failures as `{"detail": "..."}`; fall back to the raw
/// body otherwise.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| body.trim().to_string())
}
