//! Source of remediation propositions for alerts.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::alert::Alert;
use super::proposition::Proposition;
use crate::error::ServiceError;
use crate::scheduler::Payload;
use crate::services::{HttpServiceClient, ServiceClient, ServiceTarget};

const RECOMMENDER_SERVICE: &str = "recommender";

/// Body sent to the recommender for one alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropositionRequest {
    pub failure_description: String,
    pub failure_type: String,
    pub severity: String,
    pub context: Payload,
}

impl From<&Alert> for PropositionRequest {
    fn from(alert: &Alert) -> Self {
        let mut context = alert.metadata.clone();
        context.insert("alert_id".into(), json!(alert.id));
        context.insert("source".into(), json!(alert.source));
        Self {
            failure_description: alert.description.clone(),
            failure_type: alert.alert_type.as_str().to_string(),
            severity: alert.severity.clone(),
            context,
        }
    }
}

impl PropositionRequest {
    fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("failure_description".into(), json!(self.failure_description));
        payload.insert("failure_type".into(), json!(self.failure_type));
        payload.insert("severity".into(), json!(self.severity));
        payload.insert("context".into(), Value::Object(self.context.clone()));
        payload
    }
}

#[derive(Debug, Deserialize)]
struct PropositionResponse {
    #[serde(default)]
    actions: Vec<Proposition>,
}

/// Produces candidate propositions for an alert.
#[async_trait]
pub trait Recommender: Send + Sync {
    async fn propositions(&self, request: &PropositionRequest) -> Result<Vec<Proposition>, ServiceError>;
}

/// Recommender returning a fixed list, used when no recommender is
/// configured.
#[derive(Debug, Clone, Default)]
pub struct StaticRecommender {
    propositions: Vec<Proposition>,
}

impl StaticRecommender {
    pub fn new(propositions: Vec<Proposition>) -> Self {
        Self { propositions }
    }
}

#[async_trait]
impl Recommender for StaticRecommender {
    async fn propositions(&self, _request: &PropositionRequest) -> Result<Vec<Proposition>, ServiceError> {
        Ok(self.propositions.clone())
    }
}

/// Recommender reached over HTTP at `POST {base_url}/propositions`.
pub struct HttpRecommender {
    client: HttpServiceClient,
    target: ServiceTarget,
}

impl HttpRecommender {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: HttpServiceClient::with_timeout(timeout)?,
            target: ServiceTarget::new(RECOMMENDER_SERVICE, base_url),
        })
    }
}

#[async_trait]
impl Recommender for HttpRecommender {
    async fn propositions(&self, request: &PropositionRequest) -> Result<Vec<Proposition>, ServiceError> {
        let body = self
            .client
            .call(&self.target, "propositions", &request.to_payload())
            .await?;
        parse_propositions(body)
    }
}

fn parse_propositions(body: Value) -> Result<Vec<Proposition>, ServiceError> {
    serde_json::from_value::<PropositionResponse>(body)
        .map(|response| response.actions)
        .map_err(|e| ServiceError::InvalidResponse {
            service: RECOMMENDER_SERVICE.to_string(),
            message: e.to_string(),
        })
}
