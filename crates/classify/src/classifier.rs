use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tally_core::{Category, CategoryRef};

/// Transient failures are worth retrying; a malformed or out-of-contract
/// response is not going to improve on the next attempt.
#[derive(Debug, Clone, Error)]
pub enum ClassifyError {
    #[error("Classifier unavailable: {0}")]
    Transient(String),
    #[error("Classifier response invalid: {0}")]
    Invalid(String),
    #[error("Classifier chose unknown category '{0}'")]
    UnknownCategory(String),
}

impl ClassifyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClassifyError::Transient(_))
    }
}

/// A previously categorized transaction similar to the one being classified,
/// sent along as a few-shot hint.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifierExample {
    pub description: String,
    pub category: CategoryRef,
    pub is_manual: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationRequest {
    pub description: String,
    pub amount: Decimal,
    pub currency: String,
    pub transaction_type: String,
    /// The active taxonomy; the classifier must answer from this list.
    pub categories: Vec<Category>,
    pub examples: Vec<ClassifierExample>,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub category: CategoryRef,
    /// 0-100.
    pub confidence: Decimal,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<Classification, ClassifyError>;
}

// ── HTTP adapter ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    category_id: String,
    confidence: f64,
}

/// Adapter for a hosted classification endpoint:
/// `POST {base}/classify` with the request as JSON, bearer-token auth,
/// answering `{"category_id":"groceries","confidence":92.0}`.
pub struct HttpClassifier {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpClassifier {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(HttpClassifier {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<Classification, ClassifyError> {
        let url = format!("{}/classify", self.base_url);
        tracing::debug!(description = %request.description, "classifying transaction");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| ClassifyError::Transient(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(ClassifyError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(ClassifyError::Invalid(format!("HTTP {status}")));
        }

        let body: ClassifyResponse = response
            .json()
            .await
            .map_err(|e| ClassifyError::Invalid(e.to_string()))?;

        resolve(request, &body.category_id, body.confidence)
    }
}

/// Validates an id/confidence answer against the taxonomy sent with the
/// request.
fn resolve(
    request: &ClassificationRequest,
    category_id: &str,
    confidence: f64,
) -> Result<Classification, ClassifyError> {
    let category = request
        .categories
        .iter()
        .find(|c| c.id == category_id)
        .ok_or_else(|| ClassifyError::UnknownCategory(category_id.to_string()))?;

    if !(0.0..=100.0).contains(&confidence) {
        return Err(ClassifyError::Invalid(format!(
            "confidence {confidence} outside [0, 100]"
        )));
    }
    let confidence = Decimal::from_f64(confidence)
        .ok_or_else(|| ClassifyError::Invalid(format!("unrepresentable confidence {confidence}")))?;

    Ok(Classification {
        category: category.to_ref(),
        confidence,
    })
}

// ── Mock adapter ──────────────────────────────────────────────────────────────

/// Scripted classifier for tests: answers keyed by exact description, an
/// optional run of leading transient failures, and a recording of every
/// request for asserting what context was sent.
#[derive(Default)]
pub struct MockClassifier {
    answers: HashMap<String, (String, f64)>,
    calls: AtomicU32,
    transient_failures: AtomicU32,
    requests: Mutex<Vec<ClassificationRequest>>,
}

impl MockClassifier {
    pub fn new() -> Self {
        MockClassifier::default()
    }

    pub fn with_answer(mut self, description: &str, category_id: &str, confidence: f64) -> Self {
        self.answers
            .insert(description.to_string(), (category_id.to_string(), confidence));
        self
    }

    /// The first `n` calls fail with a transient error.
    pub fn failing_first(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ClassificationRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<Classification, ClassifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ClassifyError::Transient("scripted outage".to_string()));
        }

        match self.answers.get(&request.description) {
            Some((category_id, confidence)) => resolve(request, category_id, *confidence),
            None => Err(ClassifyError::Invalid(format!(
                "no scripted answer for '{}'",
                request.description
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(description: &str) -> ClassificationRequest {
        ClassificationRequest {
            description: description.to_string(),
            amount: Decimal::new(1299, 2),
            currency: "GBP".to_string(),
            transaction_type: "DEBIT".to_string(),
            categories: vec![
                Category::new("groceries", "Groceries", "Food shops"),
                Category::new("transport", "Transport", "Getting around"),
            ],
            examples: Vec::new(),
        }
    }

    #[test]
    fn http_classifier_builds_with_timeout() {
        let classifier = HttpClassifier::new("https://classify.example/", "key");
        assert!(classifier.is_ok());
        assert_eq!(classifier.unwrap().base_url, "https://classify.example");
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(ClassifyError::Transient("503".to_string()).is_retryable());
        assert!(!ClassifyError::Invalid("bad json".to_string()).is_retryable());
        assert!(!ClassifyError::UnknownCategory("x".to_string()).is_retryable());
    }

    #[tokio::test]
    async fn mock_answers_resolve_against_the_taxonomy() {
        let classifier = MockClassifier::new().with_answer("TESCO", "groceries", 92.0);
        let result = classifier.classify(&request("TESCO")).await.unwrap();
        assert_eq!(result.category.id, "groceries");
        assert_eq!(result.category.name, "Groceries");
        assert_eq!(result.confidence, Decimal::from(92));
    }

    #[tokio::test]
    async fn answer_outside_the_taxonomy_is_rejected() {
        let classifier = MockClassifier::new().with_answer("TESCO", "gambling", 92.0);
        assert!(matches!(
            classifier.classify(&request("TESCO")).await,
            Err(ClassifyError::UnknownCategory(id)) if id == "gambling"
        ));
    }

    #[tokio::test]
    async fn out_of_range_confidence_is_rejected() {
        let classifier = MockClassifier::new().with_answer("TESCO", "groceries", 120.0);
        assert!(matches!(
            classifier.classify(&request("TESCO")).await,
            Err(ClassifyError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn mock_scripts_failures_and_records_requests() {
        let classifier = MockClassifier::new()
            .with_answer("TESCO", "groceries", 92.0)
            .failing_first(1);

        assert!(matches!(
            classifier.classify(&request("TESCO")).await,
            Err(ClassifyError::Transient(_))
        ));
        classifier.classify(&request("TESCO")).await.unwrap();
        assert_eq!(classifier.call_count(), 2);
        assert_eq!(classifier.requests().len(), 2);
    }
}
