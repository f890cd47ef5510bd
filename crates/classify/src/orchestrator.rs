use tracing::{debug, info, warn};

use tally_core::{Category, MatcherSettings, ProcessingRunId, ProcessingStatus, Transaction};
use tally_match::{PatternMatch, PatternMatcher};
use tally_retry::RetryPolicy;
use tally_storage::{StoreError, TransactionStore};

use crate::classifier::{
    ClassificationRequest, Classifier, ClassifierExample, ClassifyError,
};

#[derive(Debug, Clone)]
pub struct CategorizationOutcome {
    pub run_id: ProcessingRunId,
    /// Transactions examined, whatever happened to them.
    pub processed: usize,
    pub categorized: usize,
    pub failed: usize,
    /// Left alone because a human already categorized them.
    pub skipped: usize,
    pub messages: Vec<String>,
}

/// Drives one categorization pass over everything sitting at Normalised:
/// historical patterns are gathered as context, the classifier is consulted
/// through the retry policy, and each verdict is persisted one transaction
/// at a time so a failure never takes the batch down with it.
pub struct CategorizationRun<'a, S: TransactionStore, C: Classifier> {
    store: &'a S,
    classifier: &'a C,
    matcher: PatternMatcher,
    policy: RetryPolicy,
    batch_size: usize,
    match_limit: usize,
    run_id: ProcessingRunId,
}

impl<'a, S: TransactionStore, C: Classifier> CategorizationRun<'a, S, C> {
    pub fn new(
        store: &'a S,
        classifier: &'a C,
        settings: &MatcherSettings,
        policy: RetryPolicy,
        batch_size: usize,
        run_id: ProcessingRunId,
    ) -> Self {
        CategorizationRun {
            store,
            classifier,
            matcher: PatternMatcher::new(settings.clone()),
            policy,
            batch_size: batch_size.max(1),
            match_limit: settings.match_limit,
            run_id,
        }
    }

    pub async fn execute(self) -> Result<CategorizationOutcome, StoreError> {
        let mut outcome = CategorizationOutcome {
            run_id: self.run_id.clone(),
            processed: 0,
            categorized: 0,
            failed: 0,
            skipped: 0,
            messages: Vec::new(),
        };

        let categories = self.store.list_categories().await?;
        let pending = self.store.find_by_status(ProcessingStatus::Normalised).await?;
        outcome.processed = pending.len();
        if pending.is_empty() {
            info!(run = %self.run_id, "nothing to categorize");
            return Ok(outcome);
        }
        if categories.is_empty() {
            warn!(run = %self.run_id, "no active categories; skipping all candidates");
            outcome.skipped = pending.len();
            outcome
                .messages
                .push("no active categories defined".to_string());
            return Ok(outcome);
        }

        // One history pool per run: everything already carrying a category.
        let mut history = self.store.find_by_status(ProcessingStatus::Categorised).await?;
        history.extend(pending.iter().filter(|t| t.is_categorized()).cloned());

        for batch in pending.chunks(self.batch_size) {
            debug!(run = %self.run_id, size = batch.len(), "categorizing batch");
            for tx in batch {
                if tx.has_manual_override() {
                    outcome.skipped += 1;
                    continue;
                }
                match self.classify_one(tx, &categories, &history).await {
                    Ok(()) => outcome.categorized += 1,
                    Err(ClassifyOneError::Store(e)) => return Err(e),
                    Err(ClassifyOneError::Classify(message)) => {
                        warn!(reference = %tx.original_transaction_id, %message, "categorization failed");
                        outcome.failed += 1;
                        outcome
                            .messages
                            .push(format!("{}: {message}", tx.original_transaction_id));
                    }
                }
            }
        }

        info!(
            run = %self.run_id,
            processed = outcome.processed,
            categorized = outcome.categorized,
            failed = outcome.failed,
            skipped = outcome.skipped,
            "categorization run finished"
        );
        Ok(outcome)
    }

    /// Clears AI-assigned categories and reruns classification from scratch.
    /// Manual overrides are never unwound.
    pub async fn recategorize_all(self) -> Result<CategorizationOutcome, StoreError> {
        let categorized = self.store.find_by_status(ProcessingStatus::Categorised).await?;
        let mut reset: Vec<Transaction> = Vec::new();
        for mut tx in categorized {
            if tx.has_manual_override() {
                continue;
            }
            tx.reset_ai_category();
            reset.push(tx);
        }
        if !reset.is_empty() {
            self.store.write_batch(&reset).await?;
        }
        info!(run = %self.run_id, reset = reset.len(), "AI categories cleared for reclassification");
        self.execute().await
    }

    async fn classify_one(
        &self,
        tx: &Transaction,
        categories: &[Category],
        history: &[Transaction],
    ) -> Result<(), ClassifyOneError> {
        let matches = self.matcher.find_similar(tx, history, self.match_limit);
        if let Some(suggestion) = self.matcher.suggest_category(&matches) {
            debug!(
                reference = %tx.original_transaction_id,
                category = %suggestion.category.id,
                confidence = suggestion.confidence,
                "historical suggestion"
            );
        }

        let request = ClassificationRequest {
            description: tx.description.clone(),
            amount: tx.reporting_amount.unwrap_or(tx.original_amount),
            currency: tx.original_currency.clone(),
            transaction_type: tx.transaction_type.to_string(),
            categories: categories.to_vec(),
            examples: matches.iter().map(to_example).collect(),
        };

        let classifier = self.classifier;
        let classification = self
            .policy
            .run_if(
                "classify_transaction",
                ClassifyError::is_retryable,
                || classifier.classify(&request),
            )
            .await
            .map_err(|e| ClassifyOneError::Classify(e.to_string()))?;

        // Replays the state machine locally so an out-of-contract verdict is
        // caught before it reaches the store.
        let mut updated = tx.clone();
        updated
            .apply_ai_category(classification.category.clone(), classification.confidence)
            .map_err(|e| ClassifyOneError::Classify(e.to_string()))?;

        self.store
            .update_category(
                &tx.id,
                &classification.category,
                false,
                Some(classification.confidence),
            )
            .await
            .map_err(ClassifyOneError::Store)?;
        Ok(())
    }
}

enum ClassifyOneError {
    Classify(String),
    Store(StoreError),
}

fn to_example(m: &PatternMatch) -> ClassifierExample {
    ClassifierExample {
        description: m.pattern.description.clone(),
        category: m.pattern.category.clone(),
        is_manual: m.pattern.is_manual,
    }
}
