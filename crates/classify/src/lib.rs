//! AI categorization: the classifier port with HTTP and scripted adapters,
//! and the run orchestrator that feeds it pending transactions together with
//! historical pattern matches as context.

pub mod classifier;
pub mod orchestrator;

pub use classifier::{
    Classification, ClassificationRequest, Classifier, ClassifierExample, ClassifyError,
    HttpClassifier, MockClassifier,
};
pub use orchestrator::{CategorizationOutcome, CategorizationRun};
