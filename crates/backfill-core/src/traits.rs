use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::{Fields, Record, UpdateBatch};
use crate::predicate::Predicate;

/// Document store holding the records to enrich.
///
/// Implementations never promise atomicity beyond a single document; a bulk
/// update may apply partially and in any order.
pub trait RecordStore: Send + Sync + Clone {
    /// Count documents currently matching `predicate`.
    fn count_matching(
        &self,
        predicate: &Predicate,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Up to `limit` matching documents with an ID greater than `after`,
    /// ordered by ID.
    fn select_matching(
        &self,
        predicate: &Predicate,
        after: Option<&str>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Record>, AppError>> + Send;

    /// Merge each item's fields into its document. Returns the number of
    /// documents matched.
    fn bulk_update(
        &self,
        batch: &UpdateBatch,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Merge `fields` into one document. Returns false if no document matched.
    fn update_one(
        &self,
        id: &str,
        fields: &Fields,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;
}

/// Text generation service.
pub trait Generator: Send + Sync + Clone {
    /// Produce raw text for `prompt`. Internal retries stop when `cancel` fires.
    fn generate(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Renders the prompt sent for one record.
pub trait PromptBuilder: Send + Sync + Clone {
    fn build(&self, record: &Record) -> Result<String, AppError>;
}
