use crate::types::{IntentReport, RebalanceIntent};
use async_trait::async_trait;

pub mod paper;

pub use paper::PaperOrderSubsystem;

/// External order collaborator. Receives the intents for one record in
/// deterministic order and answers per intent.
///
/// An `Err` means nothing can be assumed about any intent; the gateway treats
/// it as a failed apply and retries the whole record.
#[async_trait]
pub trait OrderSubsystem: Send + Sync {
    async fn submit(&self, intents: &[RebalanceIntent]) -> anyhow::Result<Vec<IntentReport>>;
}
