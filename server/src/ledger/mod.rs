//! Contract with the external ledger that moves escrowed funds

mod rpc;
mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use rpc::RpcLedgerClient;
pub use simulated::SimulatedLedger;

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("ledger transport error: {0}")]
    Transport(String),
    #[error("ledger rejected transfer: {0}")]
    Rejected(String),
    #[error("malformed ledger response: {0}")]
    Malformed(String),
    #[error("ledger call timed out")]
    Timeout,
}

impl From<reqwest::Error> for LedgerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LedgerError::Timeout
        } else {
            LedgerError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Confirmed,
    Failed(String),
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit a transfer and return its external reference. `release_id` is
    /// passed through as the idempotency key.
    async fn submit_transfer(
        &self,
        release_id: Uuid,
        recipient: &str,
        amount: i64,
    ) -> Result<String, LedgerError>;

    async fn get_transfer_status(&self, reference: &str) -> Result<TransferStatus, LedgerError>;
}
