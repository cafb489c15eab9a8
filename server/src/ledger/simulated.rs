use std::collections::HashMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{LedgerClient, LedgerError, TransferStatus};

/// Ledger stand-in used when no gateway is configured. Transfers confirm immediately.
#[derive(Default)]
pub struct SimulatedLedger {
    transfers: Mutex<HashMap<String, TransferStatus>>,
}

impl SimulatedLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerClient for SimulatedLedger {
    async fn submit_transfer(
        &self,
        release_id: Uuid,
        recipient: &str,
        amount: i64,
    ) -> Result<String, LedgerError> {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}:{}:{}", release_id, recipient, amount).as_bytes());
        let reference = format!("sim_{}", hex::encode(hasher.finalize()));

        self.transfers
            .lock()
            .await
            .insert(reference.clone(), TransferStatus::Confirmed);
        tracing::info!(%release_id, recipient, amount, reference = %reference, "simulated transfer");
        Ok(reference)
    }

    async fn get_transfer_status(&self, reference: &str) -> Result<TransferStatus, LedgerError> {
        self.transfers
            .lock()
            .await
            .get(reference)
            .cloned()
            .ok_or_else(|| LedgerError::Rejected(format!("unknown reference {}", reference)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn references_are_deterministic_and_confirmed() {
        let ledger = SimulatedLedger::new();
        let id = Uuid::new_v4();
        let first = ledger.submit_transfer(id, "coop-wallet", 5_000).await.unwrap();
        let second = ledger.submit_transfer(id, "coop-wallet", 5_000).await.unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("sim_"));
        assert_eq!(
            ledger.get_transfer_status(&first).await.unwrap(),
            TransferStatus::Confirmed
        );
        assert!(ledger.get_transfer_status("sim_missing").await.is_err());
    }
}
