use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{LedgerClient, LedgerError, TransferStatus};

/// JSON-RPC gateway to the ledger
pub struct RpcLedgerClient {
    rpc_url: String,
    http: Client,
}

impl RpcLedgerClient {
    pub fn new(rpc_url: String, request_timeout: Duration) -> Result<Self, LedgerError> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { rpc_url, http })
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let response = self
            .http
            .post(&self.rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": "empowergrid-release",
                "method": method,
                "params": params,
            }))
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;

        if let Some(message) = response
            .pointer("/error/message")
            .and_then(|v| v.as_str())
        {
            return Err(LedgerError::Rejected(message.to_string()));
        }
        Ok(response)
    }
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    async fn submit_transfer(
        &self,
        release_id: Uuid,
        recipient: &str,
        amount: i64,
    ) -> Result<String, LedgerError> {
        let response = self
            .rpc_call(
                "submitTransfer",
                json!({
                    "idempotencyKey": release_id,
                    "recipient": recipient,
                    "amount": amount,
                }),
            )
            .await?;

        response
            .pointer("/result/reference")
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| LedgerError::Malformed("missing transfer reference".to_string()))
    }

    async fn get_transfer_status(&self, reference: &str) -> Result<TransferStatus, LedgerError> {
        let response = self
            .rpc_call("getTransferStatus", json!({ "reference": reference }))
            .await?;
        parse_status(&response)
    }
}

fn parse_status(response: &Value) -> Result<TransferStatus, LedgerError> {
    let status = response
        .pointer("/result/status")
        .and_then(|v| v.as_str())
        .ok_or_else(|| LedgerError::Malformed("missing transfer status".to_string()))?;

    match status.to_ascii_lowercase().as_str() {
        "pending" | "submitted" => Ok(TransferStatus::Pending),
        "confirmed" | "success" => Ok(TransferStatus::Confirmed),
        "failed" => Ok(TransferStatus::Failed(
            response
                .pointer("/result/error")
                .and_then(|v| v.as_str())
                .unwrap_or("transfer failed")
                .to_string(),
        )),
        other => Err(LedgerError::Malformed(format!("unknown status {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing() {
        let confirmed = json!({ "result": { "status": "CONFIRMED" } });
        assert_eq!(parse_status(&confirmed).unwrap(), TransferStatus::Confirmed);

        let failed = json!({ "result": { "status": "failed", "error": "insufficient escrow" } });
        assert_eq!(
            parse_status(&failed).unwrap(),
            TransferStatus::Failed("insufficient escrow".into())
        );

        assert!(parse_status(&json!({ "result": {} })).is_err());
        assert!(parse_status(&json!({ "result": { "status": "weird" } })).is_err());
    }
}
