use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Kind of measurement a feed reports. Milestone targets are keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedType {
    /// kWh produced
    EnergyProduction,
    /// kg CO2 offset
    Co2Offset,
    Custom(String),
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedType::EnergyProduction => write!(f, "energy_production"),
            FeedType::Co2Offset => write!(f, "co2_offset"),
            FeedType::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

impl FromStr for FeedType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "energy_production" => Ok(FeedType::EnergyProduction),
            "co2_offset" => Ok(FeedType::Co2Offset),
            other => other
                .strip_prefix("custom:")
                .filter(|name| !name.is_empty())
                .map(|name| FeedType::Custom(name.to_string()))
                .ok_or_else(|| format!("unknown feed type: {}", other)),
        }
    }
}

/// A source allowed to report on a feed, with its Ed25519 public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct FeedSource {
    #[validate(length(min = 1, max = 128))]
    pub source_id: String,
    /// Hex (canonical) or base64 encoded 32-byte key
    #[validate(length(min = 43, max = 64))]
    pub public_key: String,
}

/// Oracle feed a project subscribes to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleFeed {
    pub id: Uuid,
    pub project_id: Uuid,
    pub address: String,
    pub feed_type: FeedType,
    pub update_interval_secs: i64,
    pub max_staleness_secs: i64,
    pub min_confidence: f64,
    pub endpoint_url: Option<String>,
    pub sources: Vec<FeedSource>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl OracleFeed {
    pub fn source(&self, source_id: &str) -> Option<&FeedSource> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

/// One reported measurement. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OracleDataPoint {
    pub id: Uuid,
    pub feed_id: Uuid,
    pub source_id: String,
    pub value: f64,
    pub confidence: f64,
    /// Unix seconds as reported by the source
    pub timestamp: i64,
    pub signature: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Reliability history of a reporting source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SourceReliability {
    pub source_id: String,
    pub weight: f64,
    pub observations: i64,
    pub updated_at: DateTime<Utc>,
}

impl SourceReliability {
    pub fn fresh(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            weight: 1.0,
            observations: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Feed subscription request payload
#[derive(Debug, Deserialize, Validate)]
pub struct CreateFeedRequest {
    pub project_id: Uuid,
    #[validate(length(min = 1, max = 256))]
    pub address: String,
    pub feed_type: FeedType,
    #[validate(range(min = 1))]
    pub update_interval_secs: i64,
    #[validate(range(min = 1))]
    pub max_staleness_secs: i64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_confidence: f64,
    #[validate(url)]
    pub endpoint_url: Option<String>,
    #[validate(length(min = 1))]
    pub sources: Vec<FeedSource>,
}

/// Data point submission payload (push ingestion and polled feeds)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubmitDataPointRequest {
    #[validate(length(min = 1, max = 128))]
    pub source_id: String,
    pub value: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub confidence: f64,
    pub timestamp: i64,
    pub signature: Option<String>,
}

/// Result of ingesting one reading
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPointReceipt {
    pub point_id: Uuid,
    pub feed_id: Uuid,
    pub source_id: String,
    /// True when an identical `(feed, source, timestamp)` reading was already stored
    pub duplicate: bool,
}

/// One source's signature in a joint attestation
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SourceSignature {
    #[validate(length(min = 1, max = 128))]
    pub source_id: String,
    pub signature: Option<String>,
}

/// Several feed sources signing the same `(feed, timestamp, value)` reading
#[derive(Debug, Deserialize, Validate)]
pub struct AttestationRequest {
    pub timestamp: i64,
    pub value: f64,
    #[validate(length(min = 1, max = 64))]
    pub signatures: Vec<SourceSignature>,
    #[validate(range(min = 1))]
    pub required_consensus: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListFeedsQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_type_labels_round_trip() {
        for feed_type in [
            FeedType::EnergyProduction,
            FeedType::Co2Offset,
            FeedType::Custom("water_saved".into()),
        ] {
            let parsed: FeedType = feed_type.to_string().parse().unwrap();
            assert_eq!(parsed, feed_type);
        }
        assert!("custom:".parse::<FeedType>().is_err());
        assert!("solar".parse::<FeedType>().is_err());
    }

    #[test]
    fn data_point_confidence_is_range_checked() {
        let req = SubmitDataPointRequest {
            source_id: "meter-a".into(),
            value: 100.0,
            confidence: 1.2,
            timestamp: 0,
            signature: None,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn attestation_needs_at_least_one_signature() {
        let mut req = AttestationRequest {
            timestamp: 0,
            value: 100.0,
            signatures: Vec::new(),
            required_consensus: None,
        };
        assert!(req.validate().is_err());

        req.signatures.push(SourceSignature {
            source_id: "meter-a".into(),
            signature: None,
        });
        assert!(req.validate().is_ok());
    }
}
