//! Purchase records and purchase-update batches as delivered by the billing backend.

use crate::backend::ResponseCode;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Purchased,
    /// Awaiting out-of-band payment; settled once the backend reports it purchased.
    Pending,
    Other,
}

/// One purchase transaction. `token` is unique per transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    pub offer_id: String,
    pub token: String,
    pub status: PurchaseStatus,
    /// Set by the backend once it has confirmed an acknowledge/consume for this token.
    pub acknowledged: bool,
}

impl PurchaseRecord {
    pub fn new(offer_id: impl Into<String>, token: impl Into<String>, status: PurchaseStatus) -> Self {
        Self {
            offer_id: offer_id.into(),
            token: token.into(),
            status,
            acknowledged: false,
        }
    }

    pub fn purchased(offer_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self::new(offer_id, token, PurchaseStatus::Purchased)
    }

    pub fn pending(offer_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self::new(offer_id, token, PurchaseStatus::Pending)
    }

    pub fn with_acknowledged(mut self, acknowledged: bool) -> Self {
        self.acknowledged = acknowledged;
        self
    }
}

/// A batch of purchase records with the outcome code of the call that produced it.
/// Produced by the backend's purchase callback and by reconciliation sweeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseUpdate {
    pub code: ResponseCode,
    pub purchases: Option<Vec<PurchaseRecord>>,
}

impl PurchaseUpdate {
    pub fn new(code: ResponseCode, purchases: Option<Vec<PurchaseRecord>>) -> Self {
        Self { code, purchases }
    }

    pub fn ok(purchases: Vec<PurchaseRecord>) -> Self {
        Self::new(ResponseCode::Ok, Some(purchases))
    }

    /// Only `Ok` and `ItemAlreadyOwned` batches carry purchases worth settling.
    pub fn is_settleable(&self) -> bool {
        matches!(self.code, ResponseCode::Ok | ResponseCode::ItemAlreadyOwned)
    }

    pub fn records(&self) -> &[PurchaseRecord] {
        self.purchases.as_deref().unwrap_or_default()
    }
}
