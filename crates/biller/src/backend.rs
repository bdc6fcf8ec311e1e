//! Boundary to the vendor billing service.
//!
//! Every call is an async request with exactly one response. The backend's process-wide purchase
//! callback is not part of this trait: adapters forward it into
//! [PurchaseUpdateSink](crate::session::PurchaseUpdateSink).

use crate::offer::OfferType;
use crate::purchase::PurchaseRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend outcome code. Integer values follow the vendor's response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ResponseCode {
    Ok,
    UserCanceled,
    ServiceUnavailable,
    BillingUnavailable,
    ItemUnavailable,
    DeveloperError,
    Error,
    ItemAlreadyOwned,
    ItemNotOwned,
    ServiceDisconnected,
    FeatureNotSupported,
    ServiceTimeout,
    Other(i32),
}

impl ResponseCode {
    pub fn is_ok(self) -> bool {
        self == ResponseCode::Ok
    }

    pub fn code(self) -> i32 {
        self.into()
    }
}

impl From<i32> for ResponseCode {
    fn from(n: i32) -> Self {
        match n {
            0 => ResponseCode::Ok,
            1 => ResponseCode::UserCanceled,
            2 => ResponseCode::ServiceUnavailable,
            3 => ResponseCode::BillingUnavailable,
            4 => ResponseCode::ItemUnavailable,
            5 => ResponseCode::DeveloperError,
            6 => ResponseCode::Error,
            7 => ResponseCode::ItemAlreadyOwned,
            8 => ResponseCode::ItemNotOwned,
            -1 => ResponseCode::ServiceDisconnected,
            -2 => ResponseCode::FeatureNotSupported,
            -3 => ResponseCode::ServiceTimeout,
            other => ResponseCode::Other(other),
        }
    }
}

impl From<ResponseCode> for i32 {
    fn from(code: ResponseCode) -> Self {
        match code {
            ResponseCode::Ok => 0,
            ResponseCode::UserCanceled => 1,
            ResponseCode::ServiceUnavailable => 2,
            ResponseCode::BillingUnavailable => 3,
            ResponseCode::ItemUnavailable => 4,
            ResponseCode::DeveloperError => 5,
            ResponseCode::Error => 6,
            ResponseCode::ItemAlreadyOwned => 7,
            ResponseCode::ItemNotOwned => 8,
            ResponseCode::ServiceDisconnected => -1,
            ResponseCode::FeatureNotSupported => -2,
            ResponseCode::ServiceTimeout => -3,
            ResponseCode::Other(n) => n,
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseCode::Other(n) => write!(f, "Other({})", n),
            known => write!(f, "{:?}({})", known, known.code()),
        }
    }
}

/// Backend metadata for one offer, as needed to launch its purchase flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferDetails {
    pub offer_id: String,
    pub offer_type: OfferType,
    /// Locale-formatted price, e.g. `"$4.99"`.
    pub price: String,
    /// ISO-8601 billing period for recurring offers (`P1M`), `None` for one-time offers.
    pub billing_period: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferDetailsResult {
    pub code: ResponseCode,
    pub details: Vec<OfferDetails>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchasesResult {
    pub code: ResponseCode,
    pub purchases: Vec<PurchaseRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeResult {
    pub code: ResponseCode,
    pub token: String,
}

/// Async view of the vendor billing SDK.
#[async_trait]
pub trait BillingBackend: Send + Sync + 'static {
    /// Host surface the purchase flow is presented on (an activity, a window handle, ...).
    type HostContext: Send + Sync;

    /// Starts a connection and resolves with the setup outcome.
    async fn connect(&self) -> ResponseCode;

    /// Resolves once an established connection is lost.
    async fn disconnected(&self);

    /// Ends the connection. Safe to call when not connected.
    async fn disconnect(&self);

    async fn query_offer_details(&self, ids: &[String], offer_type: OfferType) -> OfferDetailsResult;

    /// Outstanding (unconsumed, or owned) purchases of the account for one offer type.
    async fn query_purchases(&self, offer_type: OfferType) -> PurchasesResult;

    /// Presents the purchase flow. The outcome of the purchase arrives later through the
    /// purchase callback; this only reports whether the flow was opened.
    async fn launch_purchase_flow(&self, host: &Self::HostContext, details: &OfferDetails) -> ResponseCode;

    async fn acknowledge(&self, token: &str) -> ResponseCode;

    async fn consume(&self, token: &str) -> ConsumeResult;
}
