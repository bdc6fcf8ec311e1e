//! Offers: host-defined purchasable products with live pricing.
//!
//! Identity (id, kind, type) is fixed at construction. Price and billing period start empty and
//! are overwritten in place by catalog refreshes; observers hold a `watch` receiver.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::watch;

/// How a purchase of the offer is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferKind {
    /// Non-consumable: acknowledged once, entitlement is permanent.
    Acknowledgeable,
    /// Consumed after purchase so it can be bought again.
    Consumable,
}

/// Backend query partition. One-time and recurring offers are queried separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferType {
    OneTime,
    Recurring,
}

impl OfferType {
    pub const ALL: [OfferType; 2] = [OfferType::OneTime, OfferType::Recurring];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Once,
    Day,
    Week,
    Month,
    Year,
    Unknown,
}

impl Period {
    /// Maps a backend billing period (ISO-8601 duration, e.g. `P1M`) to a [Period].
    /// One-time offers are always [Period::Once].
    pub fn from_billing_period(offer_type: OfferType, raw: Option<&str>) -> Self {
        match offer_type {
            OfferType::OneTime => Period::Once,
            OfferType::Recurring => match raw {
                Some("P1D") => Period::Day,
                Some("P1W") => Period::Week,
                Some("P1M") => Period::Month,
                Some("P1Y") => Period::Year,
                _ => Period::Unknown,
            },
        }
    }
}

/// Live, backend-formatted price and billing period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    pub price: String,
    pub period: Period,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            price: String::new(),
            period: Period::Unknown,
        }
    }
}

struct OfferInner {
    id: String,
    kind: OfferKind,
    offer_type: OfferType,
    pricing: watch::Sender<Pricing>,
}

/// A purchasable product. Cheap to clone; clones share the same live pricing.
/// Equality and hashing are by id.
#[derive(Clone)]
pub struct Offer {
    inner: Arc<OfferInner>,
}

impl Offer {
    pub fn new(id: impl Into<String>, kind: OfferKind, offer_type: OfferType) -> Self {
        let (pricing, _) = watch::channel(Pricing::default());
        Self {
            inner: Arc::new(OfferInner {
                id: id.into(),
                kind,
                offer_type,
                pricing,
            }),
        }
    }

    /// Non-consumable offer (one-time unlock or subscription).
    pub fn acknowledgeable(id: impl Into<String>, offer_type: OfferType) -> Self {
        Self::new(id, OfferKind::Acknowledgeable, offer_type)
    }

    /// Consumable offer. Consumables are always one-time purchases.
    pub fn consumable(id: impl Into<String>) -> Self {
        Self::new(id, OfferKind::Consumable, OfferType::OneTime)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> OfferKind {
        self.inner.kind
    }

    pub fn offer_type(&self) -> OfferType {
        self.inner.offer_type
    }

    /// Latest known pricing (empty until the first successful refresh).
    pub fn pricing(&self) -> Pricing {
        self.inner.pricing.borrow().clone()
    }

    /// Replay-latest receiver of pricing changes.
    pub fn watch_pricing(&self) -> watch::Receiver<Pricing> {
        self.inner.pricing.subscribe()
    }

    /// Overwrites pricing; observers are only woken when the value changed.
    pub(crate) fn set_pricing(&self, pricing: Pricing) -> bool {
        self.inner.pricing.send_if_modified(|current| {
            if *current == pricing {
                return false;
            }
            *current = pricing;
            true
        })
    }
}

impl fmt::Debug for Offer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Offer")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("offer_type", &self.inner.offer_type)
            .field("pricing", &*self.inner.pricing.borrow())
            .finish()
    }
}

impl PartialEq for Offer {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Offer {}

impl Hash for Offer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}
