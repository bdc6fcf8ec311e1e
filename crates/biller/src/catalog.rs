//! Offer catalog: the host's offers plus the latest backend metadata for each.
//!
//! Refreshes query one-time and recurring offers separately. A failed query for one type leaves
//! that type's offers at their last known values; nothing is ever cleared.

use crate::backend::{BillingBackend, OfferDetails};
use crate::offer::{Offer, OfferType, Period, Pricing};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("duplicate offer id: {0}")]
    DuplicateOffer(String),
    #[error("empty offer id")]
    EmptyOfferId,
}

/// Outcome of one [OfferCatalog::refresh].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Offers whose metadata was returned by the backend.
    pub updated: usize,
    /// Offer types whose query did not succeed.
    pub failed: Vec<OfferType>,
}

pub struct OfferCatalog {
    offers: BTreeMap<String, Offer>,
    details: RwLock<HashMap<String, OfferDetails>>,
}

impl OfferCatalog {
    pub fn new(offers: impl IntoIterator<Item = Offer>) -> Result<Self, CatalogError> {
        let mut by_id = BTreeMap::new();
        for offer in offers {
            if offer.id().is_empty() {
                return Err(CatalogError::EmptyOfferId);
            }
            if by_id.contains_key(offer.id()) {
                return Err(CatalogError::DuplicateOffer(offer.id().to_string()));
            }
            by_id.insert(offer.id().to_string(), offer);
        }
        Ok(Self {
            offers: by_id,
            details: RwLock::new(HashMap::new()),
        })
    }

    pub fn get(&self, id: &str) -> Option<&Offer> {
        self.offers.get(id)
    }

    /// Offers ordered by id.
    pub fn offers(&self) -> impl Iterator<Item = &Offer> {
        self.offers.values()
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    fn ids_of(&self, offer_type: OfferType) -> Vec<String> {
        self.offers
            .values()
            .filter(|o| o.offer_type() == offer_type)
            .map(|o| o.id().to_string())
            .collect()
    }

    /// Latest backend metadata for `id`; `None` until a refresh has returned it.
    pub async fn details(&self, id: &str) -> Option<OfferDetails> {
        self.details.read().await.get(id).cloned()
    }

    /// Queries metadata for every known offer, one query per offer type present, and applies
    /// whatever came back.
    pub async fn refresh<B: BillingBackend>(&self, backend: &B) -> RefreshReport {
        let mut report = RefreshReport::default();
        for offer_type in OfferType::ALL {
            let ids = self.ids_of(offer_type);
            if ids.is_empty() {
                continue;
            }
            let result = backend.query_offer_details(&ids, offer_type).await;
            if !result.code.is_ok() {
                tracing::warn!(?offer_type, code = %result.code, "offer details query failed, keeping last known values");
                report.failed.push(offer_type);
                continue;
            }
            report.updated += self.apply(result.details).await;
        }
        tracing::debug!(updated = report.updated, failed = ?report.failed, "catalog refreshed");
        report
    }

    /// Merges returned metadata into the cache and the offers' live pricing.
    async fn apply(&self, details: Vec<OfferDetails>) -> usize {
        let mut cache = self.details.write().await;
        let mut applied = 0;
        for d in details {
            let Some(offer) = self.offers.get(&d.offer_id) else {
                tracing::debug!(offer_id = %d.offer_id, "details for unknown offer ignored");
                continue;
            };
            offer.set_pricing(Pricing {
                price: d.price.clone(),
                period: Period::from_billing_period(offer.offer_type(), d.billing_period.as_deref()),
            });
            cache.insert(d.offer_id.clone(), d);
            applied += 1;
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_ids() {
        let err = OfferCatalog::new([Offer::consumable("gems"), Offer::consumable("gems")])
            .err()
            .unwrap();
        assert_eq!(err, CatalogError::DuplicateOffer("gems".into()));
    }

    #[test]
    fn rejects_empty_id() {
        let err = OfferCatalog::new([Offer::consumable("")]).err().unwrap();
        assert_eq!(err, CatalogError::EmptyOfferId);
    }

    #[tokio::test]
    async fn apply_updates_known_offers_only() {
        let catalog = OfferCatalog::new([
            Offer::consumable("gems"),
            Offer::acknowledgeable("premium", OfferType::Recurring),
        ])
        .unwrap();
        let applied = catalog
            .apply(vec![
                OfferDetails {
                    offer_id: "premium".into(),
                    offer_type: OfferType::Recurring,
                    price: "$2.99".into(),
                    billing_period: Some("P1W".into()),
                },
                OfferDetails {
                    offer_id: "stranger".into(),
                    offer_type: OfferType::OneTime,
                    price: "$1.00".into(),
                    billing_period: None,
                },
            ])
            .await;
        assert_eq!(applied, 1);
        let premium = catalog.get("premium").unwrap().pricing();
        assert_eq!(premium.price, "$2.99");
        assert_eq!(premium.period, Period::Week);
        assert!(catalog.details("premium").await.is_some());
        assert!(catalog.details("gems").await.is_none());
        assert!(catalog.details("stranger").await.is_none());
    }
}
