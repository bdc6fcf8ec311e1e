//! Purchase session engine: billing connection lifecycle, offer catalog, and purchase settlement
//! on top of a pluggable [BillingBackend].
//!
//! - **ConnectionManager**: connect loop with fixed-delay reconnect; outcomes are published as
//!   [ConnectionStatus] values to any number of replay-latest observers.
//! - **OfferCatalog**: the host's offers, refreshed from the backend on every `Ready`.
//! - **Reconciler**: acknowledges or consumes purchases exactly once per token, from push
//!   updates and full sweeps alike; results land in [PurchaseState].
//! - **BillerSession**: owns all of the above and their tasks between `start` and `stop`.

pub mod backend;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod launcher;
pub mod offer;
pub mod purchase;
pub mod readiness;
pub mod reconciler;
pub mod session;
pub mod simulated;
pub mod state;
pub mod status;

pub use backend::{
    BillingBackend, ConsumeResult, OfferDetails, OfferDetailsResult, PurchasesResult, ResponseCode,
};
pub use catalog::{CatalogError, OfferCatalog, RefreshReport};
pub use config::{ConfigError, ReconnectionConfig, SessionConfig};
pub use connection::ConnectionManager;
pub use launcher::{FlowLauncher, LaunchError};
pub use offer::{Offer, OfferKind, OfferType, Period, Pricing};
pub use purchase::{PurchaseRecord, PurchaseStatus, PurchaseUpdate};
pub use readiness::ReadinessGate;
pub use reconciler::{ReconcileReport, Reconciler};
pub use session::{BillerSession, PurchaseUpdateSink, SessionError};
pub use simulated::{SimulatedBackend, SimulatedHost};
pub use state::{ConsumedEvent, PurchaseState};
pub use status::{ConnectionStatus, StatusCell, StatusStream};
