pub mod admin;
pub mod cart;
pub mod error;
mod events;
pub mod invoice;
mod locking;
pub mod memory;
pub mod orchestrator;
pub mod payment_link;
pub mod pricing;
pub mod settlement;
pub mod tracking;

pub use admin::AdminService;
pub use cart::{CartAggregator, CheckoutSelection, Quote};
pub use error::{ErrorKind, OrderError, OrderResult};
pub use invoice::InvoiceIssuer;
pub use orchestrator::{CheckoutInfo, CheckoutOrchestrator, CheckoutOutcome, CheckoutRequest};
pub use payment_link::PaymentLinkService;
pub use pricing::{CardFee, FeeSchedule};
pub use settlement::SettlementService;
pub use tracking::{BulkTrackingCommand, PoTrackingCommand, TrackingService};
