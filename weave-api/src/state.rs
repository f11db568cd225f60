use std::sync::Arc;
use weave_core::documents::{ObjectStorage, PdfRenderer};
use weave_core::events::EventPublisher;
use weave_core::lock::Locker;
use weave_core::payment::PaymentGateway;
use weave_core::repository::OrderRepository;
use weave_order::{
    AdminService, CartAggregator, CheckoutOrchestrator, FeeSchedule, InvoiceIssuer, PaymentLinkService,
    SettlementService, TrackingService,
};

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub expiration: u64,
}

/// External collaborators the engine services are built on.
#[derive(Clone)]
pub struct Backends {
    pub repo: Arc<dyn OrderRepository>,
    pub locker: Arc<dyn Locker>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub publisher: Arc<dyn EventPublisher>,
    pub renderer: Arc<dyn PdfRenderer>,
    pub storage: Arc<dyn ObjectStorage>,
}

#[derive(Clone, Default)]
pub struct ServiceSettings {
    pub fees: FeeSchedule,
    pub callback_base_url: String,
    pub invoice_print_base_url: String,
    pub invoice_bucket: String,
}

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<CartAggregator>,
    pub orchestrator: Arc<CheckoutOrchestrator>,
    pub settlement: Arc<SettlementService>,
    pub tracking: Arc<TrackingService>,
    pub admin: Arc<AdminService>,
    pub payment_links: Arc<PaymentLinkService>,
    pub invoices: Arc<InvoiceIssuer>,
    pub auth: AuthConfig,
}

impl AppState {
    pub fn new(backends: Backends, settings: ServiceSettings, auth: AuthConfig) -> Self {
        let Backends { repo, locker, gateway, publisher, renderer, storage } = backends;

        let aggregator = Arc::new(CartAggregator::new(repo.clone(), settings.fees));
        let orchestrator = CheckoutOrchestrator::new(
            aggregator.clone(),
            repo.clone(),
            gateway.clone(),
            publisher.clone(),
            settings.callback_base_url.clone(),
        );
        let payment_links = PaymentLinkService::new(
            aggregator.clone(),
            repo.clone(),
            gateway.clone(),
            settings.callback_base_url,
        );

        Self {
            orchestrator: Arc::new(orchestrator),
            settlement: Arc::new(SettlementService::new(repo.clone(), locker.clone(), publisher.clone())),
            tracking: Arc::new(TrackingService::new(repo.clone(), locker.clone())),
            admin: Arc::new(AdminService::new(repo.clone(), locker, gateway, publisher)),
            payment_links: Arc::new(payment_links),
            invoices: Arc::new(InvoiceIssuer::new(
                repo,
                renderer,
                storage,
                settings.invoice_print_base_url,
                settings.invoice_bucket,
            )),
            aggregator,
            auth,
        }
    }
}
