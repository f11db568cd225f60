pub mod app_config;
pub mod database;
pub mod documents;
pub mod events;
pub mod gateway;
pub mod order_repo;
pub mod redis_repo;

pub use database::DbClient;
pub use documents::{HttpObjectStorage, HttpPdfRenderer};
pub use events::KafkaEventPublisher;
pub use gateway::StripeGateway;
pub use order_repo::PgOrderRepository;
pub use redis_repo::RedisLocker;
