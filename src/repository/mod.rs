pub mod chain_event_repository;
pub mod intent_repository;
pub mod merchant_repository;
pub mod payout_repository;
pub mod webhook_repository;

pub use chain_event_repository::ChainEventRepository;
pub use intent_repository::{IntentFilter, IntentRepository};
pub use merchant_repository::MerchantRepository;
pub use payout_repository::PayoutRepository;
pub use webhook_repository::WebhookRepository;
