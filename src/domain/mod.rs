pub mod intent;
pub mod merchant;
pub mod payout;
pub mod webhook;

pub use intent::{
    CryptoCurrency, FiatCurrency, IntentStatus, PaymentIntent, ReleaseMethod,
};
pub use merchant::{Merchant, PayoutSchedule};
pub use payout::{Payout, PayoutStatus};
pub use webhook::{WebhookDeliveryStatus, WebhookEvent, WebhookEventType};
