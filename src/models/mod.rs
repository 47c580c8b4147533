mod account;

pub use account::{Account, ModelRateLimit, QuotaSnapshot, SubscriptionTier};
