pub mod coins;
pub mod gifts;
pub mod inventory;
pub mod notifications;
pub mod orders;
pub mod payments;
pub mod referrals;
