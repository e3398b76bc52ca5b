pub mod coin_transaction;
pub mod coupon;
pub mod order;
pub mod order_item;
pub mod product;
pub mod referral;
pub mod user;

pub use coin_transaction::Entity as CoinTransaction;
pub use coupon::Entity as Coupon;
pub use order::Entity as Order;
pub use order_item::Entity as OrderItem;
pub use product::Entity as Product;
pub use referral::Entity as Referral;
pub use user::Entity as User;
