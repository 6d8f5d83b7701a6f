pub mod client;
pub mod csr;
pub mod driver;
pub mod jws;
pub mod publisher;
pub mod types;

pub use client::HttpStep;
pub use driver::{ACME_RETRY, OrderState, Renewal};
pub use jws::AccountKey;
pub use publisher::{ChallengePublisher, LogPublisher};
pub use types::{
    Authorization, AuthorizationStatus, Challenge, ChallengeKind, ChallengeStatus, Directory,
    Order, OrderStatus, Problem,
};
