//! Real-time message delivery: the connection hub, per-connection actors,
//! the middleware pipeline and the at-least-once machinery behind it
//! (pending-ack tracking, resend loop, offline fallback), plus the ban/mute
//! bloom filters and the group membership cache.

pub mod ack;
pub mod bloom;
pub mod client;
pub mod config;
pub mod error;
pub mod filter;
pub mod group_cache;
pub mod hub;
pub mod pipeline;
pub mod policy;
mod registry;
pub mod resend;
pub mod store;

use serde::{Deserialize, Serialize};

pub use client::{run_client, serve_socket, CloseReason, Connection, ConnectionHandle};
pub use config::DeliveryConfig;
pub use error::DeliveryError;
pub use group_cache::{GroupCache, MembershipSource};
pub use hub::{Hub, HubState};
pub use policy::PolicyStore;
pub use store::MessageStore;

/// How a business operation's notification went out. The operation itself
/// already succeeded either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyOutcome {
    Delivered,
    Delayed,
}

impl NotifyOutcome {
    pub fn from_result<T>(result: &Result<T, DeliveryError>) -> Self {
        match result {
            Ok(_) => NotifyOutcome::Delivered,
            Err(_) => NotifyOutcome::Delayed,
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/bloom_tests.rs"]
mod bloom_tests;

#[cfg(test)]
#[path = "tests/policy_tests.rs"]
mod policy_tests;

#[cfg(test)]
#[path = "tests/group_cache_tests.rs"]
mod group_cache_tests;

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod store_tests;

#[cfg(test)]
#[path = "tests/pipeline_tests.rs"]
mod pipeline_tests;

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod hub_tests;

#[cfg(test)]
#[path = "tests/resend_tests.rs"]
mod resend_tests;
