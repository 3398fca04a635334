//! Queries and their subscriptions.
//!
//! A query is a named publication with params. Equal `(name, params)` pairs
//! collapse onto one query and one server subscription no matter how many
//! callbacks watch it.
//!
//! # Lifecycle
//!
//! ```text
//! Inactive ──watch──► Requested ──ack──► Confirmed ──snapshot──► Ready
//!                         └──────error──────► Error
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `entry` | Connection-side state of one query |
//! | `reassembly` | Chunked snapshot buffer |
//! | `store` | Registry and server handle index |
//! | `view` | Consumer handles ([`QueryView`], [`Subscription`]) |

// ============================================================================
// Submodules
// ============================================================================

pub(crate) mod entry;
pub(crate) mod reassembly;
pub(crate) mod store;

/// Consumer-facing query handles.
pub mod view;

// ============================================================================
// Re-exports
// ============================================================================

pub(crate) use entry::Query;
pub(crate) use reassembly::Chunk;
pub(crate) use store::QueryStore;
pub use view::{QueryCallback, QueryState, QueryView, Subscription, callback};
