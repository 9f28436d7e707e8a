//! Segment Membership
//!
//! This crate provides the segment membership lifecycle:
//! - SegmentService: segment create/delete, user subscribe/unsubscribe
//! - ExpiryScheduler: in-process timers that revoke timed memberships
//! - MembershipStore: PostgreSQL, SQLite and in-memory persistence
//! - ExpirySweeper: optional periodic cleanup of overdue memberships
//! - api: axum router exposing the service over HTTP

pub mod api;
pub mod entity;
pub mod error;
pub mod expiry;
pub mod memory;
pub mod postgres;
pub mod service;
pub mod sqlite;
pub mod store;
pub mod sweeper;

pub use api::{router, AppState};
pub use entity::{timeout_from_hours, Membership, MembershipKey, Segment};
pub use error::{ErrorResponse, Result, SegmentError};
pub use expiry::{ExpiryDeadline, ExpiryScheduler};
pub use memory::InMemoryMembershipStore;
pub use postgres::PostgresMembershipStore;
pub use service::{ReconcileReport, SegmentService, SegmentSummary, ServiceConfig, Subscription};
pub use sqlite::SqliteMembershipStore;
pub use store::{MembershipStore, MembershipTableConfig};
pub use sweeper::ExpirySweeper;
