//! dropkit - rate-limited request dispatch for drop purchases.
//!
//! Core library: a priority dispatcher that honours server quotas, and a
//! worker pool that fans purchase bursts out across egress identities.

pub mod config;
pub mod dispatcher;
pub mod egress;
pub mod pool;
pub mod rate_limit;
pub mod snapshot;
mod sync;
pub mod transport;

pub use config::{DispatcherConfig, PoolConfig, RateLimitProfile, Settings};
pub use dispatcher::{
    AttemptFailure, DispatchError, Dispatcher, DispatcherMetrics, PendingResult, RequestOptions,
    RequestPriority,
};
pub use egress::{EgressIdentity, IdentityPool, ProxyEndpoint};
pub use pool::{
    HttpPurchaseExecutor, PoolStatus, PurchaseError, PurchaseExecutor, PurchaseTarget,
    PurchaseTask, WorkerContext, WorkerPool, WorkerResult,
};
pub use snapshot::{InMemorySnapshotStore, SnapshotStore, SqliteSnapshotStore};
pub use transport::{Operation, TransportError, TransportResponse};
