//! Backend adapters for executing compiled nodes
//!
//! The executor depends only on the [`BackendAdapter`] capability trait;
//! concrete backends plug in behind it.
//!
//! ## Features
//!
//! Enable backend support via Cargo features:
//! - `postgres` - PostgreSQL/Redshift support
//!
//! The [`MockAdapter`] is always available and is what tests and dry runs use.
//!
//! ## Example
//!
//! ```rust,ignore
//! use strata_adapter::{BackendAdapter, ConnectionPool, ExecutionRequest, MockAdapter};
//! use std::sync::Arc;
//!
//! let pool = Arc::new(ConnectionPool::new(Arc::new(MockAdapter::new()), 4));
//! let mut connection = pool.acquire().await?;
//! let outcome = pool.adapter().execute(&mut connection, &request).await?;
//! ```

pub mod adapter;
pub mod mock;
pub mod pool;
pub mod postgres;

pub use adapter::{AdapterError, BackendAdapter, ExecutionOutcome, ExecutionRequest};
pub use mock::{ExecutionRecord, MockAdapter, MockConnection, RecordedResult};
pub use pool::{ConnectionPool, PooledConnection};
pub use postgres::{build_plan, MaterializationPlan, PostgresAdapter, PostgresConnection, PostgresSettings};
