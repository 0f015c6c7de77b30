//! Segrecover Catalog Access
//!
//! SQL access to the coordinator, kept behind traits so orchestration
//! code can be exercised without a live cluster:
//! - `DbConnector` / `DbConnection`: the connection seam
//! - `PgConnector`: sqlx-backed implementation with utility-mode support
//! - `CatalogReader`: builds a `ClusterTopology` from `gp_segment_configuration`
//! - `relocate_mirror`: moves a mirror's catalog entry after failover

pub mod catalog;
pub mod connection;

pub use catalog::{relocate_mirror, CatalogReader, SEGMENT_CONFIGURATION_QUERY};
pub use connection::{run_statement, DbConnection, DbConnector, DbError, DbUrl, PgConnector, Result};
