//! Cirrus runtime: remote D1 and R2 SQL databases inside a DataFusion session.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  RemoteSession   │  BEGIN / COMMIT / ROLLBACK, write routing
//! └────────┬─────────┘
//!          │
//! ┌────────┴─────────┐
//! │   RemoteEngine   │  SessionContext, limit rule, table functions
//! └────────┬─────────┘
//!     ┌────┴─────┐
//!     │ Catalog  │  alias.table -> remote scan
//!     └────┬─────┘
//!          │  HTTPS
//!   ┌──────┴──────┐
//!   │ D1 / R2 SQL │
//!   └─────────────┘
//! ```

pub mod attach;
pub mod bridge;
pub mod engine;
pub mod functions;
pub mod optimizer;
pub mod registry;
pub mod services;
pub mod session;
pub mod transaction;
