//! SQL text generation for remote SQLite-dialect endpoints.
//!
//! - **`predicate`**: turns DataFusion filter expressions into WHERE-clause text
//!   the remote evaluates exactly as DataFusion would.
//! - **`affinity`**: SQLite's column affinity rules, used to decide whether a
//!   remote comparison behaves like the local one.
//! - **`quote`**: identifier and string-literal quoting shared by every
//!   component that builds remote SQL.
pub mod affinity;
pub mod predicate;
pub mod quote;

pub use affinity::{affinity, Affinity};
pub use predicate::{join_conjuncts, push_down_filters, translate, translate_with};
pub use quote::{quote_identifier, quote_literal};
