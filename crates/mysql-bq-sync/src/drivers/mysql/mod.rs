//! MySQL/MariaDB source driver.
//!
//! - [`MySqlConnector`]: one lazily connected SQLx pool per source system
//! - [`MySqlSourceConnection`]: a checked-out connection implementing
//!   [`SourceConnection`](crate::core::SourceConnection)
//!
//! # Supported Versions
//!
//! - MySQL 5.7+, 8.0+
//! - MariaDB 10.2+ (session statement timeouts are skipped with a warning)

mod connector;
mod decode;

pub use connector::{MySqlConnector, MySqlSourceConnection};
pub use decode::{classify_error, is_transient_error_number};
