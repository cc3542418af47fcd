//! Unique identifiers for Pollux entities.
//!
//! Strongly-typed UUID identifiers built on
//! [`domain-key`](https://crates.io/crates/domain-key) `Uuid<D>` wrappers.
//! Each identifier type is parameterized by a unique domain marker, so an
//! execution id can never be passed where a queue-item id is expected.
//!
//! All ID types are `Copy` (16 bytes, stack-allocated) and support `v4()`,
//! `nil()`, `parse(&str)`, full serde, `Display`, `FromStr`, `Eq`, `Ord`,
//! and `Hash`.

use domain_key::define_uuid;

// Re-export for downstream parse error handling
pub use domain_key::UuidParseError;

define_uuid!(pub ExecutionIdDomain => ExecutionId);
define_uuid!(pub QueueItemIdDomain => QueueItemId);
