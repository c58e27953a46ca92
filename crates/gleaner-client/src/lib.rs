//! Gleaner Client - catalog protocol clients
//!
//! - [`csw`] - OGC CSW 2.0.2 endpoints serving ISO 19139 records
//! - [`xml`] - parsing of CSW responses
//!
//! Clients implement the catalog traits of `gleaner-core`, so the harvest
//! pipeline never sees HTTP or XML details.

pub mod csw;
pub mod xml;

pub use csw::{CswClient, CswClientFactory};
