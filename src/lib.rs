//! This crate contains the types and methods needed to interact
//! with DICOM nodes through the upper layer protocol,
//! from the transport connection up to DIMSE message exchange.
//!
//! - The [`address`] module
//!   provides an abstraction for working with compound addresses
//!   referring to application entities in a network.
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_
//!   and their binary codec.
//! - The [`transport`] module
//!   opens the byte stream to the peer node,
//!   over plain TCP, TLS (Cargo feature `tls`),
//!   or through an HTTP `CONNECT` proxy,
//!   applying socket-level timeouts.
//! - The [`association`] module
//!   comprises abstractions for establishing and negotiating associations
//!   between application entities,
//!   and the session state machine driving them.
//! - The [`dimse`] module
//!   builds and reassembles command/data-set message pairs
//!   on top of an established association,
//!   correlating responses to outstanding requests by message ID.
//! - The [`service`] module
//!   routes inbound commands to registered handlers
//!   by their affected SOP class UID.
//!
//! ## Error categories
//!
//! Failures surface through three disjoint categories:
//! _could not establish_ (connection, proxy, TLS or negotiation failures,
//! reported by `establish` as [`association::Error`]),
//! _session lost mid-exchange_ (abort or timeout,
//! delivered to every outstanding request as [`dimse::SessionLost`]),
//! and _this particular request failed_
//! (a non-success status code in the response command set,
//! which is data, not an error).

pub mod address;
pub mod association;
pub mod dimse;
pub mod pdu;
pub mod service;
pub mod transport;

/// The implementation class UID generically referring to this crate.
///
/// Automatically generated as per the standard, part 5, section B.2.
///
/// This UID may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.118211358596532457810125021971537628943";

/// The implementation version name generically referring to this crate.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "dicom-net 0.1.0";

// re-exports

pub use address::{AeAddr, FullAeAddr};
pub use association::client::{ClientAssociation, ClientAssociationOptions};
pub use association::server::{ServerAssociation, ServerAssociationOptions};
pub use dimse::exchange::DimseClient;
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
pub use service::ServiceRegistry;
