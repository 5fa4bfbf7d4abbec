//! This crate contains the types and methods needed
//! to interact with DICOM nodes through the upper layer protocol.
//!
//! - The [`pdu`] module provides data structures
//!   representing _protocol data units_ and their codec.
//! - The [`machine`] module implements the upper layer
//!   protocol state machine as a pure transition function,
//!   driven by every association in this crate.
//! - The [`transport`] module frames PDUs over a byte stream
//!   and keeps the association request timer.
//! - The [`association`] module comprises the abstractions
//!   for establishing and negotiating associations
//!   between application entities, as requestor and as acceptor.
//! - The [`address`] module provides compound addresses
//!   referring to application entities in a network.

pub mod address;
pub mod association;
pub mod machine;
pub mod pdu;
pub mod transport;

/// The implementation class UID of this implementation,
/// automatically generated as per PS3.5 B.2.
///
/// This UID may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.305828676556391904434142778571807961209";

/// The implementation version name of this implementation.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "netdicom-rs 0.1";

// re-exports

pub use address::{AeAddr, FullAeAddr};
pub use association::client::{ClientAssociation, ClientAssociationOptions};
pub use association::server::{ServerAssociation, ServerAssociationOptions};
pub use association::Association;
pub use machine::{Action, Event, State, StateMachine};
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
