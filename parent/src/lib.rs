//! This crate serves as a parent for the library crates
//! of the netdicom project.
//!
//! For the upper layer protocol (PDUs, the state machine
//! and association negotiation), see [`ul`].
//! For the message exchange layer (DIMSE services
//! and application entities), see [`dimse`].
pub use netdicom_dimse as dimse;
pub use netdicom_ul as ul;

// the types most programs start from
pub use netdicom_dimse::{ApplicationEntity, DimseScu, ServiceHandlers, Status};
pub use netdicom_ul::{ClientAssociationOptions, Pdu, ServerAssociationOptions};
