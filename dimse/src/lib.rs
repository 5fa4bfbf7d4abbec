//! DICOM message service element (DIMSE) support.
//!
//! This crate builds the message exchange layer
//! on top of [`netdicom_ul`] associations:
//!
//! - The [`commands`] module holds the command field and status
//!   vocabulary of the DIMSE services.
//! - The [`messages`] module provides typed command set builders
//!   for every DIMSE-C and DIMSE-N service,
//!   plus a read-side view over received command sets.
//! - The [`assembler`] module reassembles messages
//!   out of presentation data values.
//! - The [`provider`] module implements the request/response engine:
//!   fragmentation, message ID allocation, response correlation
//!   and the DIMSE timer.
//! - The [`scu`] module exposes the service class user call interface
//!   (`c_echo`, `c_store`, `c_find`, …).
//! - The [`scp`] module dispatches incoming requests
//!   to handlers registered by SOP class,
//!   with typed service events ([`events`]).
//! - The [`ae`] module ties everything together
//!   into a configurable application entity
//!   with a client connector and an accept-loop server.

pub mod ae;
pub mod assembler;
pub mod commands;
pub mod events;
pub mod messages;
pub mod provider;
pub mod scp;
pub mod scu;

mod error;

pub use ae::{ApplicationEntity, ServerHandle};
pub use commands::{CommandField, Priority, Status, StatusClass};
pub use error::Error;
pub use events::{Disposition, ServiceEvent, ServiceHandlers};
pub use messages::{Command, CommandSet};
pub use provider::DimseProvider;
pub use scu::DimseScu;

pub type Result<T, E = Error> = std::result::Result<T, E>;
