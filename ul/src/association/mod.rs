//! DICOM association module
//!
//! This module contains the types for establishing associations
//! between DICOM application entities over TCP.
//!
//! As an association requester, usually a service class user (SCU),
//! a new association is started via [`ClientAssociationOptions`].
//! As an association acceptor, usually a service class provider (SCP),
//! a freshly accepted TCP stream is given to
//! a previously configured [`ServerAssociationOptions`].
//!
//! Every PDU sent or received by an established association
//! passes through the upper layer state machine
//! ([`crate::machine`]),
//! so that protocol errors, release collisions and aborts
//! are resolved the same way on both sides of the connection.
pub mod client;
pub mod server;

pub(crate) mod pdata;
mod uid;

#[cfg(test)]
mod tests;

use std::time::Duration;

use snafu::{Backtrace, ResultExt, Snafu};

pub use client::{ClientAssociation, ClientAssociationOptions};
pub use pdata::{PDataReader, PDataWriter};
pub use server::{
    AcceptAny, AcceptCalledAeTitle, AccessControl, AeTitleAllowList, ServerAssociation,
    ServerAssociationOptions,
};

use crate::machine::{Action, Event, State, StateMachine};
use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationRJ, PDataValue,
    PresentationContextNegotiated, Pdu, RoleSelection,
};
use crate::transport::{self, CloseSocket, PduTransport};

type Result<T, E = Error> = std::result::Result<T, E>;

/// An error which may occur while negotiating or using an association.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax { backtrace: Backtrace },

    /// could not convert to socket address
    ToAddress {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not connect to peer
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not set tcp read timeout
    SetReadTimeout {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not set tcp write timeout
    SetWriteTimeout {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("transport failure: {}", source))]
    Transport {
        #[snafu(backtrace)]
        source: transport::Error,
    },

    #[snafu(display("unexpected PDU from peer `{}`", pdu.short_description()))]
    #[non_exhaustive]
    UnexpectedPdu {
        /// the PDU obtained from the peer
        pdu: Box<Pdu>,
    },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch {
        expected: u16,
        got: u16,
        backtrace: Backtrace,
    },

    #[snafu(display("association rejected {}", association_rj.source))]
    Rejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    /// association aborted by the peer
    #[snafu(display("association aborted by the peer ({:?})", source_info))]
    Aborted {
        source_info: AbortRQSource,
        backtrace: Backtrace,
    },

    /// association aborted locally upon a protocol error
    #[snafu(display("association aborted upon protocol error ({:?})", reason))]
    ProviderAborted {
        reason: AbortRQServiceProviderReason,
        backtrace: Backtrace,
    },

    /// no presentation contexts accepted by the peer
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    /// operation not permitted in the current association state
    #[snafu(display("operation not permitted in state {:?}", state))]
    InvalidState {
        state: State,
        backtrace: Backtrace,
    },

    /// failed to close the connection
    Close {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// TLS configuration is required but was not provided
    #[cfg(feature = "sync-tls")]
    TlsConfigMissing { backtrace: Backtrace },

    /// invalid server name for TLS
    #[cfg(feature = "sync-tls")]
    InvalidServerName {
        source: rustls::pki_types::InvalidDnsNameError,
        backtrace: Backtrace,
    },

    /// failed to establish a TLS session
    #[cfg(feature = "sync-tls")]
    #[snafu(display("failed to establish TLS session: {:?}", source))]
    TlsSession {
        source: rustls::Error,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Whether this error was caused by an I/O timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Transport {
                source: transport::Error::Timeout { .. },
                ..
            }
        )
    }
}

/// Socket configuration for associations.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketOptions {
    /// timeout for individual read operations
    pub(crate) read_timeout: Option<Duration>,
    /// timeout for individual send operations
    pub(crate) write_timeout: Option<Duration>,
    /// timeout for connection establishment
    pub(crate) connection_timeout: Option<Duration>,
}

/// Common properties of an established association.
pub trait Association {
    /// The remote node's application entity title.
    fn peer_ae_title(&self) -> &str;

    /// The maximum PDU length admitted by this application entity.
    fn local_max_pdu_length(&self) -> u32;

    /// The maximum PDU length declared by the peer.
    fn peer_max_pdu_length(&self) -> u32;

    /// The negotiated presentation contexts,
    /// including those which were not accepted.
    fn presentation_contexts(&self) -> &[PresentationContextNegotiated];

    /// The accepted presentation context with the given ID, if any.
    fn presentation_context(&self, id: u8) -> Option<&PresentationContextNegotiated> {
        self.presentation_contexts()
            .iter()
            .find(|pc| pc.id == id && pc.is_accepted())
    }
}

/// Negotiated properties carried by an established association,
/// shared between the requestor and acceptor implementations.
#[derive(Debug)]
pub(crate) struct NegotiatedOptions {
    /// the maximum PDU length the peer can receive
    pub peer_max_pdu_length: u32,
    /// the peer's user information items, as received
    pub user_variables: Vec<crate::pdu::UserVariableItem>,
    /// all negotiated presentation contexts
    pub presentation_contexts: Vec<PresentationContextNegotiated>,
    /// the peer's AE title
    pub peer_ae_title: String,
}

/// Resolve the effective SCU/SCP roles for one abstract syntax.
///
/// Default roles are SCU only. When both peers carry a role selection
/// item for the abstract syntax, the intersection applies;
/// when either peer omits the item, the defaults stand.
pub(crate) fn effective_roles(
    proposed: Option<&RoleSelection>,
    replied: Option<&RoleSelection>,
) -> (bool, bool) {
    match (proposed, replied) {
        (Some(p), Some(r)) => (p.scu_role && r.scu_role, p.scp_role && r.scp_role),
        _ => (true, false),
    }
}

impl PresentationContextNegotiated {
    /// Whether the context was accepted by the acceptor.
    pub fn is_accepted(&self) -> bool {
        self.reason == crate::pdu::PresentationContextResultReason::Acceptance
    }
}

/// The per-connection driver shared by both association roles:
/// the state machine, the PDU transport,
/// and data buffered while a release handshake was in progress.
#[derive(Debug)]
pub(crate) struct Driver<S> {
    pub machine: StateMachine,
    pub transport: PduTransport<S>,
    /// P-DATA received during release, kept for the upper layers
    pub pending_data: Vec<PDataValue>,
    /// the ARTIM timer duration for states which arm it
    pub artim_timeout: Duration,
}

impl<S> Driver<S>
where
    S: std::io::Read + std::io::Write + CloseSocket,
{
    pub fn new(transport: PduTransport<S>, artim_timeout: Duration) -> Self {
        Driver {
            machine: StateMachine::new(),
            transport,
            pending_data: Vec::new(),
            artim_timeout,
        }
    }

    /// Send a PDU originating from a local service primitive.
    ///
    /// The PDU is mapped to the corresponding primitive event,
    /// and only emitted if the machine sanctions it
    /// in the current state.
    pub fn send(&mut self, pdu: &Pdu) -> Result<()> {
        let event = match pdu {
            Pdu::PData { .. } => Event::PDataRequest,
            Pdu::ReleaseRQ => Event::AReleaseRequest,
            Pdu::ReleaseRP => Event::AReleaseResponse,
            Pdu::AbortRQ { .. } => Event::AAbortRequest,
            _ => {
                return InvalidStateSnafu {
                    state: self.machine.state(),
                }
                .fail()
            }
        };
        let state = self.machine.state();
        match self.machine.step(event) {
            Action::DT1 | Action::AR7 | Action::AR1 | Action::AR9 => {
                self.transport.send(pdu).context(TransportSnafu)
            }
            Action::AR4 => {
                // release response: the connection now lingers
                // until the peer closes it
                self.transport.send(pdu).context(TransportSnafu)?;
                self.transport.artim.arm(self.artim_timeout);
                Ok(())
            }
            Action::AA1 => {
                let _ = self.transport.send(pdu);
                let _ = self.transport.close();
                Ok(())
            }
            Action::AA8 => {
                // a primitive the protocol does not admit here
                let reason = AbortRQServiceProviderReason::UnexpectedPdu;
                let _ = self.transport.send(&Pdu::AbortRQ {
                    source: AbortRQSource::ServiceProvider(reason),
                });
                let _ = self.transport.close();
                ProviderAbortedSnafu { reason }.fail()
            }
            _ => InvalidStateSnafu { state }.fail(),
        }
    }

    /// Receive the next PDU sanctioned by the state machine.
    ///
    /// PDUs which the machine discards are skipped;
    /// protocol errors trigger the abort path
    /// before surfacing as errors.
    pub fn receive(&mut self) -> Result<Pdu> {
        loop {
            let pdu = match self.transport.receive() {
                Ok(pdu) => pdu,
                Err(transport::Error::ConnectionClosed) => {
                    self.machine.step(Event::TransportClosedIndication);
                    return Err(transport::Error::ConnectionClosed).context(TransportSnafu);
                }
                Err(e) => return Err(e).context(TransportSnafu),
            };
            let event = Event::from_pdu(&pdu);
            match self.machine.step(event) {
                // data or a release signal for the local user
                Action::DT2 | Action::AR6 | Action::AR2 | Action::AR8 | Action::AR10 => {
                    return Ok(pdu);
                }
                // release confirmed: the exchange is over
                Action::AR3 => {
                    let _ = self.transport.close();
                    return Ok(pdu);
                }
                // peer aborted
                Action::AA3 => {
                    let _ = self.transport.close();
                    return Ok(pdu);
                }
                Action::AA2 => {
                    self.transport.artim.disarm();
                    let _ = self.transport.close();
                    return Ok(pdu);
                }
                // discard and wait for the next one
                Action::AA6 => continue,
                // tell the peer off, then keep draining
                Action::AA7 => {
                    let _ = self.transport.send(&Pdu::AbortRQ {
                        source: AbortRQSource::ServiceProvider(
                            AbortRQServiceProviderReason::UnexpectedPdu,
                        ),
                    });
                    continue;
                }
                // protocol error: abort and surface
                Action::AA8 => {
                    return self.protocol_abort(&pdu);
                }
                Action::AA1 => {
                    let _ = self.transport.send(&Pdu::AbortRQ {
                        source: AbortRQSource::ServiceUser,
                    });
                    let _ = self.transport.close();
                    return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail();
                }
                action => {
                    // establishment actions are handled by the
                    // negotiation phase and cannot reoccur here
                    tracing::warn!("unhandled established-phase action {:?}", action);
                    return Ok(pdu);
                }
            }
        }
    }

    /// Execute the AA-8 action: emit a provider abort,
    /// surface the A-P-ABORT indication, and close.
    fn protocol_abort(&mut self, pdu: &Pdu) -> Result<Pdu> {
        let reason = match pdu {
            Pdu::Unknown { .. } => AbortRQServiceProviderReason::UnrecognizedPdu,
            _ => AbortRQServiceProviderReason::UnexpectedPdu,
        };
        let _ = self.transport.send(&Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(reason),
        });
        self.transport.artim.arm(self.artim_timeout);
        let _ = self.transport.close();
        ProviderAbortedSnafu { reason }.fail()
    }

    /// Initiate a graceful release and run the handshake to completion,
    /// resolving a release collision if the peer released simultaneously.
    ///
    /// P-DATA PDUs arriving while the handshake is in progress
    /// are buffered in `pending_data`.
    pub fn release(&mut self) -> Result<()> {
        // bound the handshake so that a dead peer cannot hold us up
        let _ = self.transport.set_read_timeout(Some(self.artim_timeout));
        self.send(&Pdu::ReleaseRQ)?;

        loop {
            let pdu = match self.transport.receive() {
                Ok(pdu) => pdu,
                Err(transport::Error::ConnectionClosed) => {
                    // peer closed without answering; treated as completed
                    self.machine.step(Event::TransportClosedIndication);
                    return Ok(());
                }
                Err(e @ transport::Error::Timeout { .. }) => {
                    self.abort(AbortRQSource::ServiceUser);
                    return Err(e).context(TransportSnafu);
                }
                Err(e) => {
                    let _ = self.transport.close();
                    return Err(e).context(TransportSnafu);
                }
            };
            let event = Event::from_pdu(&pdu);
            match self.machine.step(event) {
                Action::AR3 => {
                    // release confirmation: close and be done
                    let _ = self.transport.close();
                    return Ok(());
                }
                Action::AR6 | Action::DT2 => {
                    if let Pdu::PData { data } = pdu {
                        self.pending_data.extend(data);
                    }
                }
                Action::AR8 => {
                    // release collision; the requestor responds right away,
                    // while the acceptor must wait for the peer's
                    // A-RELEASE-RP before sending its own
                    if self.machine.role() == crate::machine::Role::Requestor {
                        match self.machine.step(Event::AReleaseResponse) {
                            Action::AR9 => {
                                self.transport
                                    .send(&Pdu::ReleaseRP)
                                    .context(TransportSnafu)?;
                            }
                            action => {
                                tracing::warn!(
                                    "unexpected action {:?} in release collision",
                                    action
                                );
                            }
                        }
                    }
                }
                Action::AR10 => {
                    // collision, acceptor side: peer's RP arrived;
                    // confirm and send ours, then linger for the close
                    match self.machine.step(Event::AReleaseResponse) {
                        Action::AR4 => {
                            self.transport.send(&Pdu::ReleaseRP).context(TransportSnafu)?;
                            self.transport.artim.arm(self.artim_timeout);
                            self.linger_until_closed();
                            return Ok(());
                        }
                        action => {
                            tracing::warn!("unexpected action {:?} in release collision", action);
                        }
                    }
                }
                Action::AA3 => {
                    let _ = self.transport.close();
                    if let Pdu::AbortRQ { source } = pdu {
                        return AbortedSnafu { source_info: source }.fail();
                    }
                    return AbortedSnafu {
                        source_info: AbortRQSource::ServiceUser,
                    }
                    .fail();
                }
                Action::AA6 => continue,
                Action::AA8 => {
                    return self.protocol_abort(&pdu).map(|_| ());
                }
                action => {
                    tracing::warn!("unhandled release-phase action {:?}", action);
                }
            }
        }
    }

    /// Wait in Sta13 for the peer to close the connection,
    /// bounded by the ARTIM timer.
    pub fn linger_until_closed(&mut self) {
        while !self.transport.artim.expired() {
            let budget = self
                .transport
                .artim
                .remaining()
                .unwrap_or(self.artim_timeout)
                .max(Duration::from_millis(1));
            if self.transport.set_read_timeout(Some(budget)).is_err() {
                break;
            }
            match self.transport.receive() {
                // Sta13: everything is discarded by the machine
                Ok(pdu) => {
                    let _ = self.machine.step(Event::from_pdu(&pdu));
                }
                Err(transport::Error::ConnectionClosed) => {
                    self.machine.step(Event::TransportClosedIndication);
                    break;
                }
                Err(transport::Error::Timeout { .. }) => {
                    self.machine.step(Event::ArtimExpired);
                    break;
                }
                Err(_) => break,
            }
        }
        self.transport.artim.disarm();
        let _ = self.transport.close();
    }

    /// Issue an A-ABORT with the given source and close the connection.
    pub fn abort(&mut self, source: AbortRQSource) {
        match self.machine.step(Event::AAbortRequest) {
            Action::AA1 => {
                let _ = self.transport.send(&Pdu::AbortRQ { source });
                let _ = self.transport.close();
            }
            Action::AA2 => {
                self.transport.artim.disarm();
                let _ = self.transport.close();
            }
            _ => {
                let _ = self.transport.close();
            }
        }
    }
}
