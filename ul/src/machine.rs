//! Upper layer protocol state machine.
//!
//! This module implements the DICOM upper layer finite state machine
//! as a pure transition function over
//! the thirteen protocol states ([`State`]),
//! the nineteen protocol events ([`Event`]),
//! and the actions an association driver must carry out ([`Action`]).
//!
//! The machine itself performs no I/O:
//! a driver feeds it every local service primitive
//! and every PDU read from the transport,
//! then executes the returned action
//! (sending PDUs, issuing indications, arming or stopping the ARTIM timer,
//! opening or closing the transport connection)
//! before processing the next event.
//! Keeping all side effects in the driver gives the machine
//! a single writer by construction.

use crate::pdu::Pdu;

/// The states of the upper layer protocol machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Idle, no transport connection.
    Sta1,
    /// Transport connection open, awaiting A-ASSOCIATE-RQ PDU.
    Sta2,
    /// Awaiting local A-ASSOCIATE response primitive.
    Sta3,
    /// Awaiting transport connection opening to complete.
    Sta4,
    /// Awaiting A-ASSOCIATE-AC or A-ASSOCIATE-RJ PDU.
    Sta5,
    /// Association established and ready for data transfer.
    Sta6,
    /// Awaiting A-RELEASE-RP PDU.
    Sta7,
    /// Awaiting local A-RELEASE response primitive.
    Sta8,
    /// Release collision requestor side: awaiting A-RELEASE response primitive.
    Sta9,
    /// Release collision acceptor side: awaiting A-RELEASE-RP PDU.
    Sta10,
    /// Release collision requestor side: awaiting A-RELEASE-RP PDU.
    Sta11,
    /// Release collision acceptor side: awaiting A-RELEASE response primitive.
    Sta12,
    /// Awaiting transport connection close indication.
    Sta13,
}

/// The role this application entity took in the association,
/// which resolves the release collision fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// This node requested the association.
    Requestor,
    /// This node accepted the association.
    Acceptor,
}

/// The events consumed by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// A-ASSOCIATE request primitive from the local user.
    AAssociateRequest,
    /// The outgoing transport connection was confirmed.
    TransportConnectConfirm,
    /// An A-ASSOCIATE-AC PDU was received.
    AAssociateAcReceived,
    /// An A-ASSOCIATE-RJ PDU was received.
    AAssociateRjReceived,
    /// An incoming transport connection was accepted.
    TransportConnectIndication,
    /// An A-ASSOCIATE-RQ PDU was received.
    AAssociateRqReceived,
    /// A-ASSOCIATE response primitive (accept) from the local user.
    AAssociateResponseAccept,
    /// A-ASSOCIATE response primitive (reject) from the local user.
    AAssociateResponseReject,
    /// P-DATA request primitive from the local user.
    PDataRequest,
    /// A P-DATA-TF PDU was received.
    PDataTfReceived,
    /// A-RELEASE request primitive from the local user.
    AReleaseRequest,
    /// An A-RELEASE-RQ PDU was received.
    AReleaseRqReceived,
    /// An A-RELEASE-RP PDU was received.
    AReleaseRpReceived,
    /// A-RELEASE response primitive from the local user.
    AReleaseResponse,
    /// A-ABORT request primitive from the local user.
    AAbortRequest,
    /// An A-ABORT PDU was received.
    AAbortReceived,
    /// The transport connection was closed by the peer.
    TransportClosedIndication,
    /// The ARTIM timer expired.
    ArtimExpired,
    /// An unrecognized or invalid PDU was received.
    InvalidPdu,
}

impl Event {
    /// All defined events, in protocol numbering order.
    pub const ALL: [Event; 19] = [
        Event::AAssociateRequest,
        Event::TransportConnectConfirm,
        Event::AAssociateAcReceived,
        Event::AAssociateRjReceived,
        Event::TransportConnectIndication,
        Event::AAssociateRqReceived,
        Event::AAssociateResponseAccept,
        Event::AAssociateResponseReject,
        Event::PDataRequest,
        Event::PDataTfReceived,
        Event::AReleaseRequest,
        Event::AReleaseRqReceived,
        Event::AReleaseRpReceived,
        Event::AReleaseResponse,
        Event::AAbortRequest,
        Event::AAbortReceived,
        Event::TransportClosedIndication,
        Event::ArtimExpired,
        Event::InvalidPdu,
    ];

    /// The receive event corresponding to a PDU read from the transport.
    pub fn from_pdu(pdu: &Pdu) -> Event {
        match pdu {
            Pdu::AssociationRQ { .. } => Event::AAssociateRqReceived,
            Pdu::AssociationAC { .. } => Event::AAssociateAcReceived,
            Pdu::AssociationRJ { .. } => Event::AAssociateRjReceived,
            Pdu::PData { .. } => Event::PDataTfReceived,
            Pdu::ReleaseRQ => Event::AReleaseRqReceived,
            Pdu::ReleaseRP => Event::AReleaseRpReceived,
            Pdu::AbortRQ { .. } => Event::AAbortReceived,
            Pdu::Unknown { .. } => Event::InvalidPdu,
        }
    }
}

/// The actions a driver must execute after a transition.
///
/// Each variant corresponds to one combined action of the protocol:
/// the driver performs every step of the variant it receives,
/// in the order written here, before processing the next event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Issue a transport connect request to the peer.
    AE1,
    /// Send the A-ASSOCIATE-RQ PDU.
    AE2,
    /// Issue an A-ASSOCIATE confirmation (accept) to the local user.
    AE3,
    /// Issue an A-ASSOCIATE confirmation (reject) to the local user
    /// and close the transport connection.
    AE4,
    /// Issue a transport response and start the ARTIM timer.
    AE5,
    /// Stop the ARTIM timer and issue an A-ASSOCIATE indication
    /// to the local user for an accept/reject decision.
    AE6,
    /// Send the A-ASSOCIATE-AC PDU.
    AE7,
    /// Send the A-ASSOCIATE-RJ PDU and start the ARTIM timer.
    AE8,
    /// Send the P-DATA-TF PDU.
    DT1,
    /// Issue a P-DATA indication to the local user.
    DT2,
    /// Send the A-RELEASE-RQ PDU.
    AR1,
    /// Issue an A-RELEASE indication to the local user.
    AR2,
    /// Issue an A-RELEASE confirmation to the local user
    /// and close the transport connection.
    AR3,
    /// Send the A-RELEASE-RP PDU and start the ARTIM timer.
    AR4,
    /// Stop the ARTIM timer.
    AR5,
    /// Issue a P-DATA indication to the local user
    /// (data arriving while release is in progress).
    AR6,
    /// Send the P-DATA-TF PDU (data leaving while release is in progress).
    AR7,
    /// Issue an A-RELEASE indication for a release collision.
    AR8,
    /// Send the A-RELEASE-RP PDU.
    AR9,
    /// Issue an A-RELEASE confirmation to the local user.
    AR10,
    /// Send an A-ABORT PDU with the service-user source
    /// and start (or restart) the ARTIM timer.
    AA1,
    /// Stop the ARTIM timer and close the transport connection.
    AA2,
    /// Issue an A-ABORT (or A-P-ABORT) indication to the local user
    /// and close the transport connection.
    AA3,
    /// Issue an A-P-ABORT indication to the local user.
    AA4,
    /// Stop the ARTIM timer.
    AA5,
    /// Ignore the incoming PDU.
    AA6,
    /// Send an A-ABORT PDU with the service-provider source.
    AA7,
    /// Send an A-ABORT PDU with the service-provider source,
    /// issue an A-P-ABORT indication to the local user,
    /// and start the ARTIM timer.
    AA8,
}

impl Action {
    /// Whether executing this action emits an A-ABORT PDU.
    pub fn emits_abort(self) -> bool {
        matches!(self, Action::AA1 | Action::AA7 | Action::AA8)
    }
}

/// The outcome of one transition: the action to execute
/// and the state the machine moves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// the action the driver must carry out
    pub action: Action,
    /// the state entered by this transition
    pub next: State,
}

const fn t(action: Action, next: State) -> Transition {
    Transition { action, next }
}

/// The transition function over (state, event).
///
/// This function is total: pairs with no transition defined
/// by the protocol resolve to the protocol error action
/// ([`Action::AA8`]), except in [`State::Sta13`]
/// where stray events are ignored so that nothing follows
/// a terminating abort or release on the wire.
///
/// Two deliberate deviations from the bare standard table:
/// P-DATA-TF received in Sta8 through Sta12 is forwarded
/// to the local user ([`Action::DT2`]) rather than treated
/// as a protocol error, tolerating peers which interleave
/// data (such as N-EVENT-REPORT) with an ongoing release.
pub fn transition(state: State, role: Role, event: Event) -> Transition {
    use Action::*;
    use Event::*;
    use State::*;

    match (state, event) {
        // establishment, requestor side
        (Sta1, AAssociateRequest) => t(AE1, Sta4),
        (Sta4, TransportConnectConfirm) => t(AE2, Sta5),
        (Sta5, AAssociateAcReceived) => t(AE3, Sta6),
        (Sta5, AAssociateRjReceived) => t(AE4, Sta1),

        // establishment, acceptor side
        (Sta1, TransportConnectIndication) => t(AE5, Sta2),
        (Sta2, AAssociateRqReceived) => t(AE6, Sta3),
        (Sta3, AAssociateResponseAccept) => t(AE7, Sta6),
        (Sta3, AAssociateResponseReject) => t(AE8, Sta13),

        // data transfer
        (Sta6, PDataRequest) => t(DT1, Sta6),
        (Sta6, PDataTfReceived) => t(DT2, Sta6),

        // graceful release
        (Sta6, AReleaseRequest) => t(AR1, Sta7),
        (Sta6, AReleaseRqReceived) => t(AR2, Sta8),
        (Sta7, AReleaseRpReceived) => t(AR3, Sta1),
        (Sta7, PDataTfReceived) => t(AR6, Sta7),
        (Sta8, PDataRequest) => t(AR7, Sta8),
        (Sta8, AReleaseResponse) => t(AR4, Sta13),

        // release collision
        (Sta7, AReleaseRqReceived) => match role {
            Role::Requestor => t(AR8, Sta9),
            Role::Acceptor => t(AR8, Sta10),
        },
        (Sta9, AReleaseResponse) => t(AR9, Sta11),
        (Sta10, AReleaseRpReceived) => t(AR10, Sta12),
        (Sta11, AReleaseRpReceived) => t(AR3, Sta1),
        (Sta12, AReleaseResponse) => t(AR4, Sta13),

        // data tolerated while the release handshake completes
        (Sta8, PDataTfReceived)
        | (Sta9, PDataTfReceived)
        | (Sta10, PDataTfReceived)
        | (Sta11, PDataTfReceived)
        | (Sta12, PDataTfReceived) => t(DT2, state),

        // local abort request
        (Sta3, AAbortRequest)
        | (Sta5, AAbortRequest)
        | (Sta6, AAbortRequest)
        | (Sta7, AAbortRequest)
        | (Sta8, AAbortRequest)
        | (Sta9, AAbortRequest)
        | (Sta10, AAbortRequest)
        | (Sta11, AAbortRequest)
        | (Sta12, AAbortRequest) => t(AA1, Sta13),
        (Sta4, AAbortRequest) => t(AA2, Sta1),

        // peer abort
        (Sta2, AAbortReceived) | (Sta13, AAbortReceived) => t(AA2, Sta1),
        (Sta3, AAbortReceived)
        | (Sta5, AAbortReceived)
        | (Sta6, AAbortReceived)
        | (Sta7, AAbortReceived)
        | (Sta8, AAbortReceived)
        | (Sta9, AAbortReceived)
        | (Sta10, AAbortReceived)
        | (Sta11, AAbortReceived)
        | (Sta12, AAbortReceived) => t(AA3, Sta1),

        // nothing to send and nothing to abort without a transport connection
        (Sta1, _) => t(AA6, Sta1),

        // transport closed
        (Sta2, TransportClosedIndication) => t(AA5, Sta1),
        (Sta13, TransportClosedIndication) => t(AR5, Sta1),
        (_, TransportClosedIndication) => t(AA4, Sta1),

        // ARTIM expiry governs Sta2 and Sta13 only
        (Sta2, ArtimExpired) | (Sta13, ArtimExpired) => t(AA2, Sta1),

        // PDUs arriving before the association request was seen
        (Sta2, AAssociateAcReceived)
        | (Sta2, AAssociateRjReceived)
        | (Sta2, PDataTfReceived)
        | (Sta2, AReleaseRqReceived)
        | (Sta2, AReleaseRpReceived)
        | (Sta2, InvalidPdu) => t(AA1, Sta13),

        // anything reaching a dying association is dropped;
        // an unrecognized PDU or a fresh associate request still
        // warrants telling the peer off (AA-7), unless an abort
        // was already emitted (handled by `StateMachine::step`)
        (Sta13, AAssociateRqReceived) | (Sta13, InvalidPdu) => t(AA7, Sta13),
        (Sta13, _) => t(AA6, Sta13),

        // everything else is a protocol error
        _ => t(AA8, Sta13),
    }
}

/// The upper layer protocol machine of one association.
///
/// Owned and driven by exactly one association driver;
/// the `&mut self` discipline is the single-writer guarantee.
#[derive(Debug)]
pub struct StateMachine {
    state: State,
    role: Role,
    abort_emitted: bool,
}

impl StateMachine {
    /// Create a state machine in the idle state.
    pub fn new() -> Self {
        StateMachine {
            state: State::Sta1,
            role: Role::Requestor,
            abort_emitted: false,
        }
    }

    /// The current protocol state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The role this node took in the association.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether an A-ABORT PDU has been emitted on this association.
    pub fn abort_emitted(&self) -> bool {
        self.abort_emitted
    }

    /// Process one event, move to the next state,
    /// and return the action for the driver to execute.
    pub fn step(&mut self, event: Event) -> Action {
        match event {
            Event::AAssociateRequest => self.role = Role::Requestor,
            Event::TransportConnectIndication => self.role = Role::Acceptor,
            _ => {}
        }

        let Transition { mut action, next } = transition(self.state, self.role, event);

        // once an A-ABORT is on the wire, nothing else may follow it
        if self.abort_emitted && action == Action::AA7 {
            action = Action::AA6;
        }
        if action.emits_abort() {
            self.abort_emitted = true;
        }

        tracing::trace!(
            "fsm: {:?} --{:?}--> {:?} ({:?})",
            self.state,
            event,
            next,
            action
        );
        self.state = next;
        action
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        StateMachine::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Action::*;
    use super::Event::*;
    use super::State::*;
    use super::*;

    const ALL_STATES: [State; 13] = [
        Sta1, Sta2, Sta3, Sta4, Sta5, Sta6, Sta7, Sta8, Sta9, Sta10, Sta11, Sta12, Sta13,
    ];

    #[test]
    fn requestor_establishment_and_release() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.step(AAssociateRequest), AE1);
        assert_eq!(sm.state(), Sta4);
        assert_eq!(sm.step(TransportConnectConfirm), AE2);
        assert_eq!(sm.state(), Sta5);
        assert_eq!(sm.step(AAssociateAcReceived), AE3);
        assert_eq!(sm.state(), Sta6);

        assert_eq!(sm.step(PDataRequest), DT1);
        assert_eq!(sm.step(PDataTfReceived), DT2);
        assert_eq!(sm.state(), Sta6);

        assert_eq!(sm.step(AReleaseRequest), AR1);
        assert_eq!(sm.state(), Sta7);
        assert_eq!(sm.step(AReleaseRpReceived), AR3);
        assert_eq!(sm.state(), Sta1);
    }

    #[test]
    fn acceptor_establishment_and_release() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.step(TransportConnectIndication), AE5);
        assert_eq!(sm.state(), Sta2);
        assert_eq!(sm.step(AAssociateRqReceived), AE6);
        assert_eq!(sm.state(), Sta3);
        assert_eq!(sm.step(AAssociateResponseAccept), AE7);
        assert_eq!(sm.state(), Sta6);

        assert_eq!(sm.step(AReleaseRqReceived), AR2);
        assert_eq!(sm.state(), Sta8);
        assert_eq!(sm.step(AReleaseResponse), AR4);
        assert_eq!(sm.state(), Sta13);
        assert_eq!(sm.step(TransportClosedIndication), AR5);
        assert_eq!(sm.state(), Sta1);
    }

    #[test]
    fn acceptor_rejection() {
        let mut sm = StateMachine::new();
        sm.step(TransportConnectIndication);
        sm.step(AAssociateRqReceived);
        assert_eq!(sm.step(AAssociateResponseReject), AE8);
        assert_eq!(sm.state(), Sta13);
        assert_eq!(sm.step(ArtimExpired), AA2);
        assert_eq!(sm.state(), Sta1);
    }

    /// Both peers release at once; both must converge to Sta1.
    #[test]
    fn release_collision_converges_on_both_sides() {
        // requestor side: Sta7 -> Sta9 -> Sta11 -> Sta1
        let mut requestor = StateMachine::new();
        requestor.step(AAssociateRequest);
        requestor.step(TransportConnectConfirm);
        requestor.step(AAssociateAcReceived);
        requestor.step(AReleaseRequest);
        assert_eq!(requestor.step(AReleaseRqReceived), AR8);
        assert_eq!(requestor.state(), Sta9);
        assert_eq!(requestor.step(AReleaseResponse), AR9);
        assert_eq!(requestor.state(), Sta11);
        assert_eq!(requestor.step(AReleaseRpReceived), AR3);
        assert_eq!(requestor.state(), Sta1);

        // acceptor side: Sta7 -> Sta10 -> Sta12 -> Sta13 -> Sta1
        let mut acceptor = StateMachine::new();
        acceptor.step(TransportConnectIndication);
        acceptor.step(AAssociateRqReceived);
        acceptor.step(AAssociateResponseAccept);
        acceptor.step(AReleaseRequest);
        assert_eq!(acceptor.step(AReleaseRqReceived), AR8);
        assert_eq!(acceptor.state(), Sta10);
        assert_eq!(acceptor.step(AReleaseRpReceived), AR10);
        assert_eq!(acceptor.state(), Sta12);
        assert_eq!(acceptor.step(AReleaseResponse), AR4);
        assert_eq!(acceptor.state(), Sta13);
        assert_eq!(acceptor.step(TransportClosedIndication), AR5);
        assert_eq!(acceptor.state(), Sta1);
    }

    /// Every (state, event) pair must resolve to a transition,
    /// and no defined transition in a dying state may send a PDU
    /// other than the sanctioned A-ABORT responses.
    #[test]
    fn transition_function_is_total() {
        for state in ALL_STATES {
            for event in Event::ALL {
                for role in [Role::Requestor, Role::Acceptor] {
                    let tr = transition(state, role, event);
                    // without a connection nothing can be sent,
                    // so undefined pairs in Sta1 must be ignored
                    if state == Sta1
                        && !matches!(
                            event,
                            AAssociateRequest | TransportConnectIndication
                        )
                    {
                        assert_eq!(
                            tr.action, AA6,
                            "Sta1 must ignore {:?} when no transition is defined",
                            event
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn unexpected_pdu_takes_protocol_error_path() {
        // A-RELEASE-RP out of the blue in Sta6
        let mut sm = StateMachine::new();
        sm.step(AAssociateRequest);
        sm.step(TransportConnectConfirm);
        sm.step(AAssociateAcReceived);
        assert_eq!(sm.step(AReleaseRpReceived), AA8);
        assert_eq!(sm.state(), Sta13);
    }

    #[test]
    fn pdata_during_release_is_forwarded() {
        for (state, role) in [
            (Sta8, Role::Acceptor),
            (Sta9, Role::Requestor),
            (Sta10, Role::Acceptor),
            (Sta11, Role::Requestor),
            (Sta12, Role::Acceptor),
        ] {
            let tr = transition(state, role, PDataTfReceived);
            assert_eq!(tr.action, DT2);
            assert_eq!(tr.next, state);
        }
        // and in Sta7, with the release-specific action
        let tr = transition(Sta7, Role::Requestor, PDataTfReceived);
        assert_eq!(tr.action, AR6);
        assert_eq!(tr.next, Sta7);
    }

    /// After an abort is emitted, no further PDU-sending actions
    /// may be produced by the machine.
    #[test]
    fn no_pdu_follows_an_emitted_abort() {
        let mut sm = StateMachine::new();
        sm.step(AAssociateRequest);
        sm.step(TransportConnectConfirm);
        sm.step(AAssociateAcReceived);

        // protocol error: abort goes on the wire
        let action = sm.step(AReleaseRpReceived);
        assert_eq!(action, AA8);
        assert!(sm.abort_emitted());
        assert_eq!(sm.state(), Sta13);

        // stray PDUs afterwards must all be ignored
        for event in [
            AAssociateAcReceived,
            AAssociateRjReceived,
            AAssociateRqReceived,
            PDataTfReceived,
            AReleaseRqReceived,
            AReleaseRpReceived,
            InvalidPdu,
        ] {
            let action = sm.step(event);
            assert!(
                !action.emits_abort() && action != DT1 && action != AR1,
                "{:?} after abort produced {:?}",
                event,
                action
            );
            assert_eq!(sm.state(), Sta13);
        }

        // until the socket finally goes away
        assert_eq!(sm.step(TransportClosedIndication), AR5);
        assert_eq!(sm.state(), Sta1);
    }

    #[test]
    fn artim_expiry_closes_pending_states_only() {
        assert_eq!(transition(Sta2, Role::Acceptor, ArtimExpired).action, AA2);
        assert_eq!(transition(Sta13, Role::Acceptor, ArtimExpired).action, AA2);
        // not armed anywhere else
        assert_eq!(transition(Sta6, Role::Acceptor, ArtimExpired).action, AA8);
    }
}
