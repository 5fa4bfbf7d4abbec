//! Association acceptor module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity listens for association requests.
//! See [`ServerAssociationOptions`]
//! for details and examples on how to accept one.
use std::{borrow::Cow, collections::HashMap, time::Duration};

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{ensure, ResultExt};
use tracing::{debug, warn};

use crate::{
    machine::{Action, Event, State},
    pdu::{
        AbortRQSource, AssociationAC, AssociationRJ, AssociationRJResult,
        AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ, PDataValue, Pdu,
        PresentationContextNegotiated, PresentationContextResult, PresentationContextResultReason,
        RoleSelection, UserIdentity, UserVariableItem, DEFAULT_MAX_PDU,
    },
    transport::{CloseSocket, PduTransport},
    IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME,
};

use super::{
    effective_roles,
    pdata::{PDataReader, PDataWriter},
    uid::trim_uid,
    Association, Driver, NegotiatedOptions, Result, SocketOptions,
};

const DEFAULT_ACSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Common interface for application entity access control policies.
///
/// Decides whether an incoming association request is given clearance,
/// based on the recorded application entity titles
/// and/or the user identity provided in negotiation.
pub trait AccessControl {
    /// Returns `Ok(())` if the requesting node should be accepted,
    /// otherwise the rejection reason to reply with.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason>;
}

/// An access control rule that accepts any association request.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control rule that only accepts requests
/// whose called AE title matches this node's AE title.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAeTitleNotRecognized)
        }
    }
}

/// An access control rule driven by allow-lists of AE titles.
///
/// An empty list means that the respective check is not performed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AeTitleAllowList {
    /// the admitted calling AE titles
    pub calling_ae_titles: Vec<String>,
    /// the admitted called AE titles
    pub called_ae_titles: Vec<String>,
}

impl AccessControl for AeTitleAllowList {
    fn check_access(
        &self,
        _this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if !self.calling_ae_titles.is_empty()
            && !self
                .calling_ae_titles
                .iter()
                .any(|aet| aet == calling_ae_title)
        {
            return Err(AssociationRJServiceUserReason::CallingAeTitleNotRecognized);
        }
        if !self.called_ae_titles.is_empty()
            && !self.called_ae_titles.iter().any(|aet| aet == called_ae_title)
        {
            return Err(AssociationRJServiceUserReason::CalledAeTitleNotRecognized);
        }
        Ok(())
    }
}

/// A DICOM association builder for an accepting node,
/// usually a service class provider (SCP).
///
/// Unlike the requestor options, a value of this type
/// can be reused across multiple incoming connections.
///
/// ## Example
///
/// ```no_run
/// # use std::net::TcpListener;
/// # use netdicom_ul::association::ServerAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// # let tcp_listener: TcpListener = unimplemented!();
/// let scp_options = ServerAssociationOptions::new()
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .with_transfer_syntax("1.2.840.10008.1.2.1");
///
/// let (stream, _address) = tcp_listener.accept()?;
/// scp_options.establish(stream)?;
/// # Ok(())
/// # }
/// ```
///
/// The SCP will accept any transfer syntax supported by
/// the main [transfer syntax registry][dicom_transfer_syntax_registry]
/// unless an explicit list is given
/// through [`with_transfer_syntax`](Self::with_transfer_syntax).
#[derive(Debug, Clone)]
pub struct ServerAssociationOptions<'a, A> {
    /// the application entity access control policy
    ae_access_control: A,
    /// the AE title of this DICOM node
    ae_title: Cow<'a, str>,
    /// the expected application context name
    application_context_name: Cow<'a, str>,
    /// the supported abstract syntaxes
    abstract_syntax_uids: Vec<Cow<'a, str>>,
    /// the supported transfer syntaxes (empty means registry-driven)
    transfer_syntax_uids: Vec<Cow<'a, str>>,
    /// SCU/SCP roles supported per SOP class,
    /// replied when the peer proposes role selection
    role_selections: Vec<RoleSelection>,
    /// the user identity server response,
    /// sent when a positive response is requested
    user_identity_server_response: Option<Vec<u8>>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length admitted on receive
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// whether to accept unknown abstract syntaxes
    promiscuous: bool,
    /// bound on the wait for the association request (the ARTIM timer)
    acse_timeout: Option<Duration>,
    /// the implementation class UID to declare
    implementation_class_uid: Cow<'a, str>,
    /// the implementation version name to declare
    implementation_version_name: Cow<'a, str>,
    /// socket configuration after establishment
    socket_options: SocketOptions,
}

impl Default for ServerAssociationOptions<'_, AcceptAny> {
    fn default() -> Self {
        ServerAssociationOptions {
            ae_access_control: AcceptAny,
            ae_title: "ANY-SCP".into(),
            application_context_name: crate::pdu::APPLICATION_CONTEXT_NAME.into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            role_selections: Vec::new(),
            user_identity_server_response: None,
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            promiscuous: false,
            acse_timeout: Some(DEFAULT_ACSE_TIMEOUT),
            implementation_class_uid: IMPLEMENTATION_CLASS_UID.into(),
            implementation_version_name: IMPLEMENTATION_VERSION_NAME.into(),
            socket_options: SocketOptions::default(),
        }
    }
}

impl ServerAssociationOptions<'_, AcceptAny> {
    /// Create a new set of options for accepting an association.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a, A> ServerAssociationOptions<'a, A>
where
    A: AccessControl,
{
    /// Accept any association request
    /// regardless of the specified AE titles.
    ///
    /// This is the default policy.
    pub fn accept_any(self) -> ServerAssociationOptions<'a, AcceptAny> {
        self.ae_access_control(AcceptAny)
    }

    /// Accept an association request only when
    /// the called AE title matches this node's AE title.
    pub fn accept_called_ae_title(self) -> ServerAssociationOptions<'a, AcceptCalledAeTitle> {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Accept association requests whose calling and called AE titles
    /// appear in the given allow-lists (empty lists admit all).
    pub fn accept_ae_titles(
        self,
        calling_ae_titles: Vec<String>,
        called_ae_titles: Vec<String>,
    ) -> ServerAssociationOptions<'a, AeTitleAllowList> {
        self.ae_access_control(AeTitleAllowList {
            calling_ae_titles,
            called_ae_titles,
        })
    }

    /// Change the access control policy.
    pub fn ae_access_control<P>(self, access_control: P) -> ServerAssociationOptions<'a, P>
    where
        P: AccessControl,
    {
        let ServerAssociationOptions {
            ae_access_control: _,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            role_selections,
            user_identity_server_response,
            protocol_version,
            max_pdu_length,
            strict,
            promiscuous,
            acse_timeout,
            implementation_class_uid,
            implementation_version_name,
            socket_options,
        } = self;

        ServerAssociationOptions {
            ae_access_control: access_control,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            role_selections,
            user_identity_server_response,
            protocol_version,
            max_pdu_length,
            strict,
            promiscuous,
            acse_timeout,
            implementation_class_uid,
            implementation_version_name,
            socket_options,
        }
    }

    /// Define the application entity title of this DICOM node.
    ///
    /// The default is `ANY-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Include this abstract syntax
    /// in the list of accepted presentation contexts.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.abstract_syntax_uids
            .push(trim_uid(abstract_syntax_uid.into()));
        self
    }

    /// Include this transfer syntax
    /// in the list of accepted transfer syntaxes.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.transfer_syntax_uids
            .push(trim_uid(transfer_syntax_uid.into()));
        self
    }

    /// Declare the SCU/SCP roles this node supports for one SOP class,
    /// replied when the requestor proposes role selection for it.
    pub fn with_role_selection<T>(mut self, sop_class_uid: T, scu: bool, scp: bool) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.role_selections.push(RoleSelection {
            sop_class_uid: trim_uid(sop_class_uid.into()).to_string(),
            scu_role: scu,
            scp_role: scp,
        });
        self
    }

    /// Define the server response for user identity negotiation,
    /// sent when the requestor asks for a positive response.
    pub fn user_identity_response(mut self, response: Vec<u8>) -> Self {
        self.user_identity_server_response = Some(response);
        self
    }

    /// Override the maximum expected PDU length.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether receiving PDUs must not
    /// surpass the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Accept abstract syntaxes not in the supported list
    /// (useful for proxies and sniffers). Off by default.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Bound the wait for the association request.
    /// The default is 30 seconds.
    pub fn acse_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acse_timeout = timeout;
        self
    }

    /// Override the implementation class UID declared in negotiation.
    pub fn implementation_class_uid<T>(mut self, uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.implementation_class_uid = trim_uid(uid.into());
        self
    }

    /// Override the implementation version name declared in negotiation.
    pub fn implementation_version_name<T>(mut self, name: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.implementation_version_name = name.into();
        self
    }

    /// Set the read timeout for the established association.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.socket_options.read_timeout = Some(timeout);
        self
    }

    /// Set the write timeout for the underlying TCP socket.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.socket_options.write_timeout = Some(timeout);
        self
    }

    /// Negotiate an association with the device connected
    /// through the given stream.
    pub fn establish<S>(&self, socket: S) -> Result<ServerAssociation<S>>
    where
        S: CloseSocket + std::io::Read + std::io::Write,
    {
        ensure!(
            !self.abstract_syntax_uids.is_empty() || self.promiscuous,
            super::MissingAbstractSyntaxSnafu
        );

        let artim_timeout = self.acse_timeout.unwrap_or(DEFAULT_ACSE_TIMEOUT);
        let mut driver = Driver::new(
            PduTransport::new(socket, self.max_pdu_length, self.strict),
            artim_timeout,
        );

        // connection indication: start the ARTIM timer
        driver.machine.step(Event::TransportConnectIndication);
        driver.transport.artim.arm(artim_timeout);
        driver
            .transport
            .set_read_timeout(Some(artim_timeout))
            .context(super::SetReadTimeoutSnafu)?;

        let pdu = match driver.transport.receive() {
            Ok(pdu) => pdu,
            Err(e @ crate::transport::Error::Timeout { .. }) => {
                driver.machine.step(Event::ArtimExpired);
                driver.transport.artim.disarm();
                let _ = driver.transport.close();
                return Err(e).context(super::TransportSnafu);
            }
            Err(e) => {
                driver.machine.step(Event::TransportClosedIndication);
                return Err(e).context(super::TransportSnafu);
            }
        };

        let event = Event::from_pdu(&pdu);
        match driver.machine.step(event) {
            Action::AE6 => {
                driver.transport.artim.disarm();
            }
            Action::AA1 => {
                // not an association request: tell the peer off
                let _ = driver.transport.send(&Pdu::AbortRQ {
                    source: AbortRQSource::ServiceUser,
                });
                let _ = driver.transport.close();
                return super::UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail();
            }
            Action::AA2 => {
                driver.transport.artim.disarm();
                let _ = driver.transport.close();
                return match pdu {
                    Pdu::AbortRQ { source } => super::AbortedSnafu {
                        source_info: source,
                    }
                    .fail(),
                    pdu => super::UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail(),
                };
            }
            action => {
                warn!("unexpected action {:?} awaiting association request", action);
                let _ = driver.transport.close();
                return super::UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail();
            }
        }

        let rq = match pdu {
            Pdu::AssociationRQ(rq) => rq,
            _ => unreachable!("AE6 is only produced for an A-ASSOCIATE-RQ"),
        };

        // screen the request before negotiating contexts
        if let Err(rejection) = self.screen_request(&rq) {
            return self.reject(driver, rejection);
        }

        let AssociationRQ {
            protocol_version: _,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts: requested_contexts,
            user_variables: rq_user_variables,
        } = rq;

        let peer_max_pdu_length = rq_user_variables
            .iter()
            .find_map(|item| match item {
                UserVariableItem::MaxLength(len) => Some(*len),
                _ => None,
            })
            .unwrap_or(DEFAULT_MAX_PDU);

        let user_identity = rq_user_variables.iter().find_map(|item| match item {
            UserVariableItem::UserIdentity(identity) => Some(identity.clone()),
            _ => None,
        });

        // presentation context negotiation
        let negotiated_contexts = self.negotiate_contexts(&requested_contexts, &rq_user_variables);
        let ac_contexts: Vec<PresentationContextResult> = negotiated_contexts
            .iter()
            .map(|pc| PresentationContextResult {
                id: pc.id,
                reason: pc.reason,
                transfer_syntax: if pc.transfer_syntax.is_empty() {
                    // not significant on refusal, but the field is mandatory
                    "1.2.840.10008.1.2".to_string()
                } else {
                    pc.transfer_syntax.clone()
                },
            })
            .collect();

        let mut ac_user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUid(self.implementation_class_uid.to_string()),
            UserVariableItem::ImplementationVersionName(
                self.implementation_version_name.to_string(),
            ),
        ];
        // reply role selections for the proposed SOP classes we know
        let our_roles: HashMap<&str, &RoleSelection> = self
            .role_selections
            .iter()
            .map(|role| (role.sop_class_uid.as_str(), role))
            .collect();
        for item in &rq_user_variables {
            if let UserVariableItem::RoleSelection(proposed) = item {
                if let Some(ours) = our_roles.get(proposed.sop_class_uid.as_str()) {
                    ac_user_variables.push(UserVariableItem::RoleSelection(RoleSelection {
                        sop_class_uid: proposed.sop_class_uid.clone(),
                        scu_role: proposed.scu_role && ours.scu_role,
                        scp_role: proposed.scp_role && ours.scp_role,
                    }));
                }
            }
        }
        if let Some(identity) = &user_identity {
            if identity.positive_response_requested() {
                let response = self
                    .user_identity_server_response
                    .clone()
                    .unwrap_or_default();
                ac_user_variables.push(UserVariableItem::UserIdentityResponse(response));
            }
        }

        let ac = Pdu::AssociationAC(AssociationAC {
            protocol_version: self.protocol_version,
            calling_ae_title: calling_ae_title.clone(),
            called_ae_title: called_ae_title.clone(),
            application_context_name,
            presentation_contexts: ac_contexts,
            user_variables: ac_user_variables,
        });

        match driver.machine.step(Event::AAssociateResponseAccept) {
            Action::AE7 => {
                driver.transport.send(&ac).context(super::TransportSnafu)?;
            }
            action => {
                warn!("unexpected action {:?} on association accept", action);
            }
        }

        debug!(
            "association with {} established ({} accepted presentation contexts)",
            calling_ae_title,
            negotiated_contexts.iter().filter(|pc| pc.is_accepted()).count(),
        );

        driver.transport.set_peer_max_pdu_length(peer_max_pdu_length);
        driver
            .transport
            .set_read_timeout(self.socket_options.read_timeout)
            .context(super::SetReadTimeoutSnafu)?;

        Ok(ServerAssociation {
            driver,
            negotiated: NegotiatedOptions {
                peer_max_pdu_length,
                user_variables: rq_user_variables,
                presentation_contexts: negotiated_contexts,
                peer_ae_title: calling_ae_title,
            },
            called_ae_title,
            user_identity,
            local_max_pdu_length: self.max_pdu_length,
        })
    }

    /// Validate the association request,
    /// returning the rejection to emit when it fails screening.
    fn screen_request(&self, rq: &AssociationRQ) -> Result<(), AssociationRJ> {
        // only protocol version 1 is defined; bit 0 must be set
        if rq.protocol_version & 0x01 == 0 {
            return Err(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceProviderAsce(
                    crate::pdu::AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported,
                ),
            });
        }
        if rq.application_context_name != self.application_context_name {
            return Err(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
                ),
            });
        }
        let user_identity = rq.user_variables.iter().find_map(|item| match item {
            UserVariableItem::UserIdentity(identity) => Some(identity),
            _ => None,
        });
        if let Err(reason) = self.ae_access_control.check_access(
            &self.ae_title,
            &rq.calling_ae_title,
            &rq.called_ae_title,
            user_identity,
        ) {
            return Err(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(reason),
            });
        }
        Ok(())
    }

    /// Send the rejection and wind the connection down.
    fn reject<S>(
        &self,
        mut driver: Driver<S>,
        association_rj: AssociationRJ,
    ) -> Result<ServerAssociation<S>>
    where
        S: CloseSocket + std::io::Read + std::io::Write,
    {
        match driver.machine.step(Event::AAssociateResponseReject) {
            Action::AE8 => {
                let _ = driver
                    .transport
                    .send(&Pdu::AssociationRJ(association_rj));
                driver.transport.artim.arm(driver.artim_timeout);
                driver.linger_until_closed();
            }
            action => {
                warn!("unexpected action {:?} on association reject", action);
                let _ = driver.transport.close();
            }
        }
        super::RejectedSnafu { association_rj }.fail()
    }

    /// Negotiate each requested presentation context.
    fn negotiate_contexts(
        &self,
        requested: &[crate::pdu::PresentationContextProposed],
        rq_user_variables: &[UserVariableItem],
    ) -> Vec<PresentationContextNegotiated> {
        let proposed_roles: HashMap<&str, &RoleSelection> = rq_user_variables
            .iter()
            .filter_map(|item| match item {
                UserVariableItem::RoleSelection(role) => {
                    Some((role.sop_class_uid.as_str(), role))
                }
                _ => None,
            })
            .collect();
        let our_roles: HashMap<&str, &RoleSelection> = self
            .role_selections
            .iter()
            .map(|role| (role.sop_class_uid.as_str(), role))
            .collect();

        requested
            .iter()
            .map(|pc| {
                let known = self
                    .abstract_syntax_uids
                    .iter()
                    .any(|uid| uid == &pc.abstract_syntax)
                    || self.promiscuous;

                let (reason, transfer_syntax) = if !known {
                    (
                        PresentationContextResultReason::AbstractSyntaxNotSupported,
                        String::new(),
                    )
                } else {
                    match self.choose_transfer_syntax(&pc.transfer_syntaxes) {
                        Some(ts) => (PresentationContextResultReason::Acceptance, ts),
                        None => (
                            PresentationContextResultReason::TransferSyntaxesNotSupported,
                            String::new(),
                        ),
                    }
                };

                // the acceptor's SCU/SCP roles mirror the requestor's:
                // what they invoke, we perform
                let (peer_scu, peer_scp) = effective_roles(
                    proposed_roles.get(pc.abstract_syntax.as_str()).copied(),
                    our_roles.get(pc.abstract_syntax.as_str()).copied(),
                );
                PresentationContextNegotiated {
                    id: pc.id,
                    reason,
                    abstract_syntax: pc.abstract_syntax.clone(),
                    transfer_syntax,
                    scu_role: peer_scp,
                    scp_role: peer_scu,
                }
            })
            .collect()
    }

    /// From the proposed transfer syntaxes,
    /// choose the first which is both in the accepted list
    /// (when one was given) and supported by the registry.
    fn choose_transfer_syntax(&self, proposed: &[String]) -> Option<String> {
        proposed
            .iter()
            .find(|ts| {
                let listed = self.transfer_syntax_uids.is_empty()
                    || self.transfer_syntax_uids.iter().any(|ours| ours == *ts);
                listed
                    && TransferSyntaxRegistry
                        .get(ts)
                        .filter(|ts| !ts.is_unsupported())
                        .is_some()
            })
            .cloned()
    }
}

/// A DICOM upper layer association
/// from the perspective of the accepting application entity.
///
/// The most common operations of an established association are
/// [`send`](Self::send) and [`receive`](Self::receive).
#[derive(Debug)]
pub struct ServerAssociation<S>
where
    S: CloseSocket + std::io::Read + std::io::Write,
{
    /// the per-connection driver: state machine plus transport
    driver: Driver<S>,
    /// the outcome of the negotiation
    negotiated: NegotiatedOptions,
    /// the called AE title from the request
    called_ae_title: String,
    /// the user identity provided by the requestor, if any
    user_identity: Option<UserIdentity>,
    /// the maximum PDU length that this node declared
    local_max_pdu_length: u32,
}

impl<S> Association for ServerAssociation<S>
where
    S: CloseSocket + std::io::Read + std::io::Write,
{
    fn peer_ae_title(&self) -> &str {
        &self.negotiated.peer_ae_title
    }

    fn local_max_pdu_length(&self) -> u32 {
        self.local_max_pdu_length
    }

    fn peer_max_pdu_length(&self) -> u32 {
        self.negotiated.peer_max_pdu_length
    }

    fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        &self.negotiated.presentation_contexts
    }
}

impl<S> ServerAssociation<S>
where
    S: CloseSocket + std::io::Read + std::io::Write,
{
    /// The application entity title of the requesting node.
    pub fn client_ae_title(&self) -> &str {
        &self.negotiated.peer_ae_title
    }

    /// The called AE title in the association request.
    pub fn called_ae_title(&self) -> &str {
        &self.called_ae_title
    }

    /// The user information items sent by the requestor.
    pub fn user_variables(&self) -> &[UserVariableItem] {
        &self.negotiated.user_variables
    }

    /// The user identity provided in negotiation, if any.
    pub fn user_identity(&self) -> Option<&UserIdentity> {
        self.user_identity.as_ref()
    }

    /// The current upper layer protocol state.
    pub fn state(&self) -> State {
        self.driver.machine.state()
    }

    /// Bound how long a single receive may block on the socket.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.driver
            .transport
            .set_read_timeout(timeout)
            .context(super::SetReadTimeoutSnafu)
    }

    /// Send a PDU message to the peer.
    pub fn send(&mut self, pdu: &Pdu) -> Result<()> {
        self.driver.send(pdu)
    }

    /// Read the next PDU message from the peer.
    pub fn receive(&mut self) -> Result<Pdu> {
        self.driver.receive()
    }

    /// Data set fragments received while a release was in progress,
    /// in arrival order.
    pub fn take_pending_data(&mut self) -> Vec<PDataValue> {
        std::mem::take(&mut self.driver.pending_data)
    }

    /// Respond to the peer's release request,
    /// completing the release handshake.
    ///
    /// Call after [`receive`](Self::receive) returned
    /// [`Pdu::ReleaseRQ`].
    pub fn respond_release(mut self) -> Result<()> {
        self.driver.send(&Pdu::ReleaseRP)?;
        self.driver.linger_until_closed();
        Ok(())
    }

    /// Gracefully release the association from this side.
    ///
    /// Data set fragments which the peer interleaved
    /// with the release handshake are returned in arrival order,
    /// so that message exchange layers can still consume them.
    pub fn release(mut self) -> Result<Vec<PDataValue>> {
        self.driver.release()?;
        Ok(std::mem::take(&mut self.driver.pending_data))
    }

    /// Send an abort message and shut down the connection,
    /// terminating the association.
    pub fn abort(mut self) -> Result<()> {
        self.driver.abort(AbortRQSource::ServiceUser);
        Ok(())
    }

    /// Prepare a P-Data writer for sending
    /// a data set split into one or more PDUs.
    ///
    /// The writer works on the inner stream directly;
    /// only use it while the association is established
    /// and no other exchange is in flight.
    pub fn send_pdata(&mut self, presentation_context_id: u8) -> PDataWriter<&mut S> {
        let max_pdu_length = self.negotiated.peer_max_pdu_length;
        PDataWriter::new(
            self.driver.transport.inner(),
            presentation_context_id,
            max_pdu_length,
        )
    }

    /// Prepare a P-Data reader for receiving
    /// a data set which may span multiple PDUs.
    ///
    /// The reader works on the inner stream directly;
    /// only use it while the association is established
    /// and no other exchange is in flight.
    pub fn receive_pdata(&mut self) -> PDataReader<'_, &mut S> {
        let max_pdu_length = self.local_max_pdu_length;
        let (socket, read_buffer) = self.driver.transport.parts();
        PDataReader::new(socket, max_pdu_length, read_buffer)
    }

    /// Obtain access to the inner stream.
    ///
    /// Reading and writing should be done with care
    /// to avoid inconsistencies in the association state:
    /// do not use while not in a PDU boundary.
    pub fn inner_stream(&mut self) -> &mut S {
        self.driver.transport.inner()
    }
}

/// Close the connection when the association falls out of scope.
impl<S> Drop for ServerAssociation<S>
where
    S: CloseSocket + std::io::Read + std::io::Write,
{
    fn drop(&mut self) {
        match self.driver.machine.state() {
            State::Sta6 => {
                let _ = self.driver.release();
            }
            State::Sta1 => {}
            _ => {
                let _ = self.driver.transport.close();
            }
        }
    }
}
