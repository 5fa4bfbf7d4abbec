//! Association requester module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity requests the association.
//! See [`ClientAssociationOptions`]
//! for details and examples on how to create one.
use std::{
    borrow::Cow,
    collections::HashMap,
    convert::TryInto,
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use snafu::{ensure, ResultExt};
use tracing::{debug, warn};

use crate::{
    address::AeAddr,
    machine::{Action, Event, State},
    pdu::{
        AbortRQSource, AssociationAC, AssociationRQ, PDataValue, Pdu,
        PresentationContextNegotiated, PresentationContextProposed,
        PresentationContextResultReason, RoleSelection, SopClassExtendedNegotiation, UserIdentity,
        UserIdentityType, UserVariableItem, DEFAULT_MAX_PDU,
    },
    transport::{CloseSocket, PduTransport},
    IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME,
};

use super::{
    effective_roles, pdata::{PDataReader, PDataWriter}, uid::trim_uid, Association, Driver,
    NegotiatedOptions, Result, SocketOptions,
};

#[cfg(feature = "sync-tls")]
pub type TlsStream = rustls::StreamOwned<rustls::ClientConnection, std::net::TcpStream>;

/// The default ACSE timeout, bounding the wait
/// for the association response.
const DEFAULT_ACSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Establish a TCP connection honoring the socket options.
fn tcp_connection<T>(ae_address: &AeAddr<T>, opts: &SocketOptions) -> Result<TcpStream>
where
    T: ToSocketAddrs,
{
    let conn_result: Result<TcpStream> = if let Some(timeout) = opts.connection_timeout {
        let addresses = ae_address.to_socket_addrs().context(super::ToAddressSnafu)?;
        let mut result = Err(std::io::Error::from(std::io::ErrorKind::AddrNotAvailable));
        for address in addresses {
            result = TcpStream::connect_timeout(&address, timeout);
            if result.is_ok() {
                break;
            }
        }
        result.context(super::ConnectSnafu)
    } else {
        TcpStream::connect(ae_address).context(super::ConnectSnafu)
    };

    let socket = conn_result?;
    socket
        .set_read_timeout(opts.read_timeout)
        .context(super::SetReadTimeoutSnafu)?;
    socket
        .set_write_timeout(opts.write_timeout)
        .context(super::SetWriteTimeoutSnafu)?;
    Ok(socket)
}

#[cfg(feature = "sync-tls")]
fn tls_connection<T>(
    ae_address: &AeAddr<T>,
    server_name: &str,
    opts: &SocketOptions,
    tls_config: std::sync::Arc<rustls::ClientConfig>,
) -> Result<TlsStream>
where
    T: ToSocketAddrs,
{
    use std::convert::TryFrom;

    let socket = tcp_connection(ae_address, opts)?;
    let server_name = rustls::pki_types::ServerName::try_from(server_name.to_string())
        .context(super::InvalidServerNameSnafu)?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .context(super::TlsSessionSnafu)?;
    Ok(rustls::StreamOwned::new(conn, socket))
}

/// A DICOM association builder for a requesting node,
/// usually a service class user (SCU).
/// The outcome of a successful negotiation is a [`ClientAssociation`].
///
/// ## Basic usage
///
/// ```no_run
/// # use netdicom_ul::association::ClientAssociationOptions;
/// # use std::time::Duration;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let association = ClientAssociationOptions::new()
///     .with_presentation_context(
///         "1.2.840.10008.1.1",
///         vec!["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"],
///     )
///     .read_timeout(Duration::from_secs(60))
///     .establish("129.168.0.5:104")?;
/// # Ok(())
/// # }
/// ```
///
/// At least one presentation context must be specified,
/// either through [`with_presentation_context`][Self::with_presentation_context]
/// with an explicit transfer syntax list,
/// or through [`with_abstract_syntax`][Self::with_abstract_syntax],
/// which proposes the little endian transfer syntaxes.
///
/// Role selection, asynchronous operations window,
/// extended negotiation, and user identity items
/// are included in the request when the respective options are set.
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions<'a> {
    /// the calling AE title
    calling_ae_title: Cow<'a, str>,
    /// the called AE title, when overriding the address
    called_ae_title: Option<Cow<'a, str>>,
    /// the requested application context name
    application_context_name: Cow<'a, str>,
    /// the list of proposed presentation contexts
    presentation_contexts: Vec<(Cow<'a, str>, Vec<Cow<'a, str>>)>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length requested for receiving PDUs
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// SCU/SCP role selections to propose, by SOP class UID
    role_selections: Vec<RoleSelection>,
    /// asynchronous operations window (invoked, performed) to propose
    async_ops_window: Option<(u16, u16)>,
    /// SOP class extended negotiation items to propose
    extended_negotiations: Vec<SopClassExtendedNegotiation>,
    /// user identity username
    username: Option<Cow<'a, str>>,
    /// user identity password
    password: Option<Cow<'a, str>>,
    /// user identity Kerberos service ticket
    kerberos_service_ticket: Option<Cow<'a, str>>,
    /// user identity SAML assertion
    saml_assertion: Option<Cow<'a, str>>,
    /// user identity JWT
    jwt: Option<Cow<'a, str>>,
    /// whether to request a positive user identity response
    positive_response_requested: bool,
    /// bound on the wait for the association response
    acse_timeout: Option<Duration>,
    /// the implementation class UID to declare
    implementation_class_uid: Cow<'a, str>,
    /// the implementation version name to declare
    implementation_version_name: Cow<'a, str>,
    /// socket configuration
    socket_options: SocketOptions,
    /// TLS configuration for the connection
    #[cfg(feature = "sync-tls")]
    tls_config: Option<std::sync::Arc<rustls::ClientConfig>>,
    /// server name for TLS
    #[cfg(feature = "sync-tls")]
    server_name: Option<String>,
}

impl Default for ClientAssociationOptions<'_> {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "ANY-SCU".into(),
            called_ae_title: None,
            application_context_name: crate::pdu::APPLICATION_CONTEXT_NAME.into(),
            presentation_contexts: Vec::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            role_selections: Vec::new(),
            async_ops_window: None,
            extended_negotiations: Vec::new(),
            username: None,
            password: None,
            kerberos_service_ticket: None,
            saml_assertion: None,
            jwt: None,
            positive_response_requested: false,
            acse_timeout: Some(DEFAULT_ACSE_TIMEOUT),
            implementation_class_uid: IMPLEMENTATION_CLASS_UID.into(),
            implementation_version_name: IMPLEMENTATION_VERSION_NAME.into(),
            socket_options: SocketOptions::default(),
            #[cfg(feature = "sync-tls")]
            tls_config: None,
            #[cfg(feature = "sync-tls")]
            server_name: None,
        }
    }
}

impl<'a> ClientAssociationOptions<'a> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title,
    /// which refers to this DICOM node.
    ///
    /// The default is `ANY-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    /// Passing an empty string resets the AE title to the default
    /// (or to the one given via
    /// [`establish_with`](ClientAssociationOptions::establish_with)).
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let cae = called_ae_title.into();
        if cae.is_empty() {
            self.called_ae_title = None;
        } else {
            self.called_ae_title = Some(cae);
        }
        self
    }

    /// Include this presentation context
    /// in the list of proposed presentation contexts.
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<T>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let transfer_syntaxes: Vec<Cow<'a, str>> = transfer_syntax_uids
            .into_iter()
            .map(|ts| trim_uid(ts.into()))
            .collect();
        self.presentation_contexts
            .push((trim_uid(abstract_syntax_uid.into()), transfer_syntaxes));
        self
    }

    /// Propose this abstract syntax
    /// with the default transfer syntaxes
    /// (Explicit and Implicit VR Little Endian).
    pub fn with_abstract_syntax<T>(self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let default_transfer_syntaxes: Vec<Cow<'a, str>> =
            vec!["1.2.840.10008.1.2.1".into(), "1.2.840.10008.1.2".into()];
        self.with_presentation_context(abstract_syntax_uid.into(), default_transfer_syntaxes)
    }

    /// Propose SCU/SCP roles for one SOP class (Part 7 Annex D).
    ///
    /// Without this option, the default roles apply:
    /// this node as SCU, the peer as SCP.
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

    /// Propose an asynchronous operations window.
    ///
    /// The window is negotiated and surfaced,
    /// but this implementation keeps one outstanding
    /// operation per association.
    pub fn async_operations_window(mut self, invoked: u16, performed: u16) -> Self {
        self.async_ops_window = Some((invoked, performed));
        self
    }

    /// Include an SOP class extended negotiation item.
    pub fn with_extended_negotiation<T>(mut self, sop_class_uid: T, info: Vec<u8>) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.extended_negotiations.push(SopClassExtendedNegotiation {
            sop_class_uid: trim_uid(sop_class_uid.into()).to_string(),
            application_information: info,
        });
        self
    }

    /// Override the maximum PDU length
    /// that this application entity will admit.
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

    /// Bound the wait for the association response.
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

    /// Sets the user identity username.
    pub fn username<T>(mut self, username: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let username = username.into();
        if username.is_empty() {
            self.username = None;
        } else {
            self.username = Some(username);
            self.saml_assertion = None;
            self.jwt = None;
            self.kerberos_service_ticket = None;
        }
        self
    }

    /// Sets the user identity password.
    pub fn password<T>(mut self, password: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let password = password.into();
        if password.is_empty() {
            self.password = None;
        } else {
            self.password = Some(password);
            self.saml_assertion = None;
            self.jwt = None;
            self.kerberos_service_ticket = None;
        }
        self
    }

    /// Sets the user identity username and password.
    pub fn username_password<T, U>(self, username: T, password: U) -> Self
    where
        T: Into<Cow<'a, str>>,
        U: Into<Cow<'a, str>>,
    {
        self.username(username).password(password)
    }

    /// Sets the user identity Kerberos service ticket.
    pub fn kerberos_service_ticket<T>(mut self, ticket: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let ticket = ticket.into();
        if ticket.is_empty() {
            self.kerberos_service_ticket = None;
        } else {
            self.kerberos_service_ticket = Some(ticket);
            self.username = None;
            self.password = None;
            self.saml_assertion = None;
            self.jwt = None;
        }
        self
    }

    /// Sets the user identity SAML assertion.
    pub fn saml_assertion<T>(mut self, saml_assertion: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let saml_assertion = saml_assertion.into();
        if saml_assertion.is_empty() {
            self.saml_assertion = None;
        } else {
            self.saml_assertion = Some(saml_assertion);
            self.username = None;
            self.password = None;
            self.jwt = None;
            self.kerberos_service_ticket = None;
        }
        self
    }

    /// Sets the user identity JSON Web Token.
    pub fn jwt<T>(mut self, jwt: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let jwt = jwt.into();
        if jwt.is_empty() {
            self.jwt = None;
        } else {
            self.jwt = Some(jwt);
            self.username = None;
            self.password = None;
            self.saml_assertion = None;
            self.kerberos_service_ticket = None;
        }
        self
    }

    /// Request a positive user identity response from the acceptor.
    pub fn positive_response_requested(mut self, value: bool) -> Self {
        self.positive_response_requested = value;
        self
    }

    /// Set the read timeout for the underlying TCP socket.
    pub fn read_timeout(self, timeout: Duration) -> Self {
        Self {
            socket_options: SocketOptions {
                read_timeout: Some(timeout),
                ..self.socket_options
            },
            ..self
        }
    }

    /// Set the write timeout for the underlying TCP socket.
    pub fn write_timeout(self, timeout: Duration) -> Self {
        Self {
            socket_options: SocketOptions {
                write_timeout: Some(timeout),
                ..self.socket_options
            },
            ..self
        }
    }

    /// Set the connection timeout for the underlying TCP socket.
    pub fn connection_timeout(self, timeout: Duration) -> Self {
        Self {
            socket_options: SocketOptions {
                connection_timeout: Some(timeout),
                ..self.socket_options
            },
            ..self
        }
    }

    /// Set the TLS configuration to use for the connection.
    #[cfg(feature = "sync-tls")]
    pub fn tls_config(mut self, config: impl Into<std::sync::Arc<rustls::ClientConfig>>) -> Self {
        self.tls_config = Some(config.into());
        self
    }

    /// Set the server name to use for the TLS connection.
    #[cfg(feature = "sync-tls")]
    pub fn server_name(mut self, server_name: &str) -> Self {
        self.server_name = Some(server_name.to_string());
        self
    }

    /// Open a TCP connection to the given address
    /// and request a new DICOM association,
    /// negotiating the presentation contexts in the process.
    pub fn establish<A: ToSocketAddrs>(self, address: A) -> Result<ClientAssociation<TcpStream>> {
        let addr = AeAddr::new_socket_addr(address);
        let socket = tcp_connection(&addr, &self.socket_options)?;
        self.establish_impl(addr, socket)
    }

    /// Open a TCP connection and request a new DICOM association,
    /// accepting the called AE title alongside the socket address
    /// (`"AE-TITLE@host:port"`).
    /// An explicit [`called_ae_title`](Self::called_ae_title) option
    /// overrides the AE title in the address.
    #[allow(unreachable_patterns)]
    pub fn establish_with(self, ae_address: &str) -> Result<ClientAssociation<TcpStream>> {
        match ae_address.try_into() {
            Ok(ae_address) => {
                let socket = tcp_connection(&ae_address, &self.socket_options)?;
                self.establish_impl(ae_address, socket)
            }
            Err(_) => {
                let addr = AeAddr::new_socket_addr(ae_address);
                let socket = tcp_connection(&addr, &self.socket_options)?;
                self.establish_impl(addr, socket)
            }
        }
    }

    /// Open a TLS session to the given address
    /// and request a new DICOM association.
    #[cfg(feature = "sync-tls")]
    pub fn establish_tls<A: ToSocketAddrs>(self, address: A) -> Result<ClientAssociation<TlsStream>> {
        match (&self.tls_config, &self.server_name) {
            (Some(tls_config), Some(server_name)) => {
                let addr = AeAddr::new_socket_addr(address);
                let socket = tls_connection(
                    &addr,
                    server_name,
                    &self.socket_options,
                    tls_config.clone(),
                )?;
                self.establish_impl(addr, socket)
            }
            _ => super::TlsConfigMissingSnafu.fail(),
        }
    }

    /// Construct the A-ASSOCIATE-RQ PDU from these options.
    fn create_a_associate_rq(
        &self,
        ae_title: Option<&str>,
    ) -> Result<(Vec<PresentationContextProposed>, Pdu)> {
        ensure!(
            !self.presentation_contexts.is_empty(),
            super::MissingAbstractSyntaxSnafu
        );

        let called_ae_title: &str = match (&self.called_ae_title, ae_title) {
            (Some(aec), Some(aet)) => {
                if aec != aet {
                    warn!("Option `called_ae_title` overrides the AE title from `{aet}` to `{aec}`");
                }
                aec
            }
            (Some(aec), None) => aec,
            (None, Some(aet)) => aet,
            (None, None) => "ANY-SCP",
        };

        let presentation_contexts: Vec<_> = self
            .presentation_contexts
            .iter()
            .enumerate()
            .map(|(i, (abstract_syntax, transfer_syntaxes))| PresentationContextProposed {
                id: (2 * i + 1) as u8,
                abstract_syntax: abstract_syntax.to_string(),
                transfer_syntaxes: transfer_syntaxes.iter().map(|ts| ts.to_string()).collect(),
            })
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUid(self.implementation_class_uid.to_string()),
            UserVariableItem::ImplementationVersionName(
                self.implementation_version_name.to_string(),
            ),
        ];
        if let Some((invoked, performed)) = self.async_ops_window {
            user_variables.push(UserVariableItem::AsyncOperationsWindow(invoked, performed));
        }
        for role in &self.role_selections {
            user_variables.push(UserVariableItem::RoleSelection(role.clone()));
        }
        for neg in &self.extended_negotiations {
            user_variables.push(UserVariableItem::SopClassExtendedNegotiation(neg.clone()));
        }
        if let Some(user_identity) = self.user_identity() {
            user_variables.push(UserVariableItem::UserIdentity(user_identity));
        }

        Ok((
            presentation_contexts.clone(),
            Pdu::AssociationRQ(AssociationRQ {
                protocol_version: self.protocol_version,
                calling_ae_title: self.calling_ae_title.to_string(),
                called_ae_title: called_ae_title.to_string(),
                application_context_name: self.application_context_name.to_string(),
                presentation_contexts,
                user_variables,
            }),
        ))
    }

    fn user_identity(&self) -> Option<UserIdentity> {
        if let Some(username) = &self.username {
            let (identity_type, secondary) = match &self.password {
                Some(password) => (
                    UserIdentityType::UsernamePassword,
                    password.as_bytes().to_vec(),
                ),
                None => (UserIdentityType::Username, Vec::new()),
            };
            return Some(UserIdentity::new(
                self.positive_response_requested,
                identity_type,
                username.as_bytes().to_vec(),
                secondary,
            ));
        }
        if let Some(ticket) = &self.kerberos_service_ticket {
            return Some(UserIdentity::new(
                self.positive_response_requested,
                UserIdentityType::KerberosServiceTicket,
                ticket.as_bytes().to_vec(),
                Vec::new(),
            ));
        }
        if let Some(saml_assertion) = &self.saml_assertion {
            return Some(UserIdentity::new(
                self.positive_response_requested,
                UserIdentityType::SamlAssertion,
                saml_assertion.as_bytes().to_vec(),
                Vec::new(),
            ));
        }
        if let Some(jwt) = &self.jwt {
            return Some(UserIdentity::new(
                self.positive_response_requested,
                UserIdentityType::Jwt,
                jwt.as_bytes().to_vec(),
                Vec::new(),
            ));
        }
        None
    }

    /// Reconcile the A-ASSOCIATE-AC with the proposed contexts.
    fn process_association_ac(
        &self,
        ac: AssociationAC,
        proposed: &[PresentationContextProposed],
    ) -> Result<NegotiatedOptions> {
        let AssociationAC {
            protocol_version,
            called_ae_title,
            application_context_name: _,
            calling_ae_title: _,
            presentation_contexts: ac_contexts,
            user_variables,
        } = ac;

        ensure!(
            self.protocol_version == protocol_version,
            super::ProtocolVersionMismatchSnafu {
                expected: self.protocol_version,
                got: protocol_version,
            }
        );

        let peer_max_pdu_length = user_variables
            .iter()
            .find_map(|item| match item {
                UserVariableItem::MaxLength(len) => Some(*len),
                _ => None,
            })
            .unwrap_or(DEFAULT_MAX_PDU);

        let replied_roles: HashMap<&str, &RoleSelection> = user_variables
            .iter()
            .filter_map(|item| match item {
                UserVariableItem::RoleSelection(role) => {
                    Some((role.sop_class_uid.as_str(), role))
                }
                _ => None,
            })
            .collect();
        let proposed_roles: HashMap<&str, &RoleSelection> = self
            .role_selections
            .iter()
            .map(|role| (role.sop_class_uid.as_str(), role))
            .collect();

        // every proposed context appears in the negotiated view;
        // an ID missing from the AC is a refusal
        let presentation_contexts: Vec<_> = proposed
            .iter()
            .map(|pc| {
                let result = ac_contexts.iter().find(|c| c.id == pc.id);
                let (reason, transfer_syntax) = match result {
                    Some(c) => (c.reason, c.transfer_syntax.clone()),
                    None => (
                        PresentationContextResultReason::NoReason,
                        String::new(),
                    ),
                };
                let (scu_role, scp_role) = effective_roles(
                    proposed_roles.get(pc.abstract_syntax.as_str()).copied(),
                    replied_roles.get(pc.abstract_syntax.as_str()).copied(),
                );
                PresentationContextNegotiated {
                    id: pc.id,
                    reason,
                    abstract_syntax: pc.abstract_syntax.clone(),
                    transfer_syntax,
                    scu_role,
                    scp_role,
                }
            })
            .collect();

        if !presentation_contexts.iter().any(|pc| pc.is_accepted()) {
            return super::NoAcceptedPresentationContextsSnafu.fail();
        }

        Ok(NegotiatedOptions {
            peer_max_pdu_length,
            user_variables,
            presentation_contexts,
            peer_ae_title: called_ae_title,
        })
    }

    /// Drive the association request over an open connection.
    fn establish_impl<T, S>(self, ae_address: AeAddr<T>, socket: S) -> Result<ClientAssociation<S>>
    where
        T: ToSocketAddrs,
        S: CloseSocket + std::io::Read + std::io::Write,
    {
        let (proposed, a_associate_rq) = self.create_a_associate_rq(ae_address.ae_title())?;

        let artim_timeout = self.acse_timeout.unwrap_or(DEFAULT_ACSE_TIMEOUT);
        let mut driver = Driver::new(
            PduTransport::new(socket, self.max_pdu_length, self.strict),
            artim_timeout,
        );

        // connection is open: request, then send the RQ
        driver.machine.step(Event::AAssociateRequest);
        match driver.machine.step(Event::TransportConnectConfirm) {
            Action::AE2 => {
                driver
                    .transport
                    .send(&a_associate_rq)
                    .context(super::TransportSnafu)?;
            }
            action => {
                tracing::error!("unexpected action {:?} on connect", action);
            }
        }

        // the ACSE timeout governs the wait in Sta5
        driver
            .transport
            .set_read_timeout(self.acse_timeout)
            .context(super::SetReadTimeoutSnafu)?;

        let resp = match driver.transport.receive() {
            Ok(pdu) => pdu,
            Err(e @ crate::transport::Error::Timeout { .. }) => {
                // ACSE timeout escalates to an abort
                driver.abort(AbortRQSource::ServiceUser);
                return Err(e).context(super::TransportSnafu);
            }
            Err(e) => {
                driver.machine.step(Event::TransportClosedIndication);
                return Err(e).context(super::TransportSnafu);
            }
        };

        let event = Event::from_pdu(&resp);
        match driver.machine.step(event) {
            Action::AE3 => {
                let ac = match resp {
                    Pdu::AssociationAC(ac) => ac,
                    _ => unreachable!("AE3 is only produced for an A-ASSOCIATE-AC"),
                };
                match self.process_association_ac(ac, &proposed) {
                    Ok(negotiated) => {
                        debug!(
                            "association with {} established ({} accepted presentation contexts)",
                            negotiated.peer_ae_title,
                            negotiated
                                .presentation_contexts
                                .iter()
                                .filter(|pc| pc.is_accepted())
                                .count(),
                        );
                        driver
                            .transport
                            .set_peer_max_pdu_length(negotiated.peer_max_pdu_length);
                        driver
                            .transport
                            .set_read_timeout(self.socket_options.read_timeout)
                            .context(super::SetReadTimeoutSnafu)?;
                        Ok(ClientAssociation {
                            driver,
                            negotiated,
                            local_max_pdu_length: self.max_pdu_length,
                            read_timeout: self.socket_options.read_timeout,
                            write_timeout: self.socket_options.write_timeout,
                        })
                    }
                    Err(e) => {
                        // negotiation failure on our side: abort
                        driver.abort(AbortRQSource::ServiceUser);
                        Err(e)
                    }
                }
            }
            Action::AE4 => {
                let _ = driver.transport.close();
                match resp {
                    Pdu::AssociationRJ(association_rj) => {
                        super::RejectedSnafu { association_rj }.fail()
                    }
                    _ => unreachable!("AE4 is only produced for an A-ASSOCIATE-RJ"),
                }
            }
            Action::AA3 => {
                let _ = driver.transport.close();
                match resp {
                    Pdu::AbortRQ { source } => super::AbortedSnafu { source_info: source }.fail(),
                    _ => unreachable!("AA3 is only produced for an A-ABORT"),
                }
            }
            Action::AA8 => driver.protocol_abort(&resp).map(|_| unreachable!()),
            _ => {
                driver.abort(AbortRQSource::ServiceUser);
                super::UnexpectedPduSnafu { pdu: Box::new(resp) }.fail()
            }
        }
    }
}

/// A DICOM upper layer association
/// from the perspective of the requesting application entity.
///
/// The usual operations of an established association are
/// [`send`](Self::send) and [`receive`](Self::receive).
/// Sending large data sets may be easier through
/// [`send_pdata`](Self::send_pdata).
///
/// When the value falls out of scope,
/// the program will automatically try to gracefully release
/// the association through a release message exchange,
/// then shut down the underlying TCP connection.
#[derive(Debug)]
pub struct ClientAssociation<S>
where
    S: CloseSocket + std::io::Read + std::io::Write,
{
    /// the per-connection driver: state machine plus transport
    driver: Driver<S>,
    /// the outcome of the negotiation
    negotiated: NegotiatedOptions,
    /// the maximum PDU length that this node declared
    local_max_pdu_length: u32,
    /// timeout for individual socket reads
    read_timeout: Option<Duration>,
    /// timeout for individual socket writes
    write_timeout: Option<Duration>,
}

impl<S> Association for ClientAssociation<S>
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

impl<S> ClientAssociation<S>
where
    S: CloseSocket + std::io::Read + std::io::Write,
{
    /// The user information items sent by the acceptor.
    pub fn user_variables(&self) -> &[UserVariableItem] {
        &self.negotiated.user_variables
    }

    /// The server response of user identity negotiation, if one arrived.
    pub fn user_identity_response(&self) -> Option<&[u8]> {
        self.negotiated.user_variables.iter().find_map(|item| match item {
            UserVariableItem::UserIdentityResponse(response) => Some(response.as_slice()),
            _ => None,
        })
    }

    /// The configured read timeout.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// The configured write timeout.
    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
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

    /// Gracefully release the association,
    /// resolving a simultaneous release from the peer if it occurs.
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

/// Automatically release the association and close the connection.
impl<S> Drop for ClientAssociation<S>
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
