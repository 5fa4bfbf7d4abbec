//! The application entity.
//!
//! An [`ApplicationEntity`] holds the identity and policy
//! of one DICOM node: its AE title, timers, maximum PDU length,
//! the presentation contexts it requests as an SCU
//! and supports as an SCP, and the peer screening lists.
//! From it, [`associate`](ApplicationEntity::associate)
//! produces ready-to-use SCU sessions,
//! and [`start_server`](ApplicationEntity::start_server)
//! runs an accept loop with one service thread per association.
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use netdicom_ul::association::{
    AeTitleAllowList, ClientAssociation, ClientAssociationOptions, ServerAssociationOptions,
};
use netdicom_ul::pdu::DEFAULT_MAX_PDU;
use snafu::{Report, ResultExt};
use tracing::{debug, info, warn};

use crate::error::*;
use crate::events::ServiceHandlers;
use crate::scp;
use crate::scu::DimseScu;
use crate::Result;

/// The well-known port for DICOM upper layer associations.
pub const DICOM_WELL_KNOWN_PORT: u16 = 104;

/// The IANA-registered alternative port, common for unprivileged SCPs.
pub const DICOM_DEFAULT_PORT: u16 = 11112;

const DEFAULT_ACSE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_DIMSE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(60);

/// The configuration of one DICOM application entity.
#[derive(Debug, Clone)]
pub struct ApplicationEntity {
    /// this node's AE title
    ae_title: String,
    /// bound on association negotiation waits
    acse_timeout: Option<Duration>,
    /// bound on each DIMSE response wait
    dimse_timeout: Option<Duration>,
    /// bound on individual socket operations
    network_timeout: Option<Duration>,
    /// bound on TCP connection establishment
    connection_timeout: Option<Duration>,
    /// the maximum PDU length admitted on receive (0 means unlimited)
    max_pdu_length: u32,
    /// calling AE titles admitted as an acceptor (empty admits all)
    require_calling_ae_titles: Vec<String>,
    /// called AE titles admitted as an acceptor (empty admits all)
    require_called_ae_titles: Vec<String>,
    /// presentation contexts proposed when associating
    requested_contexts: Vec<(String, Vec<String>)>,
    /// abstract syntaxes served as an acceptor
    supported_contexts: Vec<String>,
    /// transfer syntaxes admitted as an acceptor
    /// (empty means registry-driven)
    supported_transfer_syntaxes: Vec<String>,
    /// SCU/SCP role selections per SOP class
    role_selections: Vec<(String, bool, bool)>,
    /// implementation class UID override
    implementation_class_uid: Option<String>,
    /// implementation version name override
    implementation_version_name: Option<String>,
}

impl Default for ApplicationEntity {
    fn default() -> Self {
        ApplicationEntity {
            ae_title: "ANY-SCU".to_string(),
            acse_timeout: Some(DEFAULT_ACSE_TIMEOUT),
            dimse_timeout: Some(DEFAULT_DIMSE_TIMEOUT),
            network_timeout: Some(DEFAULT_NETWORK_TIMEOUT),
            connection_timeout: None,
            max_pdu_length: DEFAULT_MAX_PDU,
            require_calling_ae_titles: Vec::new(),
            require_called_ae_titles: Vec::new(),
            requested_contexts: Vec::new(),
            supported_contexts: Vec::new(),
            supported_transfer_syntaxes: Vec::new(),
            role_selections: Vec::new(),
            implementation_class_uid: None,
            implementation_version_name: None,
        }
    }
}

impl ApplicationEntity {
    /// Create an application entity with the given AE title.
    pub fn new(ae_title: impl Into<String>) -> Self {
        ApplicationEntity {
            ae_title: ae_title.into(),
            ..Default::default()
        }
    }

    /// This node's AE title.
    pub fn ae_title(&self) -> &str {
        &self.ae_title
    }

    /// Bound association negotiation waits. `None` waits indefinitely.
    pub fn acse_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acse_timeout = timeout;
        self
    }

    /// Bound each DIMSE response wait. `None` waits indefinitely.
    pub fn dimse_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dimse_timeout = timeout;
        self
    }

    /// Bound individual socket operations. `None` waits indefinitely.
    pub fn network_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.network_timeout = timeout;
        self
    }

    /// Bound TCP connection establishment.
    pub fn connection_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Override the maximum PDU length admitted on receive.
    /// Zero means unlimited.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Only accept associations from this calling AE title
    /// (may be called multiple times; empty list admits all).
    pub fn require_calling_ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.require_calling_ae_titles.push(ae_title.into());
        self
    }

    /// Only accept associations towards this called AE title
    /// (may be called multiple times; empty list admits all).
    pub fn require_called_ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.require_called_ae_titles.push(ae_title.into());
        self
    }

    /// Propose this presentation context when associating.
    pub fn with_requested_context(
        mut self,
        abstract_syntax_uid: impl Into<String>,
        transfer_syntax_uids: Vec<String>,
    ) -> Self {
        self.requested_contexts
            .push((abstract_syntax_uid.into(), transfer_syntax_uids));
        self
    }

    /// Propose this abstract syntax with the little endian
    /// transfer syntaxes when associating.
    pub fn with_requested_abstract_syntax(self, abstract_syntax_uid: impl Into<String>) -> Self {
        self.with_requested_context(
            abstract_syntax_uid,
            vec![
                "1.2.840.10008.1.2.1".to_string(),
                "1.2.840.10008.1.2".to_string(),
            ],
        )
    }

    /// Serve this abstract syntax as an acceptor.
    pub fn with_supported_context(mut self, abstract_syntax_uid: impl Into<String>) -> Self {
        self.supported_contexts.push(abstract_syntax_uid.into());
        self
    }

    /// Admit this transfer syntax as an acceptor.
    /// Without any, all registry-supported syntaxes are admitted.
    pub fn with_supported_transfer_syntax(
        mut self,
        transfer_syntax_uid: impl Into<String>,
    ) -> Self {
        self.supported_transfer_syntaxes
            .push(transfer_syntax_uid.into());
        self
    }

    /// Declare the SCU/SCP roles for one SOP class,
    /// proposed when associating and replied as an acceptor.
    pub fn with_role_selection(
        mut self,
        sop_class_uid: impl Into<String>,
        scu: bool,
        scp: bool,
    ) -> Self {
        self.role_selections.push((sop_class_uid.into(), scu, scp));
        self
    }

    /// Override the implementation class UID declared in negotiation.
    pub fn implementation_class_uid(mut self, uid: impl Into<String>) -> Self {
        self.implementation_class_uid = Some(uid.into());
        self
    }

    /// Override the implementation version name declared in negotiation.
    pub fn implementation_version_name(mut self, name: impl Into<String>) -> Self {
        self.implementation_version_name = Some(name.into());
        self
    }

    fn client_options(&self) -> ClientAssociationOptions<'static> {
        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(self.ae_title.clone())
            .max_pdu_length(self.max_pdu_length)
            .acse_timeout(self.acse_timeout);
        for (abstract_syntax, transfer_syntaxes) in &self.requested_contexts {
            options = options
                .with_presentation_context(abstract_syntax.clone(), transfer_syntaxes.clone());
        }
        for (sop_class, scu, scp) in &self.role_selections {
            options = options.with_role_selection(sop_class.clone(), *scu, *scp);
        }
        if let Some(uid) = &self.implementation_class_uid {
            options = options.implementation_class_uid(uid.clone());
        }
        if let Some(name) = &self.implementation_version_name {
            options = options.implementation_version_name(name.clone());
        }
        if let Some(timeout) = self.network_timeout {
            options = options.read_timeout(timeout).write_timeout(timeout);
        }
        if let Some(timeout) = self.connection_timeout {
            options = options.connection_timeout(timeout);
        }
        options
    }

    fn server_options(&self) -> ServerAssociationOptions<'static, AeTitleAllowList> {
        let mut options = ServerAssociationOptions::new()
            .ae_title(self.ae_title.clone())
            .max_pdu_length(self.max_pdu_length)
            .acse_timeout(self.acse_timeout)
            .accept_ae_titles(
                self.require_calling_ae_titles.clone(),
                self.require_called_ae_titles.clone(),
            );
        for abstract_syntax in &self.supported_contexts {
            options = options.with_abstract_syntax(abstract_syntax.clone());
        }
        for transfer_syntax in &self.supported_transfer_syntaxes {
            options = options.with_transfer_syntax(transfer_syntax.clone());
        }
        for (sop_class, scu, scp) in &self.role_selections {
            options = options.with_role_selection(sop_class.clone(), *scu, *scp);
        }
        if let Some(uid) = &self.implementation_class_uid {
            options = options.implementation_class_uid(uid.clone());
        }
        if let Some(name) = &self.implementation_version_name {
            options = options.implementation_version_name(name.clone());
        }
        if let Some(timeout) = self.network_timeout {
            options = options.read_timeout(timeout).write_timeout(timeout);
        }
        options
    }

    /// Open a connection to the given address,
    /// negotiate an association with the requested contexts,
    /// and return the SCU session once established.
    pub fn associate<A: ToSocketAddrs>(
        &self,
        address: A,
    ) -> Result<DimseScu<ClientAssociation<TcpStream>>> {
        let association = self
            .client_options()
            .establish(address)
            .context(AssociationSnafu)?;
        Ok(DimseScu::new(
            association,
            self.dimse_timeout,
            self.network_timeout,
        ))
    }

    /// Like [`associate`](Self::associate),
    /// accepting the called AE title alongside the address
    /// (`"AE-TITLE@host:port"`).
    pub fn associate_with(
        &self,
        ae_address: &str,
    ) -> Result<DimseScu<ClientAssociation<TcpStream>>> {
        let association = self
            .client_options()
            .establish_with(ae_address)
            .context(AssociationSnafu)?;
        Ok(DimseScu::new(
            association,
            self.dimse_timeout,
            self.network_timeout,
        ))
    }

    /// Bind the given address and serve incoming associations,
    /// one thread per accepted connection,
    /// each running the handlers produced by `handler_factory`.
    ///
    /// Returns a handle to inspect the bound address
    /// and to shut the server down.
    pub fn start_server<F>(
        &self,
        bind_address: impl ToSocketAddrs,
        handler_factory: F,
    ) -> Result<ServerHandle>
    where
        F: Fn() -> ServiceHandlers + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(bind_address).context(StartServerSnafu)?;
        let local_addr = listener.local_addr().context(StartServerSnafu)?;
        info!("{} listening on {}", self.ae_title, local_addr);

        let options = self.server_options();
        let dimse_timeout = self.dimse_timeout;
        let network_timeout = self.network_timeout;
        let handler_factory = Arc::new(handler_factory);
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let join = std::thread::spawn(move || {
            for stream in listener.incoming() {
                if shutdown_flag.load(Ordering::SeqCst) {
                    break;
                }
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("failed to accept connection: {}", e);
                        continue;
                    }
                };
                let options = options.clone();
                let handler_factory = Arc::clone(&handler_factory);
                std::thread::spawn(move || {
                    let peer = stream
                        .peer_addr()
                        .map(|addr| addr.to_string())
                        .unwrap_or_else(|_| "unknown".to_string());
                    debug!("incoming connection from {}", peer);
                    match options.establish(stream) {
                        Ok(association) => {
                            let mut handlers = handler_factory();
                            if let Err(e) = scp::serve(
                                association,
                                &mut handlers,
                                dimse_timeout,
                                network_timeout,
                            ) {
                                warn!(
                                    "association with {} ended in error: {}",
                                    peer,
                                    Report::from_error(e)
                                );
                            }
                        }
                        Err(e) => {
                            warn!(
                                "could not establish association with {}: {}",
                                peer,
                                Report::from_error(e)
                            );
                        }
                    }
                });
            }
        });

        Ok(ServerHandle {
            local_addr,
            shutdown,
            join,
        })
    }
}

/// A handle over a running accept loop.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl ServerHandle {
    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for the accept loop to end.
    ///
    /// Associations already in progress run to completion
    /// on their own threads.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // unblock the accept call
        let _ = TcpStream::connect(self.local_addr);
        if self.join.join().is_err() {
            warn!("server accept loop panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_defaults() {
        let ae = ApplicationEntity::default();
        assert_eq!(ae.ae_title(), "ANY-SCU");
        assert_eq!(ae.max_pdu_length, DEFAULT_MAX_PDU);
        assert_eq!(ae.acse_timeout, Some(Duration::from_secs(30)));
        assert_eq!(ae.dimse_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn builder_accumulates_contexts() {
        let ae = ApplicationEntity::new("TEST-SCP")
            .with_supported_context("1.2.840.10008.1.1")
            .with_supported_context("1.2.840.10008.5.1.4.1.1.2")
            .with_requested_abstract_syntax("1.2.840.10008.1.1")
            .require_calling_ae_title("TRUSTED-SCU");
        assert_eq!(ae.supported_contexts.len(), 2);
        assert_eq!(ae.requested_contexts.len(), 1);
        assert_eq!(ae.require_calling_ae_titles, vec!["TRUSTED-SCU"]);
    }
}
