//! The DIMSE request/response engine.
//!
//! A [`DimseProvider`] drives one established association:
//! it fragments outgoing messages into presentation data values
//! sized to the peer's maximum PDU length,
//! reassembles incoming fragments into messages,
//! allocates message IDs, correlates responses to outstanding requests,
//! and enforces the DIMSE timer on every wait.
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use netdicom_ul::association::{self, Association, ClientAssociation, ServerAssociation};
use netdicom_ul::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, PDataValue, PDataValueType, Pdu,
    PresentationContextNegotiated,
};
use netdicom_ul::transport::CloseSocket;
use snafu::{OptionExt, ResultExt};
use tracing::{debug, warn};

use crate::assembler::{Assembled, DataWithoutCommandSnafu, MessageAssembler};
use crate::error::*;
use crate::messages::CommandSet;
use crate::Result;

/// The message exchange interface required of an association,
/// provided by both the requestor and acceptor sides.
pub trait UpperLayer {
    /// Send one PDU.
    fn send_pdu(&mut self, pdu: &Pdu) -> Result<(), association::Error>;

    /// Receive the next PDU.
    fn receive_pdu(&mut self) -> Result<Pdu, association::Error>;

    /// The negotiated presentation contexts.
    fn presentation_contexts(&self) -> &[PresentationContextNegotiated];

    /// The maximum PDU length declared by the peer.
    fn peer_max_pdu_length(&self) -> u32;

    /// The peer's application entity title.
    fn peer_ae_title(&self) -> &str;

    /// Bound how long a single receive may block.
    fn set_read_timeout(&mut self, timeout: Option<Duration>)
        -> Result<(), association::Error>;

    /// Gracefully release the association.
    fn release(self) -> Result<(), association::Error>
    where
        Self: Sized;

    /// Abort the association and close the connection.
    fn abort(self) -> Result<(), association::Error>
    where
        Self: Sized;
}

impl<S> UpperLayer for ClientAssociation<S>
where
    S: CloseSocket + std::io::Read + std::io::Write,
{
    fn send_pdu(&mut self, pdu: &Pdu) -> Result<(), association::Error> {
        self.send(pdu)
    }

    fn receive_pdu(&mut self) -> Result<Pdu, association::Error> {
        self.receive()
    }

    fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        Association::presentation_contexts(self)
    }

    fn peer_max_pdu_length(&self) -> u32 {
        Association::peer_max_pdu_length(self)
    }

    fn peer_ae_title(&self) -> &str {
        Association::peer_ae_title(self)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), association::Error> {
        ClientAssociation::set_read_timeout(self, timeout)
    }

    fn release(self) -> Result<(), association::Error> {
        ClientAssociation::release(self).map(|_| ())
    }

    fn abort(self) -> Result<(), association::Error> {
        ClientAssociation::abort(self)
    }
}

impl<S> UpperLayer for ServerAssociation<S>
where
    S: CloseSocket + std::io::Read + std::io::Write,
{
    fn send_pdu(&mut self, pdu: &Pdu) -> Result<(), association::Error> {
        self.send(pdu)
    }

    fn receive_pdu(&mut self) -> Result<Pdu, association::Error> {
        self.receive()
    }

    fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        Association::presentation_contexts(self)
    }

    fn peer_max_pdu_length(&self) -> u32 {
        Association::peer_max_pdu_length(self)
    }

    fn peer_ae_title(&self) -> &str {
        Association::peer_ae_title(self)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), association::Error> {
        ServerAssociation::set_read_timeout(self, timeout)
    }

    fn release(self) -> Result<(), association::Error> {
        ServerAssociation::release(self).map(|_| ())
    }

    fn abort(self) -> Result<(), association::Error> {
        ServerAssociation::abort(self)
    }
}

/// One fully reassembled DIMSE message.
#[derive(Debug)]
pub struct Message {
    /// the presentation context the message arrived on
    pub presentation_context_id: u8,
    /// the command set
    pub command: CommandSet,
    /// the data set bytes, when one followed the command
    pub data: Option<Vec<u8>>,
}

/// The outcome of waiting for the next message.
#[derive(Debug)]
pub enum Incoming {
    /// A complete DIMSE message.
    Message(Message),
    /// The peer asked to release the association.
    ReleaseRequested,
    /// The peer aborted the association.
    Aborted(AbortRQSource),
}

/// The DIMSE engine over one established association.
#[derive(Debug)]
pub struct DimseProvider<A> {
    upper: A,
    /// the next message ID candidate
    next_message_id: u16,
    /// outstanding requests by (presentation context ID, message ID)
    pending: HashSet<(u8, u16)>,
    /// fragments not yet consumed
    pdv_queue: VecDeque<PDataValue>,
    assembler: MessageAssembler,
    /// command sets awaiting their data set, per context
    partial_commands: std::collections::HashMap<u8, CommandSet>,
    /// requests from the peer picked up while awaiting a response
    inbound_requests: VecDeque<Message>,
    /// responses to other outstanding requests picked up in passing
    unclaimed_responses: VecDeque<Message>,
    /// accepted presentation context IDs
    accepted_ids: Vec<u8>,
    /// bound on the wait for each response
    dimse_timeout: Option<Duration>,
    /// the read timeout to restore after a bounded wait
    network_timeout: Option<Duration>,
}

impl<A> DimseProvider<A>
where
    A: UpperLayer,
{
    /// Create the engine over an established association.
    pub fn new(upper: A, dimse_timeout: Option<Duration>, network_timeout: Option<Duration>) -> Self {
        let accepted_ids = upper
            .presentation_contexts()
            .iter()
            .filter(|pc| pc.is_accepted())
            .map(|pc| pc.id)
            .collect();
        DimseProvider {
            upper,
            next_message_id: 1,
            pending: HashSet::new(),
            pdv_queue: VecDeque::new(),
            assembler: MessageAssembler::new(),
            partial_commands: std::collections::HashMap::new(),
            inbound_requests: VecDeque::new(),
            unclaimed_responses: VecDeque::new(),
            accepted_ids,
            dimse_timeout,
            network_timeout,
        }
    }

    /// Access the underlying association.
    pub fn upper(&self) -> &A {
        &self.upper
    }

    /// Mutable access to the underlying association.
    pub fn upper_mut(&mut self) -> &mut A {
        &mut self.upper
    }

    /// Unwrap into the underlying association.
    pub fn into_inner(self) -> A {
        self.upper
    }

    /// The accepted presentation context
    /// for the given SOP class and required local role.
    pub fn find_context(&self, sop_class_uid: &str, scu: bool) -> Result<&PresentationContextNegotiated> {
        self.upper
            .presentation_contexts()
            .iter()
            .find(|pc| {
                pc.is_accepted()
                    && pc.abstract_syntax == sop_class_uid
                    && if scu { pc.scu_role } else { pc.scp_role }
            })
            .context(NoMatchingPresentationContextSnafu { sop_class_uid })
    }

    /// The accepted presentation context for the given SOP class,
    /// regardless of the negotiated roles.
    ///
    /// DIMSE-N messages may originate from either peer,
    /// so role flags do not gate them.
    pub fn find_context_any(&self, sop_class_uid: &str) -> Result<&PresentationContextNegotiated> {
        self.upper
            .presentation_contexts()
            .iter()
            .find(|pc| pc.is_accepted() && pc.abstract_syntax == sop_class_uid)
            .context(NoMatchingPresentationContextSnafu { sop_class_uid })
    }

    /// Put a peer-initiated request back for later dispatch.
    pub(crate) fn stash_request(&mut self, message: Message) {
        self.inbound_requests.push_back(message);
    }

    /// Allocate the next message ID,
    /// skipping IDs still in use by outstanding requests.
    ///
    /// IDs are monotonic per association and wrap at 65535.
    pub fn next_message_id(&mut self) -> u16 {
        loop {
            let candidate = self.next_message_id;
            self.next_message_id = if self.next_message_id == u16::MAX {
                1
            } else {
                self.next_message_id + 1
            };
            if !self.pending.iter().any(|(_, id)| *id == candidate) {
                return candidate;
            }
        }
    }

    /// Record an outstanding request awaiting correlation.
    pub fn register_pending(&mut self, presentation_context_id: u8, message_id: u16) {
        self.pending.insert((presentation_context_id, message_id));
    }

    /// Discharge an outstanding request after its terminal response.
    pub fn complete_request(&mut self, presentation_context_id: u8, message_id: u16) {
        self.pending.remove(&(presentation_context_id, message_id));
    }

    /// Whether any requests are still outstanding.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The largest PDV payload admitted by the peer's maximum PDU length.
    fn max_pdv_payload(&self) -> usize {
        let peer = self.upper.peer_max_pdu_length();
        if peer == 0 || peer == u32::MAX {
            usize::MAX
        } else {
            // PDV item length (4), context ID (1), control header (1)
            (peer as usize).saturating_sub(6).max(1)
        }
    }

    /// Send one message: the command set,
    /// then the data set when one is given,
    /// each fragmented to the peer's maximum PDU length.
    ///
    /// All command fragments precede all data fragments
    /// and every fragment carries the same presentation context ID.
    pub fn send_message(
        &mut self,
        presentation_context_id: u8,
        command_bytes: Vec<u8>,
        data_bytes: Option<Vec<u8>>,
    ) -> Result<()> {
        self.send_part(presentation_context_id, PDataValueType::Command, command_bytes)?;
        if let Some(data) = data_bytes {
            self.send_part(presentation_context_id, PDataValueType::Data, data)?;
        }
        Ok(())
    }

    fn send_part(
        &mut self,
        presentation_context_id: u8,
        value_type: PDataValueType,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let chunk_len = self.max_pdv_payload();
        if bytes.len() <= chunk_len {
            return self
                .upper
                .send_pdu(&Pdu::PData {
                    data: vec![PDataValue {
                        presentation_context_id,
                        value_type,
                        is_last: true,
                        data: bytes,
                    }],
                })
                .context(AssociationSnafu);
        }

        let mut chunks = bytes.chunks(chunk_len).peekable();
        while let Some(chunk) = chunks.next() {
            let is_last = chunks.peek().is_none();
            self.upper
                .send_pdu(&Pdu::PData {
                    data: vec![PDataValue {
                        presentation_context_id,
                        value_type,
                        is_last,
                        data: chunk.to_vec(),
                    }],
                })
                .context(AssociationSnafu)?;
        }
        Ok(())
    }

    /// Abort the association upon a protocol error.
    pub fn abort(&mut self, reason: AbortRQServiceProviderReason) {
        let _ = self.upper.send_pdu(&Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(reason),
        });
    }

    /// Wait for the next complete message or association signal.
    pub fn receive_message(&mut self) -> Result<Incoming> {
        loop {
            // consume fragments already at hand first
            while let Some(pdv) = self.pdv_queue.pop_front() {
                if let Err(e) = self.assembler.check_context(&pdv, &self.accepted_ids) {
                    self.abort(AbortRQServiceProviderReason::InvalidPduParameter);
                    return Err(e).context(AssemblySnafu);
                }
                let assembled = match self.assembler.feed(pdv) {
                    Ok(assembled) => assembled,
                    Err(e) => {
                        self.abort(AbortRQServiceProviderReason::InvalidPduParameter);
                        return Err(e).context(AssemblySnafu);
                    }
                };
                match assembled {
                    Some(Assembled::CommandComplete {
                        presentation_context_id,
                        bytes,
                    }) => {
                        let command = match CommandSet::from_bytes(&bytes) {
                            Ok(command) => command,
                            Err(e) => {
                                self.abort(AbortRQServiceProviderReason::InvalidPduParameter);
                                return Err(e);
                            }
                        };
                        if command.has_data_set() {
                            self.assembler.expect_data(presentation_context_id);
                            self.partial_commands
                                .insert(presentation_context_id, command);
                        } else {
                            return Ok(Incoming::Message(Message {
                                presentation_context_id,
                                command,
                                data: None,
                            }));
                        }
                    }
                    Some(Assembled::DataComplete {
                        presentation_context_id,
                        bytes,
                    }) => {
                        match self.partial_commands.remove(&presentation_context_id) {
                            Some(command) => {
                                return Ok(Incoming::Message(Message {
                                    presentation_context_id,
                                    command,
                                    data: Some(bytes),
                                }));
                            }
                            None => {
                                // the assembler only completes data
                                // after a command announced it
                                warn!(
                                    "data set completed without a command on context {}",
                                    presentation_context_id
                                );
                                self.abort(AbortRQServiceProviderReason::InvalidPduParameter);
                                return DataWithoutCommandSnafu {
                                    presentation_context_id,
                                }
                                .fail()
                                .context(AssemblySnafu);
                            }
                        }
                    }
                    None => {}
                }
            }

            match self.upper.receive_pdu().context(AssociationSnafu)? {
                Pdu::PData { data } => self.pdv_queue.extend(data),
                Pdu::ReleaseRQ => return Ok(Incoming::ReleaseRequested),
                Pdu::AbortRQ { source } => return Ok(Incoming::Aborted(source)),
                other => {
                    // anything else is screened out by the state machine
                    warn!("disregarding {}", other.short_description());
                }
            }
        }
    }

    /// A request the peer initiated
    /// while this node was awaiting a response, if any.
    pub fn take_inbound_request(&mut self) -> Option<Message> {
        self.inbound_requests.pop_front()
    }

    /// Wait for the response correlating to the given request.
    ///
    /// Responses to other outstanding requests are put aside;
    /// requests initiated by the peer in the meantime
    /// (such as N-EVENT-REPORT or C-STORE sub-operations)
    /// are queued for [`take_inbound_request`](Self::take_inbound_request).
    /// A response correlating to nothing is a protocol error
    /// and aborts the association,
    /// as does expiry of the DIMSE timer.
    pub fn await_response(
        &mut self,
        presentation_context_id: u8,
        message_id: u16,
    ) -> Result<Message> {
        // a previous wait may have put the response aside already
        if let Some(at) = self.unclaimed_responses.iter().position(|msg| {
            msg.presentation_context_id == presentation_context_id
                && msg
                    .command
                    .message_id_being_responded_to()
                    .map(|id| id == message_id)
                    .unwrap_or(false)
        }) {
            return Ok(self.unclaimed_responses.remove(at).expect("index is valid"));
        }

        let deadline = self.dimse_timeout.map(|timeout| Instant::now() + timeout);

        loop {
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    self.abort(AbortRQServiceProviderReason::ReasonNotSpecified);
                    return DimseTimeoutSnafu.fail();
                }
                self.upper
                    .set_read_timeout(Some(remaining.max(Duration::from_millis(1))))
                    .context(AssociationSnafu)?;
            }

            let incoming = match self.receive_message() {
                Ok(incoming) => incoming,
                Err(e) => {
                    if deadline.is_some() && timed_out(&e) {
                        self.abort(AbortRQServiceProviderReason::ReasonNotSpecified);
                        self.restore_read_timeout();
                        return DimseTimeoutSnafu.fail();
                    }
                    self.restore_read_timeout();
                    return Err(e);
                }
            };
            match incoming {
                Incoming::Message(msg) => {
                    let field = match msg.command.command_field() {
                        Ok(field) => field,
                        Err(e) => {
                            self.abort(AbortRQServiceProviderReason::InvalidPduParameter);
                            return Err(e);
                        }
                    };
                    if field.is_response() {
                        let responded_to = msg.command.message_id_being_responded_to()?;
                        if msg.presentation_context_id == presentation_context_id
                            && responded_to == message_id
                        {
                            self.restore_read_timeout();
                            return Ok(msg);
                        }
                        if self
                            .pending
                            .contains(&(msg.presentation_context_id, responded_to))
                        {
                            self.unclaimed_responses.push_back(msg);
                        } else {
                            // correlation to nothing: protocol error
                            self.abort(AbortRQServiceProviderReason::InvalidPduParameter);
                            self.restore_read_timeout();
                            return UnexpectedResponseSnafu {
                                presentation_context_id: msg.presentation_context_id,
                                message_id: responded_to,
                            }
                            .fail();
                        }
                    } else {
                        debug!(
                            "queueing peer request {:?} while awaiting response",
                            field
                        );
                        self.inbound_requests.push_back(msg);
                    }
                }
                Incoming::ReleaseRequested => {
                    // tolerate the ill-timed release: answer and surface
                    let _ = self.upper.send_pdu(&Pdu::ReleaseRP);
                    self.restore_read_timeout();
                    return ReleasedByPeerSnafu.fail();
                }
                Incoming::Aborted(source) => {
                    self.restore_read_timeout();
                    return AssociationAbortedSnafu {
                        source_info: source,
                    }
                    .fail();
                }
            }
        }
    }

    /// Wait for the next incoming item,
    /// bounded by the DIMSE timeout when one is configured.
    /// Expiry aborts the association.
    pub fn receive_bounded(&mut self) -> Result<Incoming> {
        if let Some(timeout) = self.dimse_timeout {
            self.upper
                .set_read_timeout(Some(timeout))
                .context(AssociationSnafu)?;
            let out = match self.receive_message() {
                Err(e) if timed_out(&e) => {
                    self.abort(AbortRQServiceProviderReason::ReasonNotSpecified);
                    DimseTimeoutSnafu.fail()
                }
                other => other,
            };
            self.restore_read_timeout();
            out
        } else {
            self.receive_message()
        }
    }

    /// Wait up to `wait` for the next incoming item,
    /// returning `None` when nothing arrives in time.
    ///
    /// Used by providers to look for C-CANCEL requests
    /// between pending responses.
    pub fn poll_incoming(&mut self, wait: Duration) -> Result<Option<Incoming>> {
        self.upper
            .set_read_timeout(Some(wait.max(Duration::from_millis(1))))
            .context(AssociationSnafu)?;
        let out = match self.receive_message() {
            Ok(incoming) => Ok(Some(incoming)),
            Err(e) if timed_out(&e) => Ok(None),
            Err(e) => Err(e),
        };
        self.restore_read_timeout();
        out
    }

    fn restore_read_timeout(&mut self) {
        let _ = self.upper.set_read_timeout(self.network_timeout);
    }
}

fn timed_out(e: &crate::Error) -> bool {
    matches!(e, crate::Error::Association { source, .. } if source.is_timeout())
}

#[cfg(test)]
mod tests {
    use super::*;
    use netdicom_ul::pdu::PresentationContextResultReason;

    use crate::commands::Status;
    use crate::messages::{CEchoRsp, CStoreRq, Command};

    /// An upper layer standing on queues instead of sockets.
    struct MockUpper {
        contexts: Vec<PresentationContextNegotiated>,
        sent: Vec<Pdu>,
        incoming: VecDeque<Pdu>,
        peer_max_pdu_length: u32,
    }

    impl MockUpper {
        fn new(peer_max_pdu_length: u32) -> Self {
            MockUpper {
                contexts: vec![PresentationContextNegotiated {
                    id: 1,
                    reason: PresentationContextResultReason::Acceptance,
                    abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                    transfer_syntax: "1.2.840.10008.1.2".to_string(),
                    scu_role: true,
                    scp_role: false,
                }],
                sent: Vec::new(),
                incoming: VecDeque::new(),
                peer_max_pdu_length,
            }
        }
    }

    impl UpperLayer for MockUpper {
        fn send_pdu(&mut self, pdu: &Pdu) -> Result<(), association::Error> {
            self.sent.push(pdu.clone());
            Ok(())
        }

        fn receive_pdu(&mut self) -> Result<Pdu, association::Error> {
            Ok(self.incoming.pop_front().expect("mock ran out of PDUs"))
        }

        fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
            &self.contexts
        }

        fn peer_max_pdu_length(&self) -> u32 {
            self.peer_max_pdu_length
        }

        fn peer_ae_title(&self) -> &str {
            "MOCK-SCP"
        }

        fn set_read_timeout(
            &mut self,
            _timeout: Option<Duration>,
        ) -> Result<(), association::Error> {
            Ok(())
        }

        fn release(self) -> Result<(), association::Error> {
            Ok(())
        }

        fn abort(self) -> Result<(), association::Error> {
            Ok(())
        }
    }

    #[test]
    fn message_ids_are_unique_and_wrap() {
        let mut provider = DimseProvider::new(MockUpper::new(16382), None, None);
        let first = provider.next_message_id();
        assert_eq!(first, 1);
        provider.register_pending(1, 2);

        // 2 is in flight: it must be skipped
        assert_eq!(provider.next_message_id(), 3);

        // force a wrap and check it goes back to the beginning
        provider.next_message_id = u16::MAX;
        assert_eq!(provider.next_message_id(), u16::MAX);
        assert_eq!(provider.next_message_id(), 1);
        // still skipping in-flight IDs after the wrap
        assert_eq!(provider.next_message_id(), 3);
    }

    #[test]
    fn fragments_are_contiguous_and_bounded() {
        let max_pdu = 4096_u32;
        let mut provider = DimseProvider::new(MockUpper::new(max_pdu), None, None);

        let command = CStoreRq::builder()
            .message_id(1)
            .affected_sop_class_uid("1.2.840.10008.5.1.4.1.1.2")
            .affected_sop_instance_uid("1.2.3.4.5")
            .build()
            .encode()
            .unwrap();
        let data = vec![0xAB_u8; (max_pdu as usize - 6) * 2 + 100];

        provider.send_message(1, command, Some(data)).unwrap();

        let sent = &provider.upper().sent;
        let mut pdvs = Vec::new();
        for pdu in sent {
            match pdu {
                Pdu::PData { data } => pdvs.extend(data.iter()),
                other => panic!("unexpected PDU {:?}", other),
            }
        }

        // command fragments strictly precede data fragments
        let first_data = pdvs
            .iter()
            .position(|pdv| pdv.value_type == PDataValueType::Data)
            .expect("data fragments expected");
        assert!(pdvs[..first_data]
            .iter()
            .all(|pdv| pdv.value_type == PDataValueType::Command));
        assert!(pdvs[first_data..]
            .iter()
            .all(|pdv| pdv.value_type == PDataValueType::Data));

        // all on the same context, sized within the peer's limit,
        // and only the final fragment of each part is marked last
        for pdv in &pdvs {
            assert_eq!(pdv.presentation_context_id, 1);
            assert!(pdv.data.len() + 6 <= max_pdu as usize);
        }
        let command_pdvs: Vec<_> = pdvs[..first_data].to_vec();
        let data_pdvs: Vec<_> = pdvs[first_data..].to_vec();
        assert!(command_pdvs.last().unwrap().is_last);
        assert!(command_pdvs[..command_pdvs.len() - 1]
            .iter()
            .all(|pdv| !pdv.is_last));
        assert_eq!(data_pdvs.len(), 3);
        assert!(data_pdvs.last().unwrap().is_last);
        assert!(data_pdvs[..data_pdvs.len() - 1].iter().all(|pdv| !pdv.is_last));
    }

    #[test]
    fn response_is_correlated_by_message_id() {
        let mut provider = DimseProvider::new(MockUpper::new(16382), None, None);
        provider.register_pending(1, 5);

        let rsp = CEchoRsp::builder()
            .message_id_being_responded_to(5)
            .status(0x0000)
            .build()
            .encode()
            .unwrap();
        provider.upper_mut().incoming.push_back(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: rsp,
            }],
        });

        let msg = provider.await_response(1, 5).unwrap();
        assert_eq!(msg.command.status().unwrap(), Status::SUCCESS);
        assert!(msg.data.is_none());
    }

    #[test]
    fn uncorrelated_response_aborts() {
        let mut provider = DimseProvider::new(MockUpper::new(16382), None, None);
        provider.register_pending(1, 5);

        // a response to a message ID that was never issued
        let rsp = CEchoRsp::builder()
            .message_id_being_responded_to(99)
            .status(0x0000)
            .build()
            .encode()
            .unwrap();
        provider.upper_mut().incoming.push_back(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: rsp,
            }],
        });

        let err = provider.await_response(1, 5).unwrap_err();
        assert!(matches!(err, crate::Error::UnexpectedResponse { .. }));
        // the protocol error went out as an abort
        assert!(provider
            .upper()
            .sent
            .iter()
            .any(|pdu| matches!(pdu, Pdu::AbortRQ { .. })));
    }

    #[test]
    fn fragment_on_refused_context_aborts() {
        let mut provider = DimseProvider::new(MockUpper::new(16382), None, None);
        provider.upper_mut().incoming.push_back(Pdu::PData {
            data: vec![PDataValue {
                // context 31 was never negotiated
                presentation_context_id: 31,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0; 8],
            }],
        });

        let err = provider.receive_message().unwrap_err();
        assert!(matches!(err, crate::Error::Assembly { .. }));
        assert!(provider
            .upper()
            .sent
            .iter()
            .any(|pdu| matches!(pdu, Pdu::AbortRQ { .. })));
    }
}
