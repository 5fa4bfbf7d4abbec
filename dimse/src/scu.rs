//! The service class user call interface.
//!
//! [`DimseScu`] wraps an established association
//! and exposes one operation per DIMSE service,
//! taking care of presentation context selection,
//! message ID allocation, data set encoding,
//! and response correlation.
use std::time::Duration;

use dicom_core::Tag;
use dicom_dictionary_std::{tags, uids};
use dicom_object::InMemDicomObject;
use netdicom_ul::pdu::AbortRQServiceProviderReason;
use snafu::{OptionExt, ResultExt};
use tracing::{debug, warn};

use crate::commands::{CommandField, Status};
use crate::error::*;
use crate::events::StoreRequest;
use crate::messages::{
    decode_data_set, encode_data_set, CCancelRq, CEchoRq, CFindRq, CGetRq, CMoveRq, CStoreRq,
    CStoreRsp, Command, NActionRq, NCreateRq, NDeleteRq, NEventReportRq, NGetRq, NSetRq,
};
use crate::provider::{DimseProvider, Incoming, Message, UpperLayer};
use crate::Result;

/// The outcome of a retrieve operation (C-GET).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrieveOutcome {
    /// the terminal status of the operation
    pub status: Status,
    /// sub-operations stored successfully
    pub completed: u16,
    /// sub-operations which failed
    pub failed: u16,
    /// sub-operations which completed with warnings
    pub warnings: u16,
}

/// A service class user over one established association.
#[derive(Debug)]
pub struct DimseScu<A> {
    provider: DimseProvider<A>,
}

impl<A> DimseScu<A>
where
    A: UpperLayer,
{
    /// Wrap an established association.
    ///
    /// `dimse_timeout` bounds the wait for each response;
    /// `network_timeout` is the socket read timeout restored
    /// between bounded waits.
    pub fn new(upper: A, dimse_timeout: Option<Duration>, network_timeout: Option<Duration>) -> Self {
        DimseScu {
            provider: DimseProvider::new(upper, dimse_timeout, network_timeout),
        }
    }

    /// The peer's application entity title.
    pub fn peer_ae_title(&self) -> &str {
        self.provider.upper().peer_ae_title()
    }

    /// Access the underlying message engine.
    pub fn provider_mut(&mut self) -> &mut DimseProvider<A> {
        &mut self.provider
    }

    /// A request the peer initiated while a response was awaited
    /// (such as an N-EVENT-REPORT), if any.
    pub fn take_inbound_request(&mut self) -> Option<Message> {
        self.provider.take_inbound_request()
    }

    /// Gracefully release the association.
    pub fn release(self) -> Result<()> {
        self.provider
            .into_inner()
            .release()
            .context(AssociationSnafu)
    }

    /// Abort the association and close the connection.
    pub fn abort(self) -> Result<()> {
        self.provider.into_inner().abort().context(AssociationSnafu)
    }

    /// Encode and send a request, registering it for correlation.
    fn send_request(
        &mut self,
        presentation_context_id: u8,
        message_id: u16,
        command: &impl Command,
        data: Option<Vec<u8>>,
    ) -> Result<()> {
        let command_bytes = command.encode()?;
        self.provider
            .send_message(presentation_context_id, command_bytes, data)?;
        self.provider
            .register_pending(presentation_context_id, message_id);
        Ok(())
    }

    /// Await a single (non-streamed) response for the given request
    /// and discharge it.
    fn single_response(&mut self, presentation_context_id: u8, message_id: u16) -> Result<Message> {
        let out = self.provider.await_response(presentation_context_id, message_id);
        self.provider
            .complete_request(presentation_context_id, message_id);
        out
    }

    /// Verification: send a C-ECHO request and return its status.
    pub fn c_echo(&mut self) -> Result<Status> {
        let pc_id = self.provider.find_context(uids::VERIFICATION, true)?.id;
        let message_id = self.provider.next_message_id();
        let command = CEchoRq::builder().message_id(message_id).build();

        self.send_request(pc_id, message_id, &command, None)?;
        debug!("C-ECHO sent (message id {}), awaiting reply", message_id);

        let rsp = self.single_response(pc_id, message_id)?;
        rsp.command.status()
    }

    /// Storage: send the data set through a C-STORE request
    /// and return the peer's status.
    ///
    /// The SOP class and instance are taken from the data set;
    /// the data set is encoded in the transfer syntax
    /// negotiated for its SOP class.
    pub fn c_store(&mut self, dataset: &InMemDicomObject) -> Result<Status> {
        let sop_class_uid = required_str(dataset, tags::SOP_CLASS_UID, "SOP Class UID")?;
        let sop_instance_uid = required_str(dataset, tags::SOP_INSTANCE_UID, "SOP Instance UID")?;

        let pc = self.provider.find_context(&sop_class_uid, true)?;
        let (pc_id, transfer_syntax) = (pc.id, pc.transfer_syntax.clone());
        let data = encode_data_set(dataset, &transfer_syntax)?;

        let message_id = self.provider.next_message_id();
        let command = CStoreRq::builder()
            .message_id(message_id)
            .affected_sop_class_uid(&sop_class_uid)
            .affected_sop_instance_uid(&sop_instance_uid)
            .build();

        self.send_request(pc_id, message_id, &command, Some(data))?;
        let rsp = self.single_response(pc_id, message_id)?;
        rsp.command.status()
    }

    /// Query: send a C-FIND request and iterate over its responses.
    ///
    /// Each item is a `(status, identifier)` pair;
    /// pending statuses carry a match identifier
    /// and the final item carries the terminal status.
    pub fn c_find(
        &mut self,
        sop_class_uid: &str,
        identifier: &InMemDicomObject,
    ) -> Result<ResponseStream<'_, A>> {
        let pc = self.provider.find_context(sop_class_uid, true)?;
        let (pc_id, transfer_syntax) = (pc.id, pc.transfer_syntax.clone());
        let data = encode_data_set(identifier, &transfer_syntax)?;

        let message_id = self.provider.next_message_id();
        let command = CFindRq::builder()
            .message_id(message_id)
            .affected_sop_class_uid(sop_class_uid)
            .build();

        self.send_request(pc_id, message_id, &command, Some(data))?;
        Ok(ResponseStream {
            scu: self,
            presentation_context_id: pc_id,
            transfer_syntax,
            message_id,
            finished: false,
        })
    }

    /// Retrieve towards a third party:
    /// send a C-MOVE request and iterate over the progress responses.
    pub fn c_move(
        &mut self,
        sop_class_uid: &str,
        move_destination: &str,
        identifier: &InMemDicomObject,
    ) -> Result<ResponseStream<'_, A>> {
        let pc = self.provider.find_context(sop_class_uid, true)?;
        let (pc_id, transfer_syntax) = (pc.id, pc.transfer_syntax.clone());
        let data = encode_data_set(identifier, &transfer_syntax)?;

        let message_id = self.provider.next_message_id();
        let command = CMoveRq::builder()
            .message_id(message_id)
            .affected_sop_class_uid(sop_class_uid)
            .move_destination(move_destination)
            .build();

        self.send_request(pc_id, message_id, &command, Some(data))?;
        Ok(ResponseStream {
            scu: self,
            presentation_context_id: pc_id,
            transfer_syntax,
            message_id,
            finished: false,
        })
    }

    /// Retrieve to this node: send a C-GET request
    /// and dispatch every inbound C-STORE sub-operation
    /// to the given handler on this same association.
    ///
    /// The association must have negotiated the SCP role
    /// for the storage classes being retrieved.
    pub fn c_get(
        &mut self,
        sop_class_uid: &str,
        identifier: &InMemDicomObject,
        mut on_store: impl FnMut(StoreRequest<'_>) -> Status,
    ) -> Result<RetrieveOutcome> {
        let pc = self.provider.find_context(sop_class_uid, true)?;
        let (pc_id, transfer_syntax) = (pc.id, pc.transfer_syntax.clone());
        let data = encode_data_set(identifier, &transfer_syntax)?;

        let message_id = self.provider.next_message_id();
        let command = CGetRq::builder()
            .message_id(message_id)
            .affected_sop_class_uid(sop_class_uid)
            .build();
        self.send_request(pc_id, message_id, &command, Some(data))?;

        let mut completed = 0_u16;
        let mut failed = 0_u16;
        let mut warnings = 0_u16;

        // sub-operations are interleaved with the C-GET responses,
        // so this wait cannot go through response correlation alone;
        // the DIMSE timer bounds each individual wait instead
        let outcome = loop {
            match self.provider.receive_bounded()? {
                Incoming::Message(msg) => {
                    let field = msg.command.command_field()?;
                    if field == CommandField::CStoreRq {
                        let status = self.handle_inbound_store(&msg, &mut on_store)?;
                        match status.class() {
                            crate::commands::StatusClass::Success => completed += 1,
                            crate::commands::StatusClass::Warning => warnings += 1,
                            _ => failed += 1,
                        }
                        continue;
                    }
                    if field == CommandField::CGetRsp
                        && msg.presentation_context_id == pc_id
                        && msg.command.message_id_being_responded_to()? == message_id
                    {
                        let status = msg.command.status()?;
                        if status.is_pending() {
                            continue;
                        }
                        // final counts as reported by the peer, when present
                        completed = msg
                            .command
                            .number_of_completed_suboperations()
                            .unwrap_or(completed);
                        failed = msg
                            .command
                            .number_of_failed_suboperations()
                            .unwrap_or(failed);
                        warnings = msg
                            .command
                            .number_of_warning_suboperations()
                            .unwrap_or(warnings);
                        break RetrieveOutcome {
                            status,
                            completed,
                            failed,
                            warnings,
                        };
                    }
                    warn!(
                        "disregarding {:?} while awaiting C-GET responses",
                        field
                    );
                    self.provider.stash_request(msg);
                }
                Incoming::ReleaseRequested => {
                    return ReleasedByPeerSnafu.fail();
                }
                Incoming::Aborted(source) => {
                    return AssociationAbortedSnafu {
                        source_info: source,
                    }
                    .fail();
                }
            }
        };
        self.provider.complete_request(pc_id, message_id);
        Ok(outcome)
    }

    /// Answer one inbound C-STORE sub-operation.
    fn handle_inbound_store(
        &mut self,
        msg: &Message,
        on_store: &mut impl FnMut(StoreRequest<'_>) -> Status,
    ) -> Result<Status> {
        let sop_class_uid = msg.command.affected_sop_class_uid().unwrap_or_default();
        let sop_instance_uid = msg.command.affected_sop_instance_uid().unwrap_or_default();
        let message_id = msg.command.message_id()?;

        let transfer_syntax = self
            .provider
            .upper()
            .presentation_contexts()
            .iter()
            .find(|pc| pc.id == msg.presentation_context_id)
            .map(|pc| pc.transfer_syntax.clone())
            .unwrap_or_default();

        let status = match &msg.data {
            Some(data) => on_store(StoreRequest {
                presentation_context_id: msg.presentation_context_id,
                sop_class_uid: &sop_class_uid,
                sop_instance_uid: &sop_instance_uid,
                transfer_syntax: &transfer_syntax,
                data,
                command: &msg.command,
            }),
            None => {
                warn!("C-STORE sub-operation without a data set");
                Status::PROCESSING_FAILURE
            }
        };

        let rsp = CStoreRsp::builder()
            .message_id_being_responded_to(message_id)
            .affected_sop_class_uid(&sop_class_uid)
            .affected_sop_instance_uid(&sop_instance_uid)
            .status(status.0)
            .build();
        let rsp_bytes = rsp.encode()?;
        self.provider
            .send_message(msg.presentation_context_id, rsp_bytes, None)?;
        Ok(status)
    }

    /// Ask the peer to abandon a pending operation
    /// previously issued on the given presentation context.
    pub fn c_cancel(&mut self, presentation_context_id: u8, message_id: u16) -> Result<()> {
        let command = CCancelRq::builder()
            .message_id_being_responded_to(message_id)
            .build();
        let bytes = command.encode()?;
        self.provider
            .send_message(presentation_context_id, bytes, None)
    }

    /// Common path of the DIMSE-N requests:
    /// send and await the single response.
    fn n_request(
        &mut self,
        pc_id: u8,
        transfer_syntax: &str,
        message_id: u16,
        command: &impl Command,
        data: Option<&InMemDicomObject>,
    ) -> Result<(Status, Option<InMemDicomObject>)> {
        let data = data
            .map(|obj| encode_data_set(obj, transfer_syntax))
            .transpose()?;
        self.send_request(pc_id, message_id, command, data)?;
        let rsp = self.single_response(pc_id, message_id)?;
        let status = rsp.command.status()?;
        let dataset = rsp
            .data
            .as_deref()
            .map(|bytes| decode_data_set(bytes, transfer_syntax))
            .transpose()?;
        Ok((status, dataset))
    }

    /// Report an event to the peer through N-EVENT-REPORT.
    pub fn n_event_report(
        &mut self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        event_type_id: u16,
        event_information: Option<&InMemDicomObject>,
    ) -> Result<(Status, Option<InMemDicomObject>)> {
        let pc = self.provider.find_context_any(sop_class_uid)?;
        let (pc_id, transfer_syntax) = (pc.id, pc.transfer_syntax.clone());
        let message_id = self.provider.next_message_id();
        let command = NEventReportRq::builder()
            .message_id(message_id)
            .affected_sop_class_uid(sop_class_uid)
            .affected_sop_instance_uid(sop_instance_uid)
            .event_type_id(event_type_id)
            .event_information_follows(event_information.is_some())
            .build();
        self.n_request(pc_id, &transfer_syntax, message_id, &command, event_information)
    }

    /// Retrieve attribute values through N-GET.
    pub fn n_get(
        &mut self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        attribute_identifier_list: Vec<Tag>,
    ) -> Result<(Status, Option<InMemDicomObject>)> {
        let pc = self.provider.find_context_any(sop_class_uid)?;
        let (pc_id, transfer_syntax) = (pc.id, pc.transfer_syntax.clone());
        let message_id = self.provider.next_message_id();
        let command = NGetRq::builder()
            .message_id(message_id)
            .requested_sop_class_uid(sop_class_uid)
            .requested_sop_instance_uid(sop_instance_uid)
            .attribute_identifier_list(attribute_identifier_list)
            .build();
        self.n_request(pc_id, &transfer_syntax, message_id, &command, None)
    }

    /// Modify attribute values through N-SET.
    pub fn n_set(
        &mut self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        modification_list: &InMemDicomObject,
    ) -> Result<(Status, Option<InMemDicomObject>)> {
        let pc = self.provider.find_context_any(sop_class_uid)?;
        let (pc_id, transfer_syntax) = (pc.id, pc.transfer_syntax.clone());
        let message_id = self.provider.next_message_id();
        let command = NSetRq::builder()
            .message_id(message_id)
            .requested_sop_class_uid(sop_class_uid)
            .requested_sop_instance_uid(sop_instance_uid)
            .build();
        self.n_request(
            pc_id,
            &transfer_syntax,
            message_id,
            &command,
            Some(modification_list),
        )
    }

    /// Invoke an action through N-ACTION.
    pub fn n_action(
        &mut self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        action_type_id: u16,
        action_information: Option<&InMemDicomObject>,
    ) -> Result<(Status, Option<InMemDicomObject>)> {
        let pc = self.provider.find_context_any(sop_class_uid)?;
        let (pc_id, transfer_syntax) = (pc.id, pc.transfer_syntax.clone());
        let message_id = self.provider.next_message_id();
        let command = NActionRq::builder()
            .message_id(message_id)
            .requested_sop_class_uid(sop_class_uid)
            .requested_sop_instance_uid(sop_instance_uid)
            .action_type_id(action_type_id)
            .action_information_follows(action_information.is_some())
            .build();
        self.n_request(
            pc_id,
            &transfer_syntax,
            message_id,
            &command,
            action_information,
        )
    }

    /// Create a managed SOP instance through N-CREATE.
    pub fn n_create(
        &mut self,
        sop_class_uid: &str,
        sop_instance_uid: Option<&str>,
        attributes: Option<&InMemDicomObject>,
    ) -> Result<(Status, Option<InMemDicomObject>)> {
        let pc = self.provider.find_context_any(sop_class_uid)?;
        let (pc_id, transfer_syntax) = (pc.id, pc.transfer_syntax.clone());
        let message_id = self.provider.next_message_id();
        let command = NCreateRq::builder()
            .message_id(message_id)
            .affected_sop_class_uid(sop_class_uid)
            .maybe_affected_sop_instance_uid(sop_instance_uid)
            .attributes_follow(attributes.is_some())
            .build();
        self.n_request(pc_id, &transfer_syntax, message_id, &command, attributes)
    }

    /// Delete a managed SOP instance through N-DELETE.
    pub fn n_delete(&mut self, sop_class_uid: &str, sop_instance_uid: &str) -> Result<Status> {
        let pc = self.provider.find_context_any(sop_class_uid)?;
        let (pc_id, transfer_syntax) = (pc.id, pc.transfer_syntax.clone());
        let message_id = self.provider.next_message_id();
        let command = NDeleteRq::builder()
            .message_id(message_id)
            .requested_sop_class_uid(sop_class_uid)
            .requested_sop_instance_uid(sop_instance_uid)
            .build();
        let (status, _) = self.n_request(pc_id, &transfer_syntax, message_id, &command, None)?;
        Ok(status)
    }
}

/// The stream of responses to a C-FIND or C-MOVE request.
///
/// Ends after yielding the first terminal status.
/// Dropping the stream early leaves the request outstanding;
/// use [`DimseScu::c_cancel`] to ask the peer to stop.
#[must_use]
pub struct ResponseStream<'a, A>
where
    A: UpperLayer,
{
    scu: &'a mut DimseScu<A>,
    presentation_context_id: u8,
    transfer_syntax: String,
    message_id: u16,
    finished: bool,
}

impl<A> ResponseStream<'_, A>
where
    A: UpperLayer,
{
    /// The presentation context the request was issued on.
    pub fn presentation_context_id(&self) -> u8 {
        self.presentation_context_id
    }

    /// The message ID of the request,
    /// as needed for a C-CANCEL.
    pub fn message_id(&self) -> u16 {
        self.message_id
    }
}

impl<A> Iterator for ResponseStream<'_, A>
where
    A: UpperLayer,
{
    type Item = Result<(Status, Option<InMemDicomObject>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let msg = match self
            .scu
            .provider
            .await_response(self.presentation_context_id, self.message_id)
        {
            Ok(msg) => msg,
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            }
        };
        let status = match msg.command.status() {
            Ok(status) => status,
            Err(e) => {
                self.finished = true;
                self.scu
                    .provider
                    .abort(AbortRQServiceProviderReason::InvalidPduParameter);
                return Some(Err(e));
            }
        };
        let identifier = match msg
            .data
            .as_deref()
            .map(|bytes| decode_data_set(bytes, &self.transfer_syntax))
            .transpose()
        {
            Ok(identifier) => identifier,
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            }
        };
        if status.is_terminal() {
            self.finished = true;
            self.scu
                .provider
                .complete_request(self.presentation_context_id, self.message_id);
        }
        Some(Ok((status, identifier)))
    }
}

fn required_str(
    dataset: &InMemDicomObject,
    tag: Tag,
    name: &'static str,
) -> Result<String> {
    let value = dataset
        .element(tag)
        .ok()
        .context(MissingAttributeSnafu { name })?
        .to_str()
        .context(ConvertCommandElementSnafu { name })?;
    Ok(value
        .trim_end_matches(|c: char| c == '\0' || c == ' ')
        .to_string())
}
