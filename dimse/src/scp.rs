//! The service class provider dispatch loop.
//!
//! [`serve`] runs one established association to completion:
//! it reassembles incoming requests,
//! routes each to the handler bound for its service and SOP class,
//! encodes handler yields as responses
//! (streaming pending responses for the query/retrieve services),
//! honors C-CANCEL, and answers the release handshake.
use std::time::Duration;

use dicom_object::InMemDicomObject;
use dicom_dictionary_std::tags;
use netdicom_ul::pdu::{AbortRQServiceProviderReason, AbortRQSource, Pdu};
use snafu::{OptionExt, ResultExt};
use tracing::{debug, info, warn};

use crate::commands::{CommandField, Status, StatusClass};
use crate::error::*;
use crate::events::{Disposition, QueryRequest, ServiceEvent, ServiceHandlers, StoreRequest};
use crate::messages::{
    decode_data_set, encode_data_set, CEchoRsp, CFindRsp, CGetRsp, CMoveRsp, CStoreRq, CStoreRsp,
    Command, NActionRsp, NCreateRsp, NDeleteRsp, NEventReportRsp, NGetRsp, NSetRsp,
};
use crate::provider::{DimseProvider, Incoming, Message, UpperLayer};
use crate::Result;

/// How long to look for a C-CANCEL between pending responses.
const CANCEL_POLL: Duration = Duration::from_millis(1);

enum Flow {
    Continue,
    Stop,
}

/// Run the association as a service class provider
/// until it is released, aborted, or fails.
pub fn serve<A>(
    upper: A,
    handlers: &mut ServiceHandlers,
    dimse_timeout: Option<Duration>,
    network_timeout: Option<Duration>,
) -> Result<()>
where
    A: UpperLayer,
{
    let peer_ae_title = upper.peer_ae_title().to_string();
    let mut provider = DimseProvider::new(upper, dimse_timeout, network_timeout);
    handlers.emit(&ServiceEvent::Established {
        peer_ae_title: peer_ae_title.clone(),
    });

    loop {
        // requests put aside during an earlier exchange go first
        while let Some(msg) = provider.take_inbound_request() {
            if let Flow::Stop = dispatch(&mut provider, handlers, msg)? {
                return Ok(());
            }
        }

        let incoming = match provider.receive_message() {
            Ok(incoming) => incoming,
            Err(e) if connection_closed(&e) => {
                debug!("connection closed by {}", peer_ae_title);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match incoming {
            Incoming::Message(msg) => {
                if let Flow::Stop = dispatch(&mut provider, handlers, msg)? {
                    return Ok(());
                }
            }
            Incoming::ReleaseRequested => {
                let _ = provider.upper_mut().send_pdu(&Pdu::ReleaseRP);
                handlers.emit(&ServiceEvent::Released);
                info!("association with {} released", peer_ae_title);
                return Ok(());
            }
            Incoming::Aborted(source) => {
                handlers.emit(&ServiceEvent::Aborted { source });
                warn!("association with {} aborted: {:?}", peer_ae_title, source);
                return Ok(());
            }
        }
    }
}

fn connection_closed(e: &crate::Error) -> bool {
    matches!(
        e,
        crate::Error::Association {
            source: netdicom_ul::association::Error::Transport {
                source: netdicom_ul::transport::Error::ConnectionClosed,
                ..
            },
            ..
        }
    )
}

/// Abort on behalf of the service user (a handler asked for it).
fn abort_by_user<A: UpperLayer>(provider: &mut DimseProvider<A>) {
    let _ = provider.upper_mut().send_pdu(&Pdu::AbortRQ {
        source: AbortRQSource::ServiceUser,
    });
}

/// Send a response message and note the event.
fn respond<A: UpperLayer>(
    provider: &mut DimseProvider<A>,
    handlers: &mut ServiceHandlers,
    presentation_context_id: u8,
    command: &impl Command,
    data: Option<Vec<u8>>,
) -> Result<()> {
    let bytes = command.encode()?;
    provider.send_message(presentation_context_id, bytes, data)?;
    handlers.emit(&ServiceEvent::MessageSent {
        presentation_context_id,
        field: command.command_field(),
    });
    Ok(())
}

/// The transfer syntax negotiated for the given context.
fn transfer_syntax_of<A: UpperLayer>(provider: &DimseProvider<A>, pc_id: u8) -> String {
    provider
        .upper()
        .presentation_contexts()
        .iter()
        .find(|pc| pc.id == pc_id)
        .map(|pc| pc.transfer_syntax.clone())
        .unwrap_or_default()
}

fn dispatch<A: UpperLayer>(
    provider: &mut DimseProvider<A>,
    handlers: &mut ServiceHandlers,
    msg: Message,
) -> Result<Flow> {
    let field = match msg.command.command_field() {
        Ok(field) => field,
        Err(e) => {
            provider.abort(AbortRQServiceProviderReason::InvalidPduParameter);
            return Err(e);
        }
    };
    handlers.emit(&ServiceEvent::MessageReceived {
        presentation_context_id: msg.presentation_context_id,
        field,
    });

    match field {
        CommandField::CEchoRq => dispatch_echo(provider, handlers, msg),
        CommandField::CStoreRq => dispatch_store(provider, handlers, msg),
        CommandField::CFindRq | CommandField::CMoveRq => {
            dispatch_query(provider, handlers, msg, field)
        }
        CommandField::CGetRq => dispatch_get(provider, handlers, msg),
        CommandField::NEventReportRq
        | CommandField::NGetRq
        | CommandField::NSetRq
        | CommandField::NActionRq
        | CommandField::NCreateRq
        | CommandField::NDeleteRq => dispatch_n(provider, handlers, msg, field),
        CommandField::CCancelRq => {
            // nothing in progress to abandon at this point
            warn!("disregarding C-CANCEL with no operation in progress");
            Ok(Flow::Continue)
        }
        _ => {
            // a response with nothing outstanding on our side
            provider.abort(AbortRQServiceProviderReason::UnexpectedPduParameter);
            UnexpectedResponseSnafu {
                presentation_context_id: msg.presentation_context_id,
                message_id: msg.command.message_id_being_responded_to().unwrap_or(0),
            }
            .fail()
        }
    }
}

fn dispatch_echo<A: UpperLayer>(
    provider: &mut DimseProvider<A>,
    handlers: &mut ServiceHandlers,
    msg: Message,
) -> Result<Flow> {
    let message_id = msg.command.message_id()?;
    let disposition = match &mut handlers.echo {
        Some(handler) => handler(&msg.command),
        None => Disposition::Respond(Status::SUCCESS),
    };
    match disposition {
        Disposition::Respond(status) => {
            let rsp = CEchoRsp::builder()
                .message_id_being_responded_to(message_id)
                .status(status.0)
                .build();
            respond(provider, handlers, msg.presentation_context_id, &rsp, None)?;
            Ok(Flow::Continue)
        }
        Disposition::Abort => {
            abort_by_user(provider);
            Ok(Flow::Stop)
        }
    }
}

fn dispatch_store<A: UpperLayer>(
    provider: &mut DimseProvider<A>,
    handlers: &mut ServiceHandlers,
    msg: Message,
) -> Result<Flow> {
    let message_id = msg.command.message_id()?;
    let sop_class_uid = msg.command.affected_sop_class_uid().unwrap_or_default();
    let sop_instance_uid = msg.command.affected_sop_instance_uid().unwrap_or_default();
    let transfer_syntax = transfer_syntax_of(provider, msg.presentation_context_id);

    let disposition = match (handlers.store.get_mut(&sop_class_uid), &msg.data) {
        (Some(handler), Some(data)) => handler(StoreRequest {
            presentation_context_id: msg.presentation_context_id,
            sop_class_uid: &sop_class_uid,
            sop_instance_uid: &sop_instance_uid,
            transfer_syntax: &transfer_syntax,
            data,
            command: &msg.command,
        }),
        (Some(_), None) => {
            warn!("C-STORE request without a data set");
            Disposition::Respond(Status::PROCESSING_FAILURE)
        }
        (None, _) => Disposition::Respond(Status::SOP_CLASS_NOT_SUPPORTED),
    };

    match disposition {
        Disposition::Respond(status) => {
            let rsp = CStoreRsp::builder()
                .message_id_being_responded_to(message_id)
                .affected_sop_class_uid(&sop_class_uid)
                .affected_sop_instance_uid(&sop_instance_uid)
                .status(status.0)
                .build();
            respond(provider, handlers, msg.presentation_context_id, &rsp, None)?;
            Ok(Flow::Continue)
        }
        Disposition::Abort => {
            abort_by_user(provider);
            Ok(Flow::Stop)
        }
    }
}

/// Look for a C-CANCEL correlating to the operation in progress.
/// Other arrivals are put back or honored.
enum CancelCheck {
    Cancelled,
    Proceed,
    Stop,
}

fn check_cancel<A: UpperLayer>(
    provider: &mut DimseProvider<A>,
    handlers: &mut ServiceHandlers,
    message_id: u16,
) -> Result<CancelCheck> {
    match provider.poll_incoming(CANCEL_POLL)? {
        None => Ok(CancelCheck::Proceed),
        Some(Incoming::Message(m)) => {
            let is_cancel = m
                .command
                .command_field()
                .map(|f| f == CommandField::CCancelRq)
                .unwrap_or(false)
                && m.command
                    .message_id_being_responded_to()
                    .map(|id| id == message_id)
                    .unwrap_or(false);
            if is_cancel {
                Ok(CancelCheck::Cancelled)
            } else {
                provider.stash_request(m);
                Ok(CancelCheck::Proceed)
            }
        }
        Some(Incoming::ReleaseRequested) => {
            let _ = provider.upper_mut().send_pdu(&Pdu::ReleaseRP);
            handlers.emit(&ServiceEvent::Released);
            Ok(CancelCheck::Stop)
        }
        Some(Incoming::Aborted(source)) => {
            handlers.emit(&ServiceEvent::Aborted { source });
            Ok(CancelCheck::Stop)
        }
    }
}

fn dispatch_query<A: UpperLayer>(
    provider: &mut DimseProvider<A>,
    handlers: &mut ServiceHandlers,
    msg: Message,
    field: CommandField,
) -> Result<Flow> {
    let message_id = msg.command.message_id()?;
    let sop_class_uid = msg.command.affected_sop_class_uid().unwrap_or_default();
    let transfer_syntax = transfer_syntax_of(provider, msg.presentation_context_id);
    let pc_id = msg.presentation_context_id;

    let build_rsp = |status: Status, identifier_follows: bool| -> Box<dyn Command + 'static> {
        match field {
            CommandField::CMoveRq => Box::new(
                CMoveRsp::builder()
                    .message_id_being_responded_to(message_id)
                    .status(status.0)
                    .identifier_follows(identifier_follows)
                    .build(),
            ),
            _ => Box::new(
                CFindRsp::builder()
                    .message_id_being_responded_to(message_id)
                    .status(status.0)
                    .identifier_follows(identifier_follows)
                    .build(),
            ),
        }
    };

    let identifier = msg
        .data
        .as_deref()
        .map(|bytes| decode_data_set(bytes, &transfer_syntax))
        .transpose()?;

    let handler_map = if field == CommandField::CMoveRq {
        &mut handlers.mv
    } else {
        &mut handlers.find
    };
    let responses = match handler_map.get_mut(&sop_class_uid) {
        Some(handler) => handler(QueryRequest {
            presentation_context_id: pc_id,
            sop_class_uid: sop_class_uid.clone(),
            identifier,
            command: msg.command,
        }),
        None => {
            let rsp = build_rsp(Status::SOP_CLASS_NOT_SUPPORTED, false);
            let bytes = rsp.encode()?;
            provider.send_message(pc_id, bytes, None)?;
            return Ok(Flow::Continue);
        }
    };

    let mut sent_terminal = false;
    for (status, identifier) in responses {
        match check_cancel(provider, handlers, message_id)? {
            CancelCheck::Cancelled => {
                let rsp = build_rsp(Status::CANCEL, false);
                let bytes = rsp.encode()?;
                provider.send_message(pc_id, bytes, None)?;
                return Ok(Flow::Continue);
            }
            CancelCheck::Stop => return Ok(Flow::Stop),
            CancelCheck::Proceed => {}
        }

        let data = identifier
            .as_ref()
            .map(|obj| encode_data_set(obj, &transfer_syntax))
            .transpose()?;
        let rsp = build_rsp(status, data.is_some());
        let bytes = rsp.encode()?;
        provider.send_message(pc_id, bytes, data)?;
        handlers.emit(&ServiceEvent::MessageSent {
            presentation_context_id: pc_id,
            field: rsp.command_field(),
        });
        if status.is_terminal() {
            sent_terminal = true;
            break;
        }
    }
    if !sent_terminal {
        let rsp = build_rsp(Status::SUCCESS, false);
        let bytes = rsp.encode()?;
        provider.send_message(pc_id, bytes, None)?;
    }
    Ok(Flow::Continue)
}

fn dispatch_get<A: UpperLayer>(
    provider: &mut DimseProvider<A>,
    handlers: &mut ServiceHandlers,
    msg: Message,
) -> Result<Flow> {
    let message_id = msg.command.message_id()?;
    let sop_class_uid = msg.command.affected_sop_class_uid().unwrap_or_default();
    let transfer_syntax = transfer_syntax_of(provider, msg.presentation_context_id);
    let pc_id = msg.presentation_context_id;

    let identifier = msg
        .data
        .as_deref()
        .map(|bytes| decode_data_set(bytes, &transfer_syntax))
        .transpose()?;

    let items: Vec<InMemDicomObject> = match handlers.get.get_mut(&sop_class_uid) {
        Some(handler) => handler(QueryRequest {
            presentation_context_id: pc_id,
            sop_class_uid: sop_class_uid.clone(),
            identifier,
            command: msg.command,
        })
        .collect(),
        None => {
            let rsp = CGetRsp::builder()
                .message_id_being_responded_to(message_id)
                .status(Status::SOP_CLASS_NOT_SUPPORTED.0)
                .build();
            respond(provider, handlers, pc_id, &rsp, None)?;
            return Ok(Flow::Continue);
        }
    };

    let total = items.len() as u16;
    let mut completed = 0_u16;
    let mut failed = 0_u16;
    let mut warnings = 0_u16;

    for item in items {
        match check_cancel(provider, handlers, message_id)? {
            CancelCheck::Cancelled => {
                let rsp = CGetRsp::builder()
                    .message_id_being_responded_to(message_id)
                    .status(Status::CANCEL.0)
                    .number_of_remaining_suboperations(total - completed - failed - warnings)
                    .number_of_completed_suboperations(completed)
                    .number_of_failed_suboperations(failed)
                    .number_of_warning_suboperations(warnings)
                    .build();
                respond(provider, handlers, pc_id, &rsp, None)?;
                return Ok(Flow::Continue);
            }
            CancelCheck::Stop => return Ok(Flow::Stop),
            CancelCheck::Proceed => {}
        }

        match store_sub_operation(provider, &item) {
            Ok(status) => match status.class() {
                StatusClass::Success => completed += 1,
                StatusClass::Warning => warnings += 1,
                _ => failed += 1,
            },
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("store sub-operation failed: {}", e);
                failed += 1;
            }
        }

        let rsp = CGetRsp::builder()
            .message_id_being_responded_to(message_id)
            .status(Status::PENDING.0)
            .number_of_remaining_suboperations(total - completed - failed - warnings)
            .number_of_completed_suboperations(completed)
            .number_of_failed_suboperations(failed)
            .number_of_warning_suboperations(warnings)
            .build();
        respond(provider, handlers, pc_id, &rsp, None)?;
    }

    let status = if failed > 0 {
        // sub-operations completed, one or more failures
        Status(0xB000)
    } else {
        Status::SUCCESS
    };
    let rsp = CGetRsp::builder()
        .message_id_being_responded_to(message_id)
        .status(status.0)
        .number_of_completed_suboperations(completed)
        .number_of_failed_suboperations(failed)
        .number_of_warning_suboperations(warnings)
        .build();
    respond(provider, handlers, pc_id, &rsp, None)?;
    Ok(Flow::Continue)
}

/// Transfer one data set back to the peer
/// through a C-STORE sub-operation on this association.
fn store_sub_operation<A: UpperLayer>(
    provider: &mut DimseProvider<A>,
    item: &InMemDicomObject,
) -> Result<Status> {
    let sop_class_uid = item
        .element(tags::SOP_CLASS_UID)
        .ok()
        .context(MissingAttributeSnafu {
            name: "SOP Class UID",
        })?
        .to_str()
        .context(ConvertCommandElementSnafu {
            name: "SOP Class UID",
        })?
        .trim_end_matches(|c: char| c == '\0' || c == ' ')
        .to_string();
    let sop_instance_uid = item
        .element(tags::SOP_INSTANCE_UID)
        .ok()
        .context(MissingAttributeSnafu {
            name: "SOP Instance UID",
        })?
        .to_str()
        .context(ConvertCommandElementSnafu {
            name: "SOP Instance UID",
        })?
        .trim_end_matches(|c: char| c == '\0' || c == ' ')
        .to_string();

    // on this side, the peer performs the storage:
    // the context must carry our SCU role for the storage class
    let pc = provider.find_context(&sop_class_uid, true)?;
    let (store_pc_id, store_ts) = (pc.id, pc.transfer_syntax.clone());
    let data = encode_data_set(item, &store_ts)?;

    let sub_message_id = provider.next_message_id();
    let command = CStoreRq::builder()
        .message_id(sub_message_id)
        .affected_sop_class_uid(&sop_class_uid)
        .affected_sop_instance_uid(&sop_instance_uid)
        .build();
    let bytes = command.encode()?;
    provider.send_message(store_pc_id, bytes, Some(data))?;
    provider.register_pending(store_pc_id, sub_message_id);

    let rsp = provider.await_response(store_pc_id, sub_message_id);
    provider.complete_request(store_pc_id, sub_message_id);
    rsp?.command.status()
}

fn dispatch_n<A: UpperLayer>(
    provider: &mut DimseProvider<A>,
    handlers: &mut ServiceHandlers,
    msg: Message,
    field: CommandField,
) -> Result<Flow> {
    let message_id = msg.command.message_id()?;
    let sop_class_uid = msg.command.sop_class_uid().unwrap_or_default();
    let sop_instance_uid = msg.command.sop_instance_uid().unwrap_or_default();
    let transfer_syntax = transfer_syntax_of(provider, msg.presentation_context_id);
    let pc_id = msg.presentation_context_id;

    let dataset = msg
        .data
        .as_deref()
        .map(|bytes| decode_data_set(bytes, &transfer_syntax))
        .transpose()?;

    let handler_map = match field {
        CommandField::NEventReportRq => &mut handlers.n_event_report,
        CommandField::NGetRq => &mut handlers.n_get,
        CommandField::NSetRq => &mut handlers.n_set,
        CommandField::NActionRq => &mut handlers.n_action,
        CommandField::NCreateRq => &mut handlers.n_create,
        _ => &mut handlers.n_delete,
    };

    let (status, reply) = match handler_map.get_mut(&sop_class_uid) {
        Some(handler) => handler(&msg.command, dataset),
        None => (Status::SOP_CLASS_NOT_SUPPORTED, None),
    };
    let data = reply
        .as_ref()
        .map(|obj| encode_data_set(obj, &transfer_syntax))
        .transpose()?;
    let has_data = data.is_some();

    let rsp: Box<dyn Command + '_> = match field {
        CommandField::NEventReportRq => Box::new(
            NEventReportRsp::builder()
                .message_id_being_responded_to(message_id)
                .affected_sop_class_uid(&sop_class_uid)
                .affected_sop_instance_uid(&sop_instance_uid)
                .maybe_event_type_id(msg.command.event_type_id())
                .status(status.0)
                .event_reply_follows(has_data)
                .build(),
        ),
        CommandField::NGetRq => Box::new(
            NGetRsp::builder()
                .message_id_being_responded_to(message_id)
                .affected_sop_class_uid(&sop_class_uid)
                .affected_sop_instance_uid(&sop_instance_uid)
                .status(status.0)
                .attributes_follow(has_data)
                .build(),
        ),
        CommandField::NSetRq => Box::new(
            NSetRsp::builder()
                .message_id_being_responded_to(message_id)
                .affected_sop_class_uid(&sop_class_uid)
                .affected_sop_instance_uid(&sop_instance_uid)
                .status(status.0)
                .attributes_follow(has_data)
                .build(),
        ),
        CommandField::NActionRq => Box::new(
            NActionRsp::builder()
                .message_id_being_responded_to(message_id)
                .affected_sop_class_uid(&sop_class_uid)
                .affected_sop_instance_uid(&sop_instance_uid)
                .maybe_action_type_id(msg.command.action_type_id())
                .status(status.0)
                .action_reply_follows(has_data)
                .build(),
        ),
        CommandField::NCreateRq => Box::new(
            NCreateRsp::builder()
                .message_id_being_responded_to(message_id)
                .affected_sop_class_uid(&sop_class_uid)
                .affected_sop_instance_uid(&sop_instance_uid)
                .status(status.0)
                .attributes_follow(has_data)
                .build(),
        ),
        _ => Box::new(
            NDeleteRsp::builder()
                .message_id_being_responded_to(message_id)
                .affected_sop_class_uid(&sop_class_uid)
                .affected_sop_instance_uid(&sop_instance_uid)
                .status(status.0)
                .build(),
        ),
    };

    let bytes = rsp.encode()?;
    provider.send_message(pc_id, bytes, data)?;
    handlers.emit(&ServiceEvent::MessageSent {
        presentation_context_id: pc_id,
        field: rsp.command_field(),
    });
    Ok(Flow::Continue)
}
