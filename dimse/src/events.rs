//! Typed service events and the handler registry.
//!
//! Applications bind handlers for the DIMSE services they provide,
//! keyed by SOP class UID with an optional fallback,
//! and may observe association lifecycle events
//! through a single monitor callback.
//! Dispatch is by tagged variants rather than event names,
//! so a missing binding is a compile-time absence,
//! not a runtime string lookup failure.
use std::collections::HashMap;

use dicom_object::InMemDicomObject;
use netdicom_ul::pdu::AbortRQSource;

use crate::commands::{CommandField, Status};
use crate::messages::{decode_data_set, CommandSet};
use crate::Result;

/// The outcome of a request handler.
pub enum Disposition {
    /// Answer the request with the given status.
    Respond(Status),
    /// Abort the association instead of responding.
    Abort,
}

impl From<Status> for Disposition {
    fn from(status: Status) -> Self {
        Disposition::Respond(status)
    }
}

/// A C-STORE request as presented to its handler.
pub struct StoreRequest<'a> {
    /// the presentation context the request arrived on
    pub presentation_context_id: u8,
    /// the SOP class of the instance being stored
    pub sop_class_uid: &'a str,
    /// the UID of the instance being stored
    pub sop_instance_uid: &'a str,
    /// the transfer syntax the data set is encoded in
    pub transfer_syntax: &'a str,
    /// the raw data set bytes
    pub data: &'a [u8],
    /// the full command set
    pub command: &'a CommandSet,
}

impl StoreRequest<'_> {
    /// Decode the data set being stored.
    pub fn dataset(&self) -> Result<InMemDicomObject> {
        decode_data_set(self.data, self.transfer_syntax)
    }
}

/// A C-FIND, C-GET or C-MOVE request as presented to its handler.
#[derive(Debug)]
pub struct QueryRequest {
    /// the presentation context the request arrived on
    pub presentation_context_id: u8,
    /// the SOP class of the query model
    pub sop_class_uid: String,
    /// the query identifier
    pub identifier: Option<InMemDicomObject>,
    /// the full command set
    pub command: CommandSet,
}

/// Responses yielded by a query handler, in emission order.
/// The stream ends at the first terminal status;
/// a handler which yields none gets a success response
/// emitted on its behalf.
pub type QueryResponses = Box<dyn Iterator<Item = (Status, Option<InMemDicomObject>)>>;

/// Data sets yielded by a retrieve handler,
/// each transferred back through a C-STORE sub-operation.
pub type RetrieveItems = Box<dyn Iterator<Item = InMemDicomObject>>;

pub type EchoHandler = Box<dyn FnMut(&CommandSet) -> Disposition + Send>;
pub type StoreHandler = Box<dyn FnMut(StoreRequest<'_>) -> Disposition + Send>;
pub type QueryHandler = Box<dyn FnMut(QueryRequest) -> QueryResponses + Send>;
pub type RetrieveHandler = Box<dyn FnMut(QueryRequest) -> RetrieveItems + Send>;
/// Handler for the DIMSE-N services: receives the command set
/// and the decoded data set when one followed,
/// and yields the response status with an optional data set.
pub type NServiceHandler =
    Box<dyn FnMut(&CommandSet, Option<InMemDicomObject>) -> (Status, Option<InMemDicomObject>) + Send>;

/// An association lifecycle or message exchange event.
#[derive(Debug)]
pub enum ServiceEvent {
    /// An association was established.
    Established {
        /// the peer's AE title
        peer_ae_title: String,
    },
    /// A complete message arrived.
    MessageReceived {
        presentation_context_id: u8,
        field: CommandField,
    },
    /// A complete message was sent.
    MessageSent {
        presentation_context_id: u8,
        field: CommandField,
    },
    /// The association was released.
    Released,
    /// The association was aborted.
    Aborted {
        /// who aborted
        source: AbortRQSource,
    },
}

/// Handlers for one service, bound by SOP class UID
/// with an optional fallback for any class.
pub(crate) struct HandlerMap<H> {
    by_class: HashMap<String, H>,
    fallback: Option<H>,
}

impl<H> Default for HandlerMap<H> {
    fn default() -> Self {
        HandlerMap {
            by_class: HashMap::new(),
            fallback: None,
        }
    }
}

impl<H> HandlerMap<H> {
    fn bind(&mut self, sop_class_uid: impl Into<String>, handler: H) {
        self.by_class.insert(sop_class_uid.into(), handler);
    }

    fn bind_fallback(&mut self, handler: H) {
        self.fallback = Some(handler);
    }

    pub(crate) fn get_mut(&mut self, sop_class_uid: &str) -> Option<&mut H> {
        if self.by_class.contains_key(sop_class_uid) {
            self.by_class.get_mut(sop_class_uid)
        } else {
            self.fallback.as_mut()
        }
    }
}

/// The registry of service handlers of an application entity.
///
/// Bind one handler per service, or per (service, SOP class) pair;
/// requests for services with no binding are answered with
/// a `SOP class not supported` status.
#[derive(Default)]
pub struct ServiceHandlers {
    pub(crate) echo: Option<EchoHandler>,
    pub(crate) store: HandlerMap<StoreHandler>,
    pub(crate) find: HandlerMap<QueryHandler>,
    pub(crate) get: HandlerMap<RetrieveHandler>,
    pub(crate) mv: HandlerMap<QueryHandler>,
    pub(crate) n_event_report: HandlerMap<NServiceHandler>,
    pub(crate) n_get: HandlerMap<NServiceHandler>,
    pub(crate) n_set: HandlerMap<NServiceHandler>,
    pub(crate) n_action: HandlerMap<NServiceHandler>,
    pub(crate) n_create: HandlerMap<NServiceHandler>,
    pub(crate) n_delete: HandlerMap<NServiceHandler>,
    pub(crate) monitor: Option<Box<dyn FnMut(&ServiceEvent) + Send>>,
}

impl ServiceHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe association lifecycle and message events.
    pub fn on_event(mut self, monitor: impl FnMut(&ServiceEvent) + Send + 'static) -> Self {
        self.monitor = Some(Box::new(monitor));
        self
    }

    /// Handle C-ECHO requests.
    /// Without a binding, echo requests are answered with success.
    pub fn on_c_echo(mut self, handler: impl FnMut(&CommandSet) -> Disposition + Send + 'static) -> Self {
        self.echo = Some(Box::new(handler));
        self
    }

    /// Handle C-STORE requests for any SOP class.
    pub fn on_c_store(
        mut self,
        handler: impl FnMut(StoreRequest<'_>) -> Disposition + Send + 'static,
    ) -> Self {
        self.store.bind_fallback(Box::new(handler));
        self
    }

    /// Handle C-STORE requests for one SOP class.
    pub fn on_c_store_for(
        mut self,
        sop_class_uid: impl Into<String>,
        handler: impl FnMut(StoreRequest<'_>) -> Disposition + Send + 'static,
    ) -> Self {
        self.store.bind(sop_class_uid, Box::new(handler));
        self
    }

    /// Handle C-FIND requests for any SOP class.
    pub fn on_c_find(
        mut self,
        handler: impl FnMut(QueryRequest) -> QueryResponses + Send + 'static,
    ) -> Self {
        self.find.bind_fallback(Box::new(handler));
        self
    }

    /// Handle C-FIND requests for one SOP class.
    pub fn on_c_find_for(
        mut self,
        sop_class_uid: impl Into<String>,
        handler: impl FnMut(QueryRequest) -> QueryResponses + Send + 'static,
    ) -> Self {
        self.find.bind(sop_class_uid, Box::new(handler));
        self
    }

    /// Handle C-GET requests for any SOP class.
    pub fn on_c_get(
        mut self,
        handler: impl FnMut(QueryRequest) -> RetrieveItems + Send + 'static,
    ) -> Self {
        self.get.bind_fallback(Box::new(handler));
        self
    }

    /// Handle C-GET requests for one SOP class.
    pub fn on_c_get_for(
        mut self,
        sop_class_uid: impl Into<String>,
        handler: impl FnMut(QueryRequest) -> RetrieveItems + Send + 'static,
    ) -> Self {
        self.get.bind(sop_class_uid, Box::new(handler));
        self
    }

    /// Handle C-MOVE requests for any SOP class.
    ///
    /// The handler performs the sub-operations towards the
    /// move destination itself and yields the progress responses.
    pub fn on_c_move(
        mut self,
        handler: impl FnMut(QueryRequest) -> QueryResponses + Send + 'static,
    ) -> Self {
        self.mv.bind_fallback(Box::new(handler));
        self
    }

    /// Handle C-MOVE requests for one SOP class.
    pub fn on_c_move_for(
        mut self,
        sop_class_uid: impl Into<String>,
        handler: impl FnMut(QueryRequest) -> QueryResponses + Send + 'static,
    ) -> Self {
        self.mv.bind(sop_class_uid, Box::new(handler));
        self
    }

    /// Handle N-EVENT-REPORT requests for any SOP class.
    pub fn on_n_event_report(
        mut self,
        handler: impl FnMut(&CommandSet, Option<InMemDicomObject>) -> (Status, Option<InMemDicomObject>)
            + Send
            + 'static,
    ) -> Self {
        self.n_event_report.bind_fallback(Box::new(handler));
        self
    }

    /// Handle N-GET requests for any SOP class.
    pub fn on_n_get(
        mut self,
        handler: impl FnMut(&CommandSet, Option<InMemDicomObject>) -> (Status, Option<InMemDicomObject>)
            + Send
            + 'static,
    ) -> Self {
        self.n_get.bind_fallback(Box::new(handler));
        self
    }

    /// Handle N-GET requests for one SOP class.
    pub fn on_n_get_for(
        mut self,
        sop_class_uid: impl Into<String>,
        handler: impl FnMut(&CommandSet, Option<InMemDicomObject>) -> (Status, Option<InMemDicomObject>)
            + Send
            + 'static,
    ) -> Self {
        self.n_get.bind(sop_class_uid, Box::new(handler));
        self
    }

    /// Handle N-SET requests for any SOP class.
    pub fn on_n_set(
        mut self,
        handler: impl FnMut(&CommandSet, Option<InMemDicomObject>) -> (Status, Option<InMemDicomObject>)
            + Send
            + 'static,
    ) -> Self {
        self.n_set.bind_fallback(Box::new(handler));
        self
    }

    /// Handle N-ACTION requests for any SOP class.
    pub fn on_n_action(
        mut self,
        handler: impl FnMut(&CommandSet, Option<InMemDicomObject>) -> (Status, Option<InMemDicomObject>)
            + Send
            + 'static,
    ) -> Self {
        self.n_action.bind_fallback(Box::new(handler));
        self
    }

    /// Handle N-CREATE requests for any SOP class.
    pub fn on_n_create(
        mut self,
        handler: impl FnMut(&CommandSet, Option<InMemDicomObject>) -> (Status, Option<InMemDicomObject>)
            + Send
            + 'static,
    ) -> Self {
        self.n_create.bind_fallback(Box::new(handler));
        self
    }

    /// Handle N-DELETE requests for any SOP class.
    pub fn on_n_delete(
        mut self,
        handler: impl FnMut(&CommandSet, Option<InMemDicomObject>) -> (Status, Option<InMemDicomObject>)
            + Send
            + 'static,
    ) -> Self {
        self.n_delete.bind_fallback(Box::new(handler));
        self
    }

    pub(crate) fn emit(&mut self, event: &ServiceEvent) {
        if let Some(monitor) = &mut self.monitor {
            monitor(event);
        }
    }
}
