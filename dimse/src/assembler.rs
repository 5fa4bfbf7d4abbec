//! Reassembly of DIMSE messages out of presentation data values.
//!
//! Fragments arrive interleaved by presentation context:
//! within one context, all command fragments of a message
//! precede all of its data set fragments,
//! and only the final fragment of each part
//! has the last-fragment bit set.
//! The assembler tracks one in-progress message per context
//! and enforces those invariants on receive.
use std::collections::HashMap;

use netdicom_ul::pdu::{PDataValue, PDataValueType};
use snafu::{ensure, Backtrace, Snafu};

/// A violation of the message fragmenting rules.
///
/// These are protocol errors: the receiver
/// is expected to abort the association.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum AssemblyError {
    /// a data set fragment arrived with no preceding command set
    #[snafu(display(
        "data fragment without a preceding command on presentation context {}",
        presentation_context_id
    ))]
    DataWithoutCommand {
        presentation_context_id: u8,
        backtrace: Backtrace,
    },

    /// a command fragment arrived while a data set was still incomplete
    #[snafu(display(
        "command fragment interleaved with an incomplete data set on presentation context {}",
        presentation_context_id
    ))]
    CommandInterleaved {
        presentation_context_id: u8,
        backtrace: Backtrace,
    },

    /// a fragment arrived on a presentation context
    /// which was not accepted for this association
    #[snafu(display(
        "fragment on unacceptable presentation context {}",
        presentation_context_id
    ))]
    UnacceptablePresentationContext {
        presentation_context_id: u8,
        backtrace: Backtrace,
    },
}

type Result<T, E = AssemblyError> = std::result::Result<T, E>;

/// One part of a message completed by a fragment.
#[derive(Debug)]
pub enum Assembled {
    /// All command fragments of a message have arrived.
    CommandComplete {
        presentation_context_id: u8,
        bytes: Vec<u8>,
    },
    /// All data set fragments of a message have arrived.
    DataComplete {
        presentation_context_id: u8,
        bytes: Vec<u8>,
    },
}

#[derive(Debug, Default)]
enum ContextState {
    /// no message in progress
    #[default]
    Idle,
    /// collecting command fragments
    Command(Vec<u8>),
    /// command complete, collecting data set fragments
    Data(Vec<u8>),
}

/// The per-association message assembler.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    contexts: HashMap<u8, ContextState>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        MessageAssembler::default()
    }

    /// Declare that the message in progress on the given context
    /// continues with a data set.
    ///
    /// Called by the provider after parsing a completed command set
    /// whose data set type announces a data set.
    pub fn expect_data(&mut self, presentation_context_id: u8) {
        self.contexts
            .insert(presentation_context_id, ContextState::Data(Vec::new()));
    }

    /// Consume one fragment, returning a completed message part
    /// when this was its final fragment.
    pub fn feed(&mut self, pdv: PDataValue) -> Result<Option<Assembled>> {
        let pc_id = pdv.presentation_context_id;
        let state = self.contexts.remove(&pc_id).unwrap_or_default();

        let (next, out) = match (pdv.value_type, state) {
            (PDataValueType::Command, ContextState::Idle) => {
                if pdv.is_last {
                    (
                        ContextState::Idle,
                        Some(Assembled::CommandComplete {
                            presentation_context_id: pc_id,
                            bytes: pdv.data,
                        }),
                    )
                } else {
                    (ContextState::Command(pdv.data), None)
                }
            }
            (PDataValueType::Command, ContextState::Command(mut buffer)) => {
                buffer.extend_from_slice(&pdv.data);
                if pdv.is_last {
                    (
                        ContextState::Idle,
                        Some(Assembled::CommandComplete {
                            presentation_context_id: pc_id,
                            bytes: buffer,
                        }),
                    )
                } else {
                    (ContextState::Command(buffer), None)
                }
            }
            (PDataValueType::Command, state @ ContextState::Data(_)) => {
                self.contexts.insert(pc_id, state);
                return CommandInterleavedSnafu {
                    presentation_context_id: pc_id,
                }
                .fail();
            }
            (PDataValueType::Data, ContextState::Data(mut buffer)) => {
                buffer.extend_from_slice(&pdv.data);
                if pdv.is_last {
                    (
                        ContextState::Idle,
                        Some(Assembled::DataComplete {
                            presentation_context_id: pc_id,
                            bytes: buffer,
                        }),
                    )
                } else {
                    (ContextState::Data(buffer), None)
                }
            }
            (PDataValueType::Data, state) => {
                self.contexts.insert(pc_id, state);
                return DataWithoutCommandSnafu {
                    presentation_context_id: pc_id,
                }
                .fail();
            }
        };
        self.contexts.insert(pc_id, next);
        Ok(out)
    }

    /// Verify that the fragment belongs to one of the accepted contexts.
    pub fn check_context(&self, pdv: &PDataValue, accepted: &[u8]) -> Result<()> {
        ensure!(
            accepted.contains(&pdv.presentation_context_id),
            UnacceptablePresentationContextSnafu {
                presentation_context_id: pdv.presentation_context_id,
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pdv(pc_id: u8, command: bool, is_last: bool, data: &[u8]) -> PDataValue {
        PDataValue {
            presentation_context_id: pc_id,
            value_type: if command {
                PDataValueType::Command
            } else {
                PDataValueType::Data
            },
            is_last,
            data: data.to_vec(),
        }
    }

    #[test]
    fn single_fragment_command() {
        let mut assembler = MessageAssembler::new();
        let out = assembler.feed(pdv(1, true, true, b"cmd")).unwrap();
        match out {
            Some(Assembled::CommandComplete {
                presentation_context_id,
                bytes,
            }) => {
                assert_eq!(presentation_context_id, 1);
                assert_eq!(bytes, b"cmd");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn multi_fragment_command_and_data() {
        let mut assembler = MessageAssembler::new();
        assert!(assembler.feed(pdv(1, true, false, b"com")).unwrap().is_none());
        let out = assembler.feed(pdv(1, true, true, b"mand")).unwrap();
        assert!(matches!(
            out,
            Some(Assembled::CommandComplete { ref bytes, .. }) if bytes == b"command"
        ));

        assembler.expect_data(1);
        assert!(assembler.feed(pdv(1, false, false, b"da")).unwrap().is_none());
        let out = assembler.feed(pdv(1, false, true, b"ta")).unwrap();
        assert!(matches!(
            out,
            Some(Assembled::DataComplete { ref bytes, .. }) if bytes == b"data"
        ));
    }

    #[test]
    fn contexts_are_assembled_independently() {
        let mut assembler = MessageAssembler::new();
        assert!(assembler.feed(pdv(1, true, false, b"a")).unwrap().is_none());
        // another context may progress in between
        let out = assembler.feed(pdv(3, true, true, b"other")).unwrap();
        assert!(matches!(
            out,
            Some(Assembled::CommandComplete {
                presentation_context_id: 3,
                ..
            })
        ));
        let out = assembler.feed(pdv(1, true, true, b"b")).unwrap();
        assert!(matches!(
            out,
            Some(Assembled::CommandComplete {
                presentation_context_id: 1,
                ref bytes,
            }) if bytes == b"ab"
        ));
    }

    #[test]
    fn data_before_command_is_an_error() {
        let mut assembler = MessageAssembler::new();
        let err = assembler.feed(pdv(1, false, true, b"data")).unwrap_err();
        assert!(matches!(err, AssemblyError::DataWithoutCommand { .. }));
    }

    #[test]
    fn command_interleaved_with_data_is_an_error() {
        let mut assembler = MessageAssembler::new();
        assembler.feed(pdv(1, true, true, b"cmd")).unwrap();
        assembler.expect_data(1);
        assembler.feed(pdv(1, false, false, b"da")).unwrap();
        let err = assembler.feed(pdv(1, true, true, b"cmd2")).unwrap_err();
        assert!(matches!(err, AssemblyError::CommandInterleaved { .. }));
    }

    #[test]
    fn unacceptable_context_is_flagged() {
        let assembler = MessageAssembler::new();
        let fragment = pdv(5, true, true, b"cmd");
        assert!(assembler.check_context(&fragment, &[1, 3, 5]).is_ok());
        let err = assembler.check_context(&fragment, &[1, 3]).unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::UnacceptablePresentationContext { .. }
        ));
    }
}
