//! Streamed reading and writing of P-DATA message fragments.
use std::{
    collections::VecDeque,
    io::{Read, Write},
};

use bytes::{Buf, BytesMut};
use tracing::warn;

use crate::pdu::{read_pdu, Pdu, PDU_HEADER_SIZE};

/// Determine the space for PDV payload bytes in a PDU
/// bounded by the given length property:
/// the 4-byte PDV item length, the context ID
/// and the message control header are accounted for.
#[inline]
fn max_data_length(pdu_length: u32) -> u32 {
    pdu_length - 4 - 2
}

/// A P-Data value writer.
///
/// Writing through the [`Write`](std::io::Write) interface accumulates
/// bytes into data set PDVs, automatically emitting a full P-DATA-TF PDU
/// whenever the peer's maximum PDU length is reached.
/// [`finish`](PDataWriter::finish) (or dropping the writer)
/// emits the last fragment with the final-fragment flag set.
#[must_use]
pub struct PDataWriter<W: Write> {
    buffer: Vec<u8>,
    stream: W,
    max_data_len: u32,
}

impl<W> PDataWriter<W>
where
    W: Write,
{
    /// Construct a new P-Data value writer
    /// for the given presentation context.
    ///
    /// `max_pdu_length` is the maximum PDU length declared by the peer.
    pub(crate) fn new(stream: W, presentation_context_id: u8, max_pdu_length: u32) -> Self {
        let max_data_len = max_data_length(max_pdu_length);
        let mut buffer = Vec::with_capacity((max_data_len + PDU_HEADER_SIZE) as usize);
        // PDU header template; lengths and the message control header
        // are filled in just before each emission
        buffer.extend(&[
            0x04, 0x00, // PDU-type + reserved
            0xFF, 0xFF, 0xFF, 0xFF, // PDU length, pending
            0xFF, 0xFF, 0xFF, 0xFF, // PDV item length, pending
            presentation_context_id,
            0xFF, // message control header, pending
        ]);

        PDataWriter {
            stream,
            max_data_len,
            buffer,
        }
    }

    /// Declare the data set complete,
    /// emitting the last P-DATA fragment PDU.
    ///
    /// This is also done automatically once the writer is dropped.
    pub fn finish(mut self) -> std::io::Result<()> {
        self.finish_impl()
    }

    /// Fill in the pending PDU header fields.
    fn setup_pdata_header(&mut self, is_last: bool) {
        let data_len = (self.buffer.len() - 12) as u32;

        let pdu_len = data_len + 4 + 2;
        self.buffer[2..6].copy_from_slice(&pdu_len.to_be_bytes());

        let pdv_len = data_len + 2;
        self.buffer[6..10].copy_from_slice(&pdv_len.to_be_bytes());

        self.buffer[11] = if is_last { 0x02 } else { 0x00 };
    }

    fn finish_impl(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            self.setup_pdata_header(true);
            self.stream.write_all(&self.buffer)?;
            // subsequent calls must not emit anything else
            self.buffer.clear();
        }
        Ok(())
    }

    /// Emit the buffered bytes as one full intermediate PDU.
    ///
    /// Precondition: the buffer holds exactly one PDU worth of data.
    fn dispatch_pdu(&mut self) -> std::io::Result<()> {
        debug_assert!(self.buffer.len() >= 12);
        self.setup_pdata_header(false);
        self.stream.write_all(&self.buffer)?;
        self.buffer.truncate(12);
        Ok(())
    }
}

impl<W> Write for PDataWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let total_len = self.max_data_len as usize + 12;
        if self.buffer.len() + buf.len() <= total_len {
            self.buffer.extend(buf);
            Ok(buf.len())
        } else {
            // fill to the brim, emit, and let the caller
            // hand over the rest in subsequent writes
            let buf = &buf[..total_len - self.buffer.len()];
            self.buffer.extend(buf);
            debug_assert_eq!(self.buffer.len(), total_len);
            self.dispatch_pdu()?;
            Ok(buf.len())
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<W> Drop for PDataWriter<W>
where
    W: Write,
{
    fn drop(&mut self) {
        let _ = self.finish_impl();
    }
}

/// Read one PDU out of a stream,
/// collecting bytes into `read_buffer` as needed.
fn next_pdu<R: Read>(
    stream: &mut R,
    read_buffer: &mut BytesMut,
    max_pdu_length: u32,
) -> std::io::Result<Pdu> {
    loop {
        let mut buf = std::io::Cursor::new(&read_buffer[..]);
        if let Some(pdu) = read_pdu(&mut buf, max_pdu_length, false)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
        {
            let consumed = buf.position() as usize;
            read_buffer.advance(consumed);
            return Ok(pdu);
        }
        let mut chunk = [0u8; 8192];
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        read_buffer.extend_from_slice(&chunk[..n]);
    }
}

/// A P-Data value reader.
///
/// Reading through the [`Read`](std::io::Read) interface
/// yields the data set bytes of incoming P-DATA-TF PDUs
/// until the final fragment is consumed.
#[must_use]
pub struct PDataReader<'a, R> {
    buffer: VecDeque<u8>,
    stream: R,
    read_buffer: &'a mut BytesMut,
    presentation_context_id: Option<u8>,
    max_pdu_length: u32,
    last_pdu: bool,
}

impl<'a, R> PDataReader<'a, R>
where
    R: Read,
{
    pub(crate) fn new(stream: R, max_pdu_length: u32, read_buffer: &'a mut BytesMut) -> Self {
        PDataReader {
            buffer: VecDeque::with_capacity(max_pdu_length as usize),
            stream,
            read_buffer,
            presentation_context_id: None,
            max_pdu_length,
            last_pdu: false,
        }
    }

    /// The presentation context of the data being read,
    /// known once the first fragment arrives.
    pub fn presentation_context_id(&self) -> Option<u8> {
        self.presentation_context_id
    }

    /// Declare no intention to read any further PDUs:
    /// subsequent reads only drain the internal buffer.
    pub fn stop_receiving(&mut self) {
        self.last_pdu = true;
    }
}

impl<R> Read for PDataReader<'_, R>
where
    R: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.buffer.is_empty() {
            if self.last_pdu {
                return Ok(0);
            }

            let pdu = next_pdu(&mut self.stream, self.read_buffer, self.max_pdu_length)?;
            match pdu {
                Pdu::PData { data } => {
                    for pdata_value in data {
                        self.presentation_context_id = match self.presentation_context_id {
                            None => Some(pdata_value.presentation_context_id),
                            Some(id) if id == pdata_value.presentation_context_id => Some(id),
                            Some(id) => {
                                warn!(
                                    "P-Data value for presentation context {} interleaved in a stream of context {}",
                                    pdata_value.presentation_context_id, id
                                );
                                Some(id)
                            }
                        };
                        self.buffer.extend(pdata_value.data);
                        self.last_pdu = pdata_value.is_last;
                    }
                }
                _ => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "unexpected PDU type in P-Data stream",
                    ))
                }
            }
        }
        Read::read(&mut self.buffer, buf)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::{Read, Write};

    use bytes::BytesMut;

    use crate::pdu::{
        read_pdu, write_pdu, PDataValue, PDataValueType, Pdu, MINIMUM_PDU_SIZE, PDU_HEADER_SIZE,
    };

    use super::{PDataReader, PDataWriter};

    fn read_all_pdus(mut bytes: &[u8]) -> Vec<Pdu> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            match read_pdu(&mut bytes, MINIMUM_PDU_SIZE, true).unwrap() {
                Some(pdu) => out.push(pdu),
                None => panic!("truncated PDU stream"),
            }
        }
        out
    }

    #[test]
    fn write_small_pdata() {
        let mut buf = Vec::new();
        {
            let mut writer = PDataWriter::new(&mut buf, 13, MINIMUM_PDU_SIZE);
            writer.write_all(&(0..64).collect::<Vec<u8>>()).unwrap();
            writer.finish().unwrap();
        }

        let pdus = read_all_pdus(&buf);
        assert_eq!(pdus.len(), 1);
        match &pdus[0] {
            Pdu::PData { data } => {
                assert_eq!(data.len(), 1);
                assert_eq!(data[0].value_type, PDataValueType::Data);
                assert_eq!(data[0].presentation_context_id, 13);
                assert!(data[0].is_last);
                assert_eq!(data[0].data, (0..64).collect::<Vec<u8>>());
            }
            pdu => panic!("expected P-DATA, got {:?}", pdu),
        }
    }

    #[test]
    fn write_large_pdata_splits_into_full_pdus() {
        let my_data: Vec<u8> = (0..9000_u32).map(|x| x as u8).collect();

        let mut buf = Vec::new();
        {
            let mut writer = PDataWriter::new(&mut buf, 31, MINIMUM_PDU_SIZE);
            writer.write_all(&my_data).unwrap();
            writer.finish().unwrap();
        }

        let pdus = read_all_pdus(&buf);
        assert_eq!(pdus.len(), 3);

        let mut all_data = Vec::new();
        for (i, pdu) in pdus.iter().enumerate() {
            match pdu {
                Pdu::PData { data } => {
                    assert_eq!(data.len(), 1);
                    let pdv = &data[0];
                    assert_eq!(pdv.presentation_context_id, 31);
                    assert_eq!(pdv.is_last, i == 2);
                    if i < 2 {
                        // intermediate PDUs are filled to the PDU length limit
                        assert_eq!(
                            pdv.data.len(),
                            (MINIMUM_PDU_SIZE - PDU_HEADER_SIZE) as usize
                        );
                    }
                    all_data.extend_from_slice(&pdv.data);
                }
                pdu => panic!("expected P-DATA, got {:?}", pdu),
            }
        }
        assert_eq!(all_data, my_data);
    }

    #[test]
    fn read_pdata_across_multiple_pdus() {
        let my_data: Vec<u8> = (0..9000_u32).map(|x| x as u8).collect();
        let mut pdu_stream = VecDeque::new();
        for (chunk, is_last) in [
            (&my_data[..3000], false),
            (&my_data[3000..6000], false),
            (&my_data[6000..], true),
        ] {
            write_pdu(
                &mut pdu_stream,
                &Pdu::PData {
                    data: vec![PDataValue {
                        presentation_context_id: 5,
                        value_type: PDataValueType::Data,
                        is_last,
                        data: chunk.to_vec(),
                    }],
                },
            )
            .unwrap();
        }

        let mut read_buffer = BytesMut::new();
        let mut out = Vec::new();
        let mut reader = PDataReader::new(&mut pdu_stream, MINIMUM_PDU_SIZE, &mut read_buffer);
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, my_data);
        assert_eq!(reader.presentation_context_id(), Some(5));
    }
}
