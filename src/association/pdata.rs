//! Streaming abstractions over P-DATA-TF traffic.
//!
//! [`PDataWriter`] exposes a [`Write`] implementation
//! which fragments the incoming bytes into presentation data values
//! bounded by the peer's maximum PDU length,
//! marking only the final fragment as last.
//! [`PDataReader`] exposes a [`Read`] implementation
//! which concatenates incoming fragments
//! until the last-fragment bit is seen.
use std::collections::VecDeque;
use std::io::{Cursor, Read, Write};

use bytes::{Buf, BytesMut};
use tracing::warn;

use crate::pdu::{
    read_pdu, write_pdu, PDataValue, PDataValueType, Pdu, MINIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};

/// The overhead of one presentation data value item inside a P-DATA-TF PDU:
/// item length (4), presentation context ID (1)
/// and message control header (1).
const PDV_OVERHEAD: u32 = 6;

/// Maximum fragment payload admitted by one PDU of the given length.
pub(crate) fn max_fragment_payload(max_pdu_length: u32) -> usize {
    max_pdu_length.max(MINIMUM_PDU_SIZE).saturating_sub(PDV_OVERHEAD) as usize
}

/// A P-Data value writer.
///
/// This exposes an API to iteratively construct and send data messages
/// to another node.
/// Using this as a [standard writer](std::io::Write)
/// will automatically split the incoming bytes
/// into separate PDUs if they do not fit in a single one.
///
/// # Example
///
/// Use an association's `send_pdata` method
/// to create a new P-Data value writer.
///
/// ```no_run
/// # use std::io::Write;
/// # use dicom_net::association::ClientAssociationOptions;
/// # fn dicom_data() -> &'static [u8] { unimplemented!() }
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut association = ClientAssociationOptions::new()
///    .with_abstract_syntax("1.2.840.10008.1.1")
///    .establish("129.168.0.5:104")?;
///
/// let presentation_context_id = association.presentation_contexts()[0].id;
///
/// let mut pdata = association.send_pdata(presentation_context_id);
/// pdata.write_all(dicom_data())?;
/// pdata.finish()?;
/// # Ok(())
/// # }
/// ```
#[must_use]
pub struct PDataWriter<W: Write> {
    stream: W,
    presentation_context_id: u8,
    value_type: PDataValueType,
    buffer: Vec<u8>,
    scratch: Vec<u8>,
    max_payload: usize,
    finished: bool,
}

impl<W> PDataWriter<W>
where
    W: Write,
{
    /// Construct a new P-Data value writer for data set fragments.
    ///
    /// `max_pdu_length` is the maximum PDU length
    /// declared by the receiving peer.
    pub(crate) fn new(stream: W, presentation_context_id: u8, max_pdu_length: u32) -> Self {
        Self::new_with_type(
            stream,
            presentation_context_id,
            max_pdu_length,
            PDataValueType::Data,
        )
    }

    pub(crate) fn new_with_type(
        stream: W,
        presentation_context_id: u8,
        max_pdu_length: u32,
        value_type: PDataValueType,
    ) -> Self {
        let max_payload = max_fragment_payload(max_pdu_length);
        PDataWriter {
            stream,
            presentation_context_id,
            value_type,
            buffer: Vec::with_capacity(max_payload),
            scratch: Vec::with_capacity(max_payload + (PDV_OVERHEAD + PDU_HEADER_SIZE) as usize),
            max_payload,
            finished: false,
        }
    }

    /// Declare to have finished sending fragments,
    /// thus emitting the last fragment PDU.
    ///
    /// This is also done automatically
    /// once the P-Data writer is dropped.
    pub fn finish(mut self) -> std::io::Result<()> {
        self.finish_impl()
    }

    fn finish_impl(&mut self) -> std::io::Result<()> {
        if !self.finished {
            self.finished = true;
            self.dispatch(true)?;
        }
        Ok(())
    }

    /// Emit one PDU holding the current buffer contents.
    fn dispatch(&mut self, is_last: bool) -> std::io::Result<()> {
        let pdu = Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: self.presentation_context_id,
                value_type: self.value_type,
                is_last,
                data: std::mem::take(&mut self.buffer),
            }],
        };
        self.scratch.clear();
        write_pdu(&mut self.scratch, &pdu)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        self.stream.write_all(&self.scratch)
    }
}

impl<W> Write for PDataWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.finished {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "P-Data writer already finished",
            ));
        }
        let take = buf.len().min(self.max_payload - self.buffer.len());
        self.buffer.extend_from_slice(&buf[..take]);
        if self.buffer.len() == self.max_payload {
            // full fragment, send it and keep accepting bytes
            self.dispatch(false)?;
        }
        Ok(take)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // fragments are only dispatched when full or on finish
        Ok(())
    }
}

/// With the P-Data writer dropped,
/// this `Drop` implementation
/// will construct and emit the last fragment PDU
/// if it was not explicitly finished.
impl<W> Drop for PDataWriter<W>
where
    W: Write,
{
    fn drop(&mut self) {
        let _ = self.finish_impl();
    }
}

/// A P-Data value reader.
///
/// This exposes an API which provides a byte stream of data
/// by iteratively collecting data fragments from another node,
/// even if they reside in separate PDUs,
/// until the last fragment of the message is received.
///
/// The wire read buffer is borrowed from the association,
/// so that bytes of a subsequent PDU
/// which arrive in the same socket read
/// stay available after the reader is dropped.
#[must_use]
pub struct PDataReader<'b, R> {
    stream: R,
    buffer: VecDeque<u8>,
    read_buffer: &'b mut BytesMut,
    presentation_context_id: Option<u8>,
    max_pdu_length: u32,
    last_fragment_seen: bool,
}

impl<'b, R> PDataReader<'b, R> {
    pub(crate) fn new(stream: R, read_buffer: &'b mut BytesMut, max_pdu_length: u32) -> Self {
        PDataReader {
            stream,
            buffer: VecDeque::with_capacity(max_pdu_length as usize),
            read_buffer,
            presentation_context_id: None,
            max_pdu_length,
            last_fragment_seen: false,
        }
    }

    /// The presentation context the incoming fragments travel on,
    /// once the first fragment has been seen.
    pub fn presentation_context_id(&self) -> Option<u8> {
        self.presentation_context_id
    }

    /// Declare no intention to read more PDUs from the remote node.
    ///
    /// Attempting to read more bytes
    /// will only consume the inner buffer.
    pub fn stop_receiving(&mut self) {
        self.last_fragment_seen = true;
    }
}

impl<R> Read for PDataReader<'_, R>
where
    R: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.buffer.is_empty() {
            if self.last_fragment_seen {
                // end of the P-Data stream
                return Ok(0);
            }

            let pdu = loop {
                let mut cursor = Cursor::new(&self.read_buffer[..]);
                match read_pdu(&mut cursor, self.max_pdu_length, false)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
                {
                    Some(pdu) => {
                        self.read_buffer.advance(cursor.position() as usize);
                        break pdu;
                    }
                    None => {
                        let mut chunk = [0u8; 8192];
                        let n = self.stream.read(&mut chunk)?;
                        if n == 0 {
                            return Err(std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "connection closed mid P-Data message",
                            ));
                        }
                        self.read_buffer.extend_from_slice(&chunk[..n]);
                    }
                }
            };

            match pdu {
                Pdu::PData { data } => {
                    for pdv in data {
                        match self.presentation_context_id {
                            None => self.presentation_context_id = Some(pdv.presentation_context_id),
                            Some(id) if id != pdv.presentation_context_id => {
                                warn!(
                                    "Received P-Data fragment of presentation context {}, expected {}",
                                    pdv.presentation_context_id, id
                                );
                            }
                            Some(_) => {}
                        }
                        self.last_fragment_seen |= pdv.is_last;
                        self.buffer.extend(pdv.data);
                    }
                }
                pdu => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("unexpected PDU `{}` amid P-Data traffic", pdu.short_description()),
                    ));
                }
            }
        }

        let (front, _) = self.buffer.as_slices();
        let n = front.len().min(buf.len());
        buf[..n].copy_from_slice(&front[..n]);
        self.buffer.drain(..n);
        Ok(n)
    }
}
