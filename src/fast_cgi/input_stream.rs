use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::defs;
use super::records::{Record, RecordError};

/// Frames FastCGI records out of a byte stream.
pub struct RecordInputStream<I> {
    input: I,
    buffer: BytesMut,
}

impl<I> RecordInputStream<I>
where
    I: AsyncRead + Unpin,
{
    pub fn new(input: I) -> RecordInputStream<I> {
        RecordInputStream {
            input,
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Access the underlying stream, e.g. to write replies on it.
    pub fn get_mut(&mut self) -> &mut I {
        &mut self.input
    }

    pub fn into_inner(self) -> I {
        self.input
    }

    fn take_record(&mut self) -> Result<Option<Record>, RecordError> {
        if self.buffer.len() < defs::FCGI_HEADER_LEN {
            return Ok(None);
        }
        let header = &self.buffer[..defs::FCGI_HEADER_LEN];
        let content_len = usize::from(u16::from_be_bytes([header[4], header[5]]));
        let padding_len = usize::from(header[6]);
        if self.buffer.len() < defs::FCGI_HEADER_LEN + content_len + padding_len {
            return Ok(None);
        }
        let mut header = self.buffer.split_to(defs::FCGI_HEADER_LEN);
        let version = header.get_u8();
        if version != defs::FCGI_VERSION_1 {
            return Err(RecordError::Version(version));
        }
        let rec_type = header.get_u8();
        let request_id = header.get_u16();
        let content_data = self.buffer.split_to(content_len).freeze();
        self.buffer.advance(padding_len);
        Ok(Some(Record {
            version,
            rec_type,
            request_id,
            content_data,
        }))
    }

    /// Returns the next record, or `None` when the peer closed the
    /// stream on a record boundary.
    pub async fn next_record(&mut self) -> Result<Option<Record>, RecordError> {
        loop {
            if let Some(rec) = self.take_record()? {
                return Ok(Some(rec));
            }
            if self.input.read_buf(&mut self.buffer).await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(RecordError::Truncated("record"));
            }
        }
    }
}
