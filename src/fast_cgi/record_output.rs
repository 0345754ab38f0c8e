use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::defs;
use super::records::{AppRecord, Record, RecordError};

/// Writes FastCGI records onto a byte stream.
pub struct RecordOutput<O> {
    output: O,
}

impl<O> RecordOutput<O>
where
    O: AsyncWrite + Unpin,
{
    pub fn new(output: O) -> RecordOutput<O> {
        RecordOutput { output }
    }

    pub async fn write(&mut self, rec: &Record) -> Result<(), RecordError> {
        const PADDING: [u8; 7] = [0u8; 7];
        let content_len = rec.content_data.len();
        if content_len > defs::FCGI_MAX_CONTENT_LEN {
            return Err(RecordError::TooLong(content_len));
        }
        let padding_len = content_len.wrapping_neg() & 7;
        let mut frame = BytesMut::with_capacity(defs::FCGI_HEADER_LEN + content_len + padding_len);
        frame.put_u8(rec.version);
        frame.put_u8(rec.rec_type);
        frame.put_u16(rec.request_id);
        frame.put_u16(content_len as u16);
        frame.put_u8(padding_len as u8);
        frame.put_u8(0);
        frame.put_slice(&rec.content_data);
        frame.put_slice(&PADDING[..padding_len]);
        self.output.write_all(&frame).await?;
        Ok(())
    }

    pub async fn write_app(&mut self, rec: &AppRecord, request_id: u16) -> Result<(), RecordError> {
        self.write(&rec.encode(request_id)?).await
    }

    /// Write a stream payload (STDOUT/STDERR), split so no record
    /// exceeds the maximum content length.
    pub async fn write_stream(
        &mut self,
        stderr: bool,
        data: &[u8],
        request_id: u16,
    ) -> Result<(), RecordError> {
        for chunk in data.chunks(defs::FCGI_MAX_CONTENT_LEN) {
            let chunk = bytes::Bytes::copy_from_slice(chunk);
            let rec = if stderr {
                AppRecord::StdErr(chunk)
            } else {
                AppRecord::StdOut(chunk)
            };
            self.write_app(&rec, request_id).await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), RecordError> {
        self.output.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), RecordError> {
        self.output.shutdown().await?;
        Ok(())
    }
}
