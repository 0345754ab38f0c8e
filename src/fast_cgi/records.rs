use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::decode;
use super::defs;
use super::encode;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("unrecognized record type {0}")]
    UnknownType(u8),
    #[error("record content of {0} bytes does not fit a record")]
    TooLong(usize),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<RecordError> for io::Error {
    fn from(err: RecordError) -> io::Error {
        match err {
            RecordError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub version: u8,
    pub rec_type: u8,
    pub request_id: u16,
    pub content_data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    pub role: u16,
    pub flags: u8,
}

impl BeginRequest {
    pub fn keep_conn(&self) -> bool {
        self.flags & defs::FCGI_KEEP_CONN != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    pub app_status: u32,
    pub protocol_status: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameValuePair {
    pub name: String,
    pub value: String,
}

impl NameValuePair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> NameValuePair {
        NameValuePair {
            name: name.into(),
            value: value.into(),
        }
    }
}

fn decode_pairs(block: Bytes) -> Result<Vec<NameValuePair>, RecordError> {
    Ok(decode::decode_name_value_pairs(block)?
        .into_iter()
        .map(|(name, value)| {
            NameValuePair::new(
                String::from_utf8_lossy(&name),
                String::from_utf8_lossy(&value),
            )
        })
        .collect())
}

/// Records sent by the web server.
#[derive(Debug, PartialEq, Eq)]
pub enum ServerRecord {
    GetValues(Vec<NameValuePair>),
    BeginRequest(BeginRequest),
    Params(Vec<NameValuePair>),
    StdIn(Bytes),
    Data(Bytes),
    Abort,
}

impl ServerRecord {
    pub fn decode(rec: &Record) -> Result<ServerRecord, RecordError> {
        match rec.rec_type {
            defs::FCGI_BEGIN_REQUEST => {
                let mut block = rec.content_data.clone();
                if block.len() < 3 {
                    return Err(RecordError::Truncated("begin request body"));
                }
                let role = block.get_u16();
                let flags = block.get_u8();
                Ok(ServerRecord::BeginRequest(BeginRequest { role, flags }))
            }
            defs::FCGI_ABORT_REQUEST => Ok(ServerRecord::Abort),
            defs::FCGI_PARAMS => Ok(ServerRecord::Params(decode_pairs(
                rec.content_data.clone(),
            )?)),
            defs::FCGI_STDIN => Ok(ServerRecord::StdIn(rec.content_data.clone())),
            defs::FCGI_DATA => Ok(ServerRecord::Data(rec.content_data.clone())),
            defs::FCGI_GET_VALUES => Ok(ServerRecord::GetValues(decode_pairs(
                rec.content_data.clone(),
            )?)),
            t => Err(RecordError::UnknownType(t)),
        }
    }
}

/// Records sent by the application.
#[derive(Debug, PartialEq, Eq)]
pub enum AppRecord {
    GetValuesResult(Vec<NameValuePair>),
    UnknownType(u8),
    EndRequest(EndRequest),
    StdOut(Bytes),
    StdErr(Bytes),
}

impl AppRecord {
    pub fn encode(&self, request_id: u16) -> Result<Record, RecordError> {
        let mut content = BytesMut::new();
        let rec_type = match self {
            AppRecord::EndRequest(end) => {
                content.put_u32(end.app_status);
                content.put_u8(end.protocol_status);
                content.put_slice(&[0u8; 3]);
                defs::FCGI_END_REQUEST
            }
            AppRecord::StdOut(data) => {
                content.put_slice(data);
                defs::FCGI_STDOUT
            }
            AppRecord::StdErr(data) => {
                content.put_slice(data);
                defs::FCGI_STDERR
            }
            AppRecord::GetValuesResult(values) => {
                for p in values {
                    encode::encode_name_value_pair(
                        &mut content,
                        p.name.as_bytes(),
                        p.value.as_bytes(),
                    );
                }
                defs::FCGI_GET_VALUES_RESULT
            }
            AppRecord::UnknownType(t) => {
                content.put_u8(*t);
                content.put_slice(&[0u8; 7]);
                defs::FCGI_UNKNOWN_TYPE
            }
        };
        if content.len() > defs::FCGI_MAX_CONTENT_LEN {
            return Err(RecordError::TooLong(content.len()));
        }
        Ok(Record {
            version: defs::FCGI_VERSION_1,
            rec_type,
            request_id,
            content_data: content.freeze(),
        })
    }
}
