use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::defs;
use super::input_stream::RecordInputStream;
use super::record_output::RecordOutput;
use super::records::{AppRecord, EndRequest, NameValuePair, RecordError, ServerRecord};

/// A responder request whose parameters and input have been received.
#[derive(Debug)]
pub struct Request {
    pub request_id: u16,
    pub keep_conn: bool,
    pub params: BTreeMap<String, String>,
    pub stdin: BytesMut,
}

/// Values reported in reply to FCGI_GET_VALUES.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_conns: usize,
    pub max_reqs: usize,
}

async fn reply<S>(
    input: &mut RecordInputStream<S>,
    rec: AppRecord,
    request_id: u16,
) -> Result<(), RecordError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    RecordOutput::new(input.get_mut()).write_app(&rec, request_id).await
}

fn end_request(protocol_status: u8) -> AppRecord {
    AppRecord::EndRequest(EndRequest {
        app_status: 0,
        protocol_status,
    })
}

fn get_values_result(names: Vec<NameValuePair>, limits: &ConnectionLimits) -> AppRecord {
    let values = names
        .into_iter()
        .filter_map(|p| {
            let value = match p.name.as_str() {
                defs::FCGI_MAX_CONNS => limits.max_conns.to_string(),
                defs::FCGI_MAX_REQS => limits.max_reqs.to_string(),
                defs::FCGI_MPXS_CONNS => "0".to_string(),
                _ => return None,
            };
            Some(NameValuePair::new(p.name, value))
        })
        .collect();
    AppRecord::GetValuesResult(values)
}

fn content_length(params: &BTreeMap<String, String>) -> usize {
    params
        .get("CONTENT_LENGTH")
        .and_then(|l| l.trim().parse().ok())
        .unwrap_or(0)
}

/// Read records until one responder request is complete.
///
/// Management records are answered on the way. Returns `None` when the
/// peer closes the connection or aborts the request before it completes.
pub async fn read_request<S>(
    input: &mut RecordInputStream<S>,
    limits: &ConnectionLimits,
) -> Result<Option<Request>, RecordError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut current: Option<Request> = None;
    while let Some(rec) = input.next_record().await? {
        let decoded = match ServerRecord::decode(&rec) {
            Ok(decoded) => decoded,
            Err(RecordError::UnknownType(t)) => {
                reply(input, AppRecord::UnknownType(t), defs::FCGI_NULL_REQUEST_ID).await?;
                continue;
            }
            Err(e) => return Err(e),
        };
        if rec.request_id == defs::FCGI_NULL_REQUEST_ID {
            let answer = match decoded {
                ServerRecord::GetValues(names) => get_values_result(names, limits),
                _ => AppRecord::UnknownType(rec.rec_type),
            };
            reply(input, answer, defs::FCGI_NULL_REQUEST_ID).await?;
            continue;
        }
        match (decoded, current.as_mut()) {
            (ServerRecord::BeginRequest(begin), None) => {
                if begin.role != defs::FCGI_RESPONDER {
                    debug!(role = begin.role, "rejecting non-responder request");
                    reply(input, end_request(defs::FCGI_UNKNOWN_ROLE), rec.request_id).await?;
                    continue;
                }
                current = Some(Request {
                    request_id: rec.request_id,
                    keep_conn: begin.keep_conn(),
                    params: BTreeMap::new(),
                    stdin: BytesMut::new(),
                });
            }
            (ServerRecord::BeginRequest(_), Some(_)) => {
                reply(input, end_request(defs::FCGI_CANT_MPX_CONN), rec.request_id).await?;
            }
            (_, Some(req)) if req.request_id != rec.request_id => {
                debug!(request_id = rec.request_id, "ignoring record for other request");
            }
            (_, None) => {
                debug!(request_id = rec.request_id, "ignoring record outside a request");
            }
            (ServerRecord::Params(pairs), Some(req)) => {
                for p in pairs {
                    req.params.insert(p.name, p.value);
                }
            }
            (ServerRecord::StdIn(data), Some(req)) => {
                if data.is_empty() {
                    return Ok(current);
                }
                // Input past CONTENT_LENGTH is never read; drain it without
                // buffering.
                let room = content_length(&req.params).saturating_sub(req.stdin.len());
                if data.len() > room {
                    debug!(
                        request_id = req.request_id,
                        discarded = data.len() - room,
                        "input beyond CONTENT_LENGTH"
                    );
                }
                req.stdin.put(data.slice(..data.len().min(room)));
            }
            (ServerRecord::Abort, Some(req)) => {
                debug!(request_id = req.request_id, "request aborted by peer");
                let request_id = req.request_id;
                reply(input, end_request(defs::FCGI_REQUEST_COMPLETE), request_id).await?;
                return Ok(None);
            }
            (ServerRecord::Data(_), Some(_)) | (ServerRecord::GetValues(_), Some(_)) => {}
        }
    }
    Ok(None)
}
