//! Per-request state handed to a servlet: the decoded request and the
//! buffered response writer.

use std::collections::{BTreeMap, HashMap};
use std::io;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use percent_encoding::percent_decode;
use tokio::io::AsyncReadExt;
use tracing::warn;

use crate::transport::{BodyReader, CgiParams, Exchange, ResponseSink};

const OUTPUT_BUFFER: usize = 8 * 1024;

const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

fn header_key(name: &str) -> String {
    name.to_ascii_lowercase().replace('_', "-")
}

/// Request headers with case-insensitive lookup.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    headers: BTreeMap<String, String>,
}

impl HeaderMap {
    fn from_cgi(params: &CgiParams) -> HeaderMap {
        let mut headers = BTreeMap::new();
        for (name, value) in params {
            if let Some(http_name) = name.strip_prefix("HTTP_") {
                headers.insert(header_key(http_name), value.clone());
            } else if name == "CONTENT_TYPE" || name == "CONTENT_LENGTH" {
                headers.insert(header_key(name), value.clone());
            }
        }
        HeaderMap { headers }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(&header_key(name)).map(String::as_str)
    }

    /// Headers with lower-case, dash-separated names.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

/// Decoded form parameters; every name keeps its values in order.
///
/// Names and values are kept as the decoded bytes. The `&str` accessors
/// only see values that are valid UTF-8; the `_bytes` accessors see all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters {
    values: HashMap<Vec<u8>, Vec<Vec<u8>>>,
}

/// `+` becomes a space, `%XX` the byte XX; malformed escapes and every
/// other byte are kept as written.
fn form_decode(input: &[u8]) -> Vec<u8> {
    let spaced: Vec<u8> = input
        .iter()
        .map(|&b| if b == b'+' { b' ' } else { b })
        .collect();
    percent_decode(&spaced).collect()
}

impl Parameters {
    /// Decode `application/x-www-form-urlencoded` data.
    pub fn parse(input: &[u8]) -> Parameters {
        let mut values: HashMap<Vec<u8>, Vec<Vec<u8>>> = HashMap::new();
        for pair in input.split(|&b| b == b'&').filter(|p| !p.is_empty()) {
            let (name, value) = match pair.iter().position(|&b| b == b'=') {
                Some(eq) => (&pair[..eq], &pair[eq + 1..]),
                None => (pair, &[][..]),
            };
            values
                .entry(form_decode(name))
                .or_default()
                .push(form_decode(value));
        }
        Parameters { values }
    }

    /// First value of `name`, if it is valid UTF-8.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_bytes(name)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        self.get_all_bytes(name).first().map(Vec::as_slice)
    }

    /// Values of `name` that are valid UTF-8, in order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.get_all_bytes(name)
            .iter()
            .filter_map(|v| std::str::from_utf8(v).ok())
            .collect()
    }

    pub fn get_all_bytes(&self, name: &str) -> &[Vec<u8>] {
        self.values
            .get(name.as_bytes())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn names(&self) -> impl Iterator<Item = &[u8]> {
        self.values.keys().map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[Vec<u8>])> {
        self.values
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// First `/`-delimited segment of a path; leading slashes are skipped.
pub fn path_prefix(path: &str) -> &str {
    let trimmed = path.trim_start_matches('/');
    match trimmed.find('/') {
        Some(end) => &trimmed[..end],
        None => trimmed,
    }
}

fn request_path(params: &CgiParams) -> String {
    if let Some(uri) = params.get("REQUEST_URI").filter(|u| !u.is_empty()) {
        let path = uri.split_once('?').map_or(uri.as_str(), |(p, _)| p);
        return path.to_string();
    }
    let script = params.get("SCRIPT_NAME").map_or("", String::as_str);
    let info = params.get("PATH_INFO").map_or("", String::as_str);
    if !script.is_empty() || !info.is_empty() {
        return format!("{}{}", script, info);
    }
    match params.get("DOCUMENT_URI").filter(|u| !u.is_empty()) {
        Some(uri) => uri.clone(),
        None => "/".to_string(),
    }
}

fn query_string(params: &CgiParams) -> String {
    if let Some(query) = params.get("QUERY_STRING") {
        return query.clone();
    }
    params
        .get("REQUEST_URI")
        .and_then(|uri| uri.split_once('?'))
        .map(|(_, q)| q.to_string())
        .unwrap_or_default()
}

/// Response state of one request.
struct Response {
    sink: Box<dyn ResponseSink>,
    status: u16,
    headers: Vec<(String, String)>,
    buffer: BytesMut,
    committed: bool,
    broken: bool,
    finished: bool,
}

impl Response {
    fn head(&self) -> Vec<u8> {
        let reason = StatusCode::from_u16(self.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown");
        let mut head = format!("Status: {} {}\r\n", self.status, reason);
        if !self
            .headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case("Content-Type"))
        {
            head.push_str(&format!("Content-Type: {}\r\n", DEFAULT_CONTENT_TYPE));
        }
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");
        head.into_bytes()
    }

    fn check(&self) -> io::Result<()> {
        if self.broken {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "response abandoned after a transport failure",
            ));
        }
        if self.finished {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "response already finished",
            ));
        }
        Ok(())
    }

    fn mark(&mut self, result: io::Result<()>) -> io::Result<()> {
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    /// Send the head (once) and everything buffered.
    async fn push(&mut self) -> io::Result<()> {
        self.check()?;
        let out = if self.committed {
            if self.buffer.is_empty() {
                return Ok(());
            }
            self.buffer.split().freeze()
        } else {
            self.committed = true;
            let mut out = BytesMut::from(&self.head()[..]);
            out.extend_from_slice(&self.buffer);
            self.buffer.clear();
            out.freeze()
        };
        let result = self.sink.write(&out).await;
        self.mark(result)
    }
}

/// One inbound request and its response.
///
/// Owned by exactly one worker for the lifetime of the request. Form
/// parameters are decoded on first use and cached.
pub struct RequestContext {
    request_id: u64,
    method: String,
    path: String,
    query_string: String,
    content_length: usize,
    params: CgiParams,
    headers: HeaderMap,
    body: BodyReader,
    body_bytes: Option<Bytes>,
    parameters: Option<Parameters>,
    response: Response,
}

impl RequestContext {
    pub fn new(request_id: u64, exchange: Exchange) -> RequestContext {
        let Exchange { params, body, sink } = exchange;
        let method = params
            .get("REQUEST_METHOD")
            .map(|m| m.to_ascii_uppercase())
            .unwrap_or_default();
        let content_length = params
            .get("CONTENT_LENGTH")
            .and_then(|l| l.trim().parse().ok())
            .unwrap_or(0);
        RequestContext {
            request_id,
            path: request_path(&params),
            query_string: query_string(&params),
            headers: HeaderMap::from_cgi(&params),
            method,
            content_length,
            params,
            body,
            body_bytes: None,
            parameters: None,
            response: Response {
                sink,
                status: 200,
                headers: Vec::new(),
                buffer: BytesMut::new(),
                committed: false,
                broken: false,
                finished: false,
            },
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The routing key of this request.
    pub fn prefix(&self) -> &str {
        path_prefix(&self.path)
    }

    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Raw CGI meta-variable, e.g. `REMOTE_ADDR`.
    pub fn cgi_param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Read the request body, at most `content_length` bytes. The body
    /// is read once; later calls return the cached bytes.
    pub async fn read_body(&mut self) -> io::Result<Bytes> {
        if let Some(body) = &self.body_bytes {
            return Ok(body.clone());
        }
        let mut buf = Vec::with_capacity(self.content_length.min(64 * 1024));
        (&mut self.body)
            .take(self.content_length as u64)
            .read_to_end(&mut buf)
            .await?;
        let body = Bytes::from(buf);
        self.body_bytes = Some(body.clone());
        Ok(body)
    }

    /// Decoded form parameters: the body for POST, the query string for
    /// GET, nothing for other methods.
    pub async fn parameters(&mut self) -> &Parameters {
        if self.parameters.is_none() {
            let method = self.method.clone();
            let parameters = match method.as_str() {
                "GET" => Parameters::parse(self.query_string.as_bytes()),
                "POST" => match self.read_body().await {
                    Ok(body) => Parameters::parse(&body),
                    Err(e) => {
                        warn!(request_id = self.request_id, error = %e, "failed to read request body");
                        Parameters::default()
                    }
                },
                _ => Parameters::default(),
            };
            self.parameters = Some(parameters);
        }
        self.parameters.get_or_insert_with(Parameters::default)
    }

    pub async fn query_parameter(&mut self, name: &str) -> Option<&str> {
        self.parameters().await.get(name)
    }

    pub async fn get_query_parameters(&mut self, name: &str) -> Vec<&str> {
        self.parameters().await.get_all(name)
    }

    pub fn set_status(&mut self, status: u16) {
        if !self.response.committed {
            self.response.status = status;
        }
    }

    pub fn status(&self) -> u16 {
        self.response.status
    }

    /// Add a response header. Ignored once the head has been sent.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if self.response.committed {
            return;
        }
        self.response
            .headers
            .retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.response
            .headers
            .push((name.to_string(), value.to_string()));
    }

    /// True once the status and headers have been sent.
    pub fn is_committed(&self) -> bool {
        self.response.committed
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.response.check()?;
        self.response.buffer.extend_from_slice(data);
        if self.response.buffer.len() >= OUTPUT_BUFFER {
            self.response.push().await?;
        }
        Ok(())
    }

    /// Formatted output: `ctx.write_str(&format!(...))`.
    pub async fn write_str(&mut self, text: &str) -> io::Result<()> {
        self.write(text.as_bytes()).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.response.push().await?;
        let result = self.response.sink.flush().await;
        self.response.mark(result)
    }

    pub(crate) async fn write_stderr(&mut self, text: &str) -> io::Result<()> {
        self.response.check()?;
        let result = self.response.sink.write_stderr(text.as_bytes()).await;
        self.response.mark(result)
    }

    /// Send whatever is left and end the response.
    pub(crate) async fn finish(&mut self, app_status: u32) -> io::Result<()> {
        self.response.push().await?;
        self.response.finished = true;
        let result = self.response.sink.finish(app_status).await;
        self.response.mark(result)
    }

    /// Replace whatever was buffered by a fixed plain-text response.
    /// Fails when the head has already gone out.
    pub(crate) async fn send_fixed(&mut self, status: u16, body: &str) -> io::Result<()> {
        if self.response.committed {
            return Err(io::Error::other("response already committed"));
        }
        self.response.buffer.clear();
        self.response.headers.clear();
        self.response.status = status;
        self.set_header("Content-Type", DEFAULT_CONTENT_TYPE);
        self.write_str(body).await?;
        self.finish(0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{channel, MemoryRequest};
    use crate::transport::Listen;

    async fn context(request: MemoryRequest) -> RequestContext {
        let (client, listener) = channel(1);
        let mut transport = listener.listen().await.unwrap();
        tokio::spawn(async move {
            let _ = client.send(request).await;
        });
        let exchange = transport.accept().await.unwrap();
        RequestContext::new(1, exchange)
    }

    #[test]
    fn prefix_is_first_segment() {
        assert_eq!(path_prefix("/hello/world"), "hello");
        assert_eq!(path_prefix("/hello"), "hello");
        assert_eq!(path_prefix("hello/x"), "hello");
        assert_eq!(path_prefix("//hello/x"), "hello");
        assert_eq!(path_prefix("/"), "");
        assert_eq!(path_prefix(""), "");
    }

    #[test]
    fn form_decoding() {
        let params = Parameters::parse(b"a=1&b=two+words&c=%2Fx&d=%2B");
        assert_eq!(params.get_all("a"), vec!["1"]);
        assert_eq!(params.get_all("b"), vec!["two words"]);
        assert_eq!(params.get_all("c"), vec!["/x"]);
        assert_eq!(params.get("d"), Some("+"));
        assert_eq!(params.len(), 4);

        let params = Parameters::parse(b"x=1&x=2&flag&&e=");
        assert_eq!(params.get_all("x"), vec!["1", "2"]);
        assert_eq!(params.get("x"), Some("1"));
        assert_eq!(params.get("flag"), Some(""));
        assert_eq!(params.get("e"), Some(""));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn malformed_escapes_pass_through() {
        let params = Parameters::parse(b"p=100%&q=%zz&r=%4");
        assert_eq!(params.get("p"), Some("100%"));
        assert_eq!(params.get("q"), Some("%zz"));
        assert_eq!(params.get("r"), Some("%4"));
        let params = Parameters::parse(b"s=%2f%2F");
        assert_eq!(params.get("s"), Some("//"));
    }

    #[test]
    fn non_utf8_bytes_are_kept() {
        let params = Parameters::parse(b"k=%FF&raw=\xe9t\xe9&ok=caf%C3%A9&%FE=1");
        assert_eq!(params.get_bytes("k"), Some(&[0xff][..]));
        assert_eq!(params.get_bytes("raw"), Some(&b"\xe9t\xe9"[..]));
        // not valid UTF-8, so invisible to the text accessors
        assert_eq!(params.get("k"), None);
        assert!(params.get_all("raw").is_empty());
        assert_eq!(params.get_all_bytes("raw").len(), 1);
        assert_eq!(params.get("ok"), Some("caf\u{e9}"));
        assert!(params.names().any(|n| n == [0xfe]));
    }

    #[test]
    fn path_from_cgi_params() {
        let mut params = CgiParams::new();
        params.insert("SCRIPT_NAME".into(), "/app".into());
        params.insert("PATH_INFO".into(), "/x".into());
        assert_eq!(request_path(&params), "/app/x");
        params.insert("REQUEST_URI".into(), "/hello/y?z=1".into());
        assert_eq!(request_path(&params), "/hello/y");
        assert_eq!(query_string(&params), "z=1");
        assert_eq!(request_path(&CgiParams::new()), "/");
    }

    #[tokio::test]
    async fn get_parameters_come_from_query_string() {
        let mut ctx = context(MemoryRequest::get("/p?x=1&x=2&y=%41")).await;
        assert_eq!(ctx.prefix(), "p");
        assert_eq!(ctx.get_query_parameters("x").await, &["1", "2"]);
        assert_eq!(ctx.query_parameter("y").await, Some("A"));
        assert_eq!(ctx.query_parameter("z").await, None);
    }

    #[tokio::test]
    async fn post_parameters_come_from_body() {
        let mut ctx = context(MemoryRequest::post_form(
            "/p?ignored=1",
            "a=1&b=two+words&c=%2Fx",
        ))
        .await;
        assert_eq!(ctx.content_length(), 22);
        assert_eq!(ctx.query_parameter("a").await, Some("1"));
        assert_eq!(ctx.query_parameter("b").await, Some("two words"));
        assert_eq!(ctx.query_parameter("c").await, Some("/x"));
        assert_eq!(ctx.query_parameter("ignored").await, None);
        // body was consumed once and cached
        assert_eq!(&ctx.read_body().await.unwrap()[..], b"a=1&b=two+words&c=%2Fx");
    }

    #[tokio::test]
    async fn other_methods_have_no_parameters() {
        let mut ctx = context(MemoryRequest::new("PUT", "/p?x=1").body(b"y=2".to_vec())).await;
        assert!(ctx.parameters().await.is_empty());
    }

    #[tokio::test]
    async fn headers_ignore_case() {
        let ctx = context(
            MemoryRequest::get("/p")
                .header("X-Request-Tag", "abc")
                .header("Content-Type", "text/plain"),
        )
        .await;
        assert_eq!(ctx.get_header("x-request-tag"), Some("abc"));
        assert_eq!(ctx.get_header("X_REQUEST_TAG"), Some("abc"));
        assert_eq!(ctx.get_header("content-type"), Some("text/plain"));
        assert_eq!(ctx.get_header("missing"), None);
    }

    #[tokio::test]
    async fn writes_after_a_transport_failure_fail() {
        let mut ctx = context(MemoryRequest::get("/p").broken_pipe()).await;
        ctx.write_str("hello").await.unwrap();
        assert!(ctx.flush().await.is_err());
        assert!(ctx.write_str("more").await.is_err());
    }
}
