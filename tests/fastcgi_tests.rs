//! Drives a running service through a real FastCGI connection.

use std::collections::HashMap;

use servlet_cgi::fast_cgi::defs;
use servlet_cgi::fast_cgi::transport::FcgiListener;
use servlet_cgi::servlets::{builtin_factories, default_routes};
use servlet_cgi::transport::ListenAddress;
use servlet_cgi::{Service, ServiceSettings};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn record(rec_type: u8, request_id: u16, content: &[u8]) -> Vec<u8> {
    let padding = (8 - content.len() % 8) % 8;
    let mut out = vec![
        defs::FCGI_VERSION_1,
        rec_type,
        (request_id >> 8) as u8,
        request_id as u8,
        (content.len() >> 8) as u8,
        content.len() as u8,
        padding as u8,
        0,
    ];
    out.extend_from_slice(content);
    out.extend(std::iter::repeat(0).take(padding));
    out
}

fn pairs(values: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in values {
        out.push(name.len() as u8);
        out.push(value.len() as u8);
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(value.as_bytes());
    }
    out
}

fn begin_request(request_id: u16, role: u16) -> Vec<u8> {
    record(
        defs::FCGI_BEGIN_REQUEST,
        request_id,
        &[(role >> 8) as u8, role as u8, 0, 0, 0, 0, 0, 0],
    )
}

fn request(method: &str, uri: &str, body: &[u8]) -> Vec<u8> {
    let (path, query) = uri.split_once('?').unwrap_or((uri, ""));
    let length = body.len().to_string();
    let mut out = begin_request(1, defs::FCGI_RESPONDER);
    out.extend(record(
        defs::FCGI_PARAMS,
        1,
        &pairs(&[
            ("REQUEST_METHOD", method),
            ("REQUEST_URI", uri),
            ("DOCUMENT_URI", path),
            ("QUERY_STRING", query),
            ("CONTENT_LENGTH", length.as_str()),
            ("CONTENT_TYPE", "application/x-www-form-urlencoded"),
        ]),
    ));
    out.extend(record(defs::FCGI_PARAMS, 1, &[]));
    if !body.is_empty() {
        out.extend(record(defs::FCGI_STDIN, 1, body));
    }
    out.extend(record(defs::FCGI_STDIN, 1, &[]));
    out
}

struct Frame {
    rec_type: u8,
    request_id: u16,
    content: Vec<u8>,
}

fn frames(mut data: &[u8]) -> Vec<Frame> {
    let mut out = Vec::new();
    while data.len() >= 8 {
        let len = u16::from_be_bytes([data[4], data[5]]) as usize;
        let padding = data[6] as usize;
        out.push(Frame {
            rec_type: data[1],
            request_id: u16::from_be_bytes([data[2], data[3]]),
            content: data[8..8 + len].to_vec(),
        });
        data = &data[8 + len + padding..];
    }
    assert!(data.is_empty(), "trailing bytes after last record");
    out
}

async fn read_frame(stream: &mut TcpStream) -> Frame {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await.unwrap();
    let len = u16::from_be_bytes([header[4], header[5]]) as usize;
    let mut content = vec![0u8; len + header[6] as usize];
    stream.read_exact(&mut content).await.unwrap();
    content.truncate(len);
    Frame {
        rec_type: header[1],
        request_id: u16::from_be_bytes([header[2], header[3]]),
        content,
    }
}

async fn start_service() -> (Service, String) {
    let listener = FcgiListener {
        address: ListenAddress::Tcp("127.0.0.1:0".to_string()),
        backlog: 16,
        max_connections: 8,
    };
    let mut service = Service::new(
        ServiceSettings::default(),
        builtin_factories().unwrap(),
        default_routes(),
        Box::new(listener),
    );
    service.start().await.unwrap();
    let addr = service.local_addr().unwrap().to_string();
    (service, addr)
}

/// Send one request and collect STDOUT and the END_REQUEST body.
async fn exchange(addr: &str, request: &[u8]) -> (String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let mut stdout = Vec::new();
    let mut end = Vec::new();
    for frame in frames(&raw) {
        assert_eq!(frame.request_id, 1);
        match frame.rec_type {
            defs::FCGI_STDOUT => stdout.extend(frame.content),
            defs::FCGI_END_REQUEST => end = frame.content,
            _ => {}
        }
    }
    (String::from_utf8(stdout).unwrap(), end)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hello_over_tcp() {
    let (mut service, addr) = start_service().await;

    let (stdout, end) = exchange(&addr, &request("GET", "/hello?name=world", b"")).await;
    assert!(stdout.starts_with("Status: 200 OK\r\n"), "{}", stdout);
    assert!(stdout.contains("Content-Type: text/plain; charset=utf-8\r\n"));
    assert!(stdout.ends_with("\r\n\r\nHello"), "{}", stdout);
    // app status 0, FCGI_REQUEST_COMPLETE
    assert_eq!(end, vec![0, 0, 0, 0, defs::FCGI_REQUEST_COMPLETE, 0, 0, 0]);

    let (stdout, _) = exchange(&addr, &request("GET", "/nowhere", b"")).await;
    assert!(stdout.starts_with("Status: 404 Not Found\r\n"), "{}", stdout);

    service.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_body_over_tcp() {
    let (mut service, addr) = start_service().await;

    let (stdout, _) = exchange(&addr, &request("POST", "/echo", b"a=1&b=two+words&c=%2Fx")).await;
    let (_, body) = stdout.split_once("\r\n\r\n").unwrap();
    let body: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(body["method"], "POST");
    assert_eq!(body["headers"]["content-type"], "application/x-www-form-urlencoded");
    assert_eq!(
        body["parameters"],
        serde_json::json!({"a": ["1"], "b": ["two words"], "c": ["/x"]})
    );

    service.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn management_and_role_records() {
    let (mut service, addr) = start_service().await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();

    let query = pairs(&[
        (defs::FCGI_MAX_CONNS, ""),
        (defs::FCGI_MPXS_CONNS, ""),
        ("UNKNOWN_VARIABLE", ""),
    ]);
    stream
        .write_all(&record(defs::FCGI_GET_VALUES, 0, &query))
        .await
        .unwrap();
    let reply = read_frame(&mut stream).await;
    assert_eq!(reply.rec_type, defs::FCGI_GET_VALUES_RESULT);
    assert_eq!(reply.request_id, 0);
    let mut values = HashMap::new();
    let mut rest = &reply.content[..];
    while !rest.is_empty() {
        let (n, v) = (rest[0] as usize, rest[1] as usize);
        let name = String::from_utf8(rest[2..2 + n].to_vec()).unwrap();
        let value = String::from_utf8(rest[2 + n..2 + n + v].to_vec()).unwrap();
        values.insert(name, value);
        rest = &rest[2 + n + v..];
    }
    assert_eq!(values.len(), 2);
    assert_eq!(values[defs::FCGI_MAX_CONNS], "8");
    assert_eq!(values[defs::FCGI_MPXS_CONNS], "0");

    // unknown management record type
    stream.write_all(&record(42, 0, &[])).await.unwrap();
    let reply = read_frame(&mut stream).await;
    assert_eq!(reply.rec_type, defs::FCGI_UNKNOWN_TYPE);
    assert_eq!(reply.content[0], 42);

    // authorizer role is not served
    stream.write_all(&begin_request(3, 2)).await.unwrap();
    let reply = read_frame(&mut stream).await;
    assert_eq!(reply.rec_type, defs::FCGI_END_REQUEST);
    assert_eq!(reply.request_id, 3);
    assert_eq!(reply.content[4], defs::FCGI_UNKNOWN_ROLE);

    // the connection still serves a responder request afterwards
    stream.write_all(&request("GET", "/hello", b"")).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let stdout: Vec<u8> = frames(&raw)
        .into_iter()
        .filter(|f| f.rec_type == defs::FCGI_STDOUT)
        .flat_map(|f| f.content)
        .collect();
    assert!(String::from_utf8_lossy(&stdout).ends_with("Hello"));

    service.stop().await;
}
