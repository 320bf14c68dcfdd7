//! End-to-end protocol tests against in-process mock servers.
//!
//! A minimal HTTP responder runs on a `TcpListener` thread and records
//! every request it sees, standing in for the command center and the
//! stream server.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread;

use gridcore_core::codec::{b64_decode, encode_file, md5_hex};
use gridcore_core::error::WorkerError;
use gridcore_core::protocol::{CoreClient, FileMap, StreamSink};
use gridcore_core::transport::ServerAddr;
use gridcore_core::trust::TrustStore;

/// One request as seen by a mock server.
#[derive(Debug, Clone)]
struct SeenRequest {
    method: String,
    path: String,
    authorization: Option<String>,
    content_md5: Option<String>,
    body: Vec<u8>,
}

impl SeenRequest {
    fn body_json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("request body is JSON")
    }
}

/// A canned reply the mock returns for one request.
#[derive(Debug, Clone)]
struct CannedReply {
    status: u16,
    body: Vec<u8>,
    with_md5: bool,
    /// When set, this digest is sent instead of the true one.
    forged_md5: Option<String>,
}

impl CannedReply {
    fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            body: serde_json::to_vec(value).unwrap(),
            with_md5: true,
            forged_md5: None,
        }
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            body: b"{}".to_vec(),
            with_md5: false,
            forged_md5: None,
        }
    }
}

/// Serves `replies` in order, one connection per request, recording what
/// it saw. Returns the base URL and the channel of recorded requests.
fn spawn_mock_server(replies: Vec<CannedReply>) -> (String, Receiver<SeenRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
    let address = listener.local_addr().unwrap();
    let (sender, receiver): (Sender<SeenRequest>, Receiver<SeenRequest>) = channel();
    thread::spawn(move || {
        for reply in replies {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            if handle_connection(stream, &reply, &sender).is_err() {
                return;
            }
        }
    });
    (format!("http://{address}"), receiver)
}

fn handle_connection(
    stream: TcpStream,
    reply: &CannedReply,
    sender: &Sender<SeenRequest>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut content_length = 0usize;
    let mut authorization = None;
    let mut content_md5 = None;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim().to_string();
            match name.to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.parse().unwrap_or(0),
                "authorization" => authorization = Some(value),
                "content-md5" => content_md5 = Some(value),
                _ => {},
            }
        }
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;
    let _ = sender.send(SeenRequest {
        method,
        path,
        authorization,
        content_md5,
        body,
    });

    let digest = reply
        .forged_md5
        .clone()
        .unwrap_or_else(|| md5_hex(&reply.body));
    let mut response = format!(
        "HTTP/1.1 {} {}\r\ncontent-length: {}\r\nconnection: close\r\n",
        reply.status,
        reason(reply.status),
        reply.body.len(),
    );
    if reply.with_md5 || reply.forged_md5.is_some() {
        response.push_str(&format!("content-md5: {digest}\r\n"));
    }
    response.push_str("\r\n");

    let mut stream = reader.into_inner();
    stream.write_all(response.as_bytes())?;
    stream.write_all(&reply.body)?;
    stream.flush()
}

const fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        _ => "Error",
    }
}

fn start_reply_body(target_id: &str, scv_files: &FileMap) -> serde_json::Value {
    let mut wire_files = BTreeMap::new();
    for (name, data) in scv_files {
        let (wire_name, text) = encode_file(name, data, true);
        wire_files.insert(wire_name, text);
    }
    serde_json::json!({
        "stream_id": "stream-0001",
        "target_id": target_id,
        "files": wire_files,
        "options": { "steps_per_frame": 500 },
    })
}

fn client() -> CoreClient {
    CoreClient::new("core-key-secret", "gridcore-md", TrustStore::bundled(), None)
}

fn drain(receiver: &Receiver<SeenRequest>) -> Vec<SeenRequest> {
    receiver.try_iter().collect()
}

#[test]
fn full_stream_lifecycle_in_request_order() {
    let target_id = "t".repeat(36);
    let mut files = FileMap::new();
    files.insert("system.json".to_string(), b"{\"particles\":[]}".to_vec());
    files.insert("partial_steps".to_string(), b"37".to_vec());

    // SCV serves start, frame, checkpoint, heartbeat, stop.
    let (scv_url, scv_seen) = spawn_mock_server(vec![
        CannedReply::json(200, &start_reply_body(&target_id, &files)),
        CannedReply::empty(200),
        CannedReply::empty(200),
        CannedReply::empty(200),
        CannedReply::empty(200),
    ]);
    let (cc_url, cc_seen) = spawn_mock_server(vec![CannedReply::json(
        200,
        &serde_json::json!({ "url": scv_url, "token": "stream-token" }),
    )]);

    let cc = ServerAddr::parse(&cc_url).unwrap();
    let assigned = client()
        .assign(&cc, Some(&"d".repeat(36)), Some(&target_id))
        .unwrap();
    let (mut session, data) = assigned.start_stream().unwrap();

    assert_eq!(data.stream_id, "stream-0001");
    assert_eq!(data.target_id, target_id);
    assert_eq!(data.steps_per_frame().unwrap(), 500);
    // Envelope suffixes are stripped and contents decoded.
    assert_eq!(data.files.get("partial_steps").unwrap(), b"37");
    assert_eq!(data.files.get("system.json").unwrap(), b"{\"particles\":[]}");

    let mut frame_files = FileMap::new();
    frame_files.insert("frames.trj".to_string(), vec![1, 2, 3, 4]);
    session.send_frame(&frame_files, 1, false).unwrap();

    let mut checkpoint_files = FileMap::new();
    checkpoint_files.insert("state.json".to_string(), b"{}".to_vec());
    checkpoint_files.insert("partial_steps".to_string(), b"37".to_vec());
    session.send_checkpoint(&checkpoint_files, 1.64, true).unwrap();

    session.send_heartbeat().unwrap();
    session.stop(None).unwrap();

    let cc_requests = drain(&cc_seen);
    assert_eq!(cc_requests.len(), 1);
    let assign = &cc_requests[0];
    assert_eq!(assign.method, "POST");
    assert_eq!(assign.path, "/core/assign");
    assert_eq!(assign.authorization.as_deref(), Some("core-key-secret"));
    assert_eq!(assign.content_md5.as_deref(), Some(md5_hex(&assign.body).as_str()));
    let assign_body = assign.body_json();
    assert_eq!(assign_body["engine"], "gridcore-md");
    assert_eq!(assign_body["target_id"], target_id);

    let scv_requests = drain(&scv_seen);
    let order: Vec<(&str, &str)> = scv_requests
        .iter()
        .map(|r| (r.method.as_str(), r.path.as_str()))
        .collect();
    assert_eq!(
        order,
        vec![
            ("GET", "/core/start"),
            ("PUT", "/core/frame"),
            ("PUT", "/core/checkpoint"),
            ("POST", "/core/heartbeat"),
            ("PUT", "/core/stop"),
        ]
    );
    // Every mutation authenticates with the stream token and digests its
    // exact body.
    for request in &scv_requests[1..] {
        assert_eq!(request.authorization.as_deref(), Some("stream-token"));
        assert_eq!(
            request.content_md5.as_deref(),
            Some(md5_hex(&request.body).as_str())
        );
    }

    let frame_body = scv_requests[1].body_json();
    assert_eq!(frame_body["frames"], 1);
    assert!(frame_body["files"]["frames.trj.b64"].is_string());

    let checkpoint_body = scv_requests[2].body_json();
    assert!((checkpoint_body["frames"].as_f64().unwrap() - 1.64).abs() < 1e-12);
    assert!(checkpoint_body["files"]["state.json.gz.b64"].is_string());

    let stop_body = scv_requests[4].body_json();
    assert!(stop_body.get("error").is_none());
}

#[test]
fn assign_401_is_core_outdated() {
    let (cc_url, _seen) = spawn_mock_server(vec![CannedReply::empty(401)]);
    let cc = ServerAddr::parse(&cc_url).unwrap();
    let err = client().assign(&cc, None, None).unwrap_err();
    assert!(matches!(err, WorkerError::CoreOutdated));
    assert_eq!(err.exit_code(), 0x110);
}

#[test]
fn assign_400_carries_body_text() {
    let (cc_url, _seen) = spawn_mock_server(vec![CannedReply {
        status: 400,
        body: b"no streams for engine".to_vec(),
        with_md5: false,
        forged_md5: None,
    }]);
    let cc = ServerAddr::parse(&cc_url).unwrap();
    let err = client().assign(&cc, None, None).unwrap_err();
    match err {
        WorkerError::BadRequest(text) => assert!(text.contains("no streams for engine")),
        other => panic!("expected BadRequest, got {other:?}"),
    }
}

#[test]
fn assign_5xx_is_transient() {
    let (cc_url, _seen) = spawn_mock_server(vec![CannedReply::empty(503)]);
    let cc = ServerAddr::parse(&cc_url).unwrap();
    let err = client().assign(&cc, None, None).unwrap_err();
    assert!(matches!(err, WorkerError::Network(_)));
}

#[test]
fn target_mismatch_stops_stream_with_error() {
    let requested = "a".repeat(36);
    let assigned_target = "b".repeat(36);
    let files = FileMap::new();
    let (scv_url, scv_seen) = spawn_mock_server(vec![
        CannedReply::json(200, &start_reply_body(&assigned_target, &files)),
        CannedReply::empty(200),
    ]);
    let (cc_url, _cc_seen) = spawn_mock_server(vec![CannedReply::json(
        200,
        &serde_json::json!({ "url": scv_url, "token": "stream-token" }),
    )]);

    let cc = ServerAddr::parse(&cc_url).unwrap();
    let assigned = client().assign(&cc, None, Some(&requested)).unwrap();
    let err = assigned.start_stream().unwrap_err();
    assert!(matches!(err, WorkerError::TargetMismatch { .. }));

    let scv_requests = drain(&scv_seen);
    let order: Vec<(&str, &str)> = scv_requests
        .iter()
        .map(|r| (r.method.as_str(), r.path.as_str()))
        .collect();
    // No frame was ever issued; the stop carries a nonempty error body.
    assert_eq!(order, vec![("GET", "/core/start"), ("PUT", "/core/stop")]);
    let stop_body = scv_requests[1].body_json();
    let error_b64 = stop_body["error"].as_str().expect("stop carries an error");
    let error_text = String::from_utf8(b64_decode(error_b64).unwrap()).unwrap();
    assert!(error_text.contains("target mismatch"));
}

#[test]
fn response_digest_mismatch_is_integrity_error() {
    let (cc_url, _seen) = spawn_mock_server(vec![CannedReply {
        status: 200,
        body: br#"{"url":"http://127.0.0.1:1","token":"t"}"#.to_vec(),
        with_md5: false,
        forged_md5: Some("00000000000000000000000000000000".to_string()),
    }]);
    let cc = ServerAddr::parse(&cc_url).unwrap();
    let err = client().assign(&cc, None, None).unwrap_err();
    assert!(matches!(err, WorkerError::Integrity(_)));
}

#[test]
fn stop_reports_error_as_base64() {
    let target_id = "t".repeat(36);
    let mut files = FileMap::new();
    files.insert("system.json".to_string(), b"{}".to_vec());
    let (scv_url, scv_seen) = spawn_mock_server(vec![
        CannedReply::json(200, &start_reply_body(&target_id, &files)),
        CannedReply::empty(200),
    ]);
    let (cc_url, _cc_seen) = spawn_mock_server(vec![CannedReply::json(
        200,
        &serde_json::json!({ "url": scv_url, "token": "stream-token" }),
    )]);

    let cc = ServerAddr::parse(&cc_url).unwrap();
    let assigned = client().assign(&cc, None, None).unwrap();
    let (session, _data) = assigned.start_stream().unwrap();
    session.stop(Some("simulation diverged")).unwrap();

    let scv_requests = drain(&scv_seen);
    let stop_body = scv_requests.last().unwrap().body_json();
    let error_b64 = stop_body["error"].as_str().unwrap();
    assert_eq!(b64_decode(error_b64).unwrap(), b"simulation diverged");
}
