//! Protocol client for the command center and stream server.
//!
//! The protocol is a strict state machine: *Idle → Assigned → Streaming →
//! Stopped*. Each state is its own type, so an out-of-order operation is a
//! compile error rather than a runtime check:
//!
//! - [`CoreClient::assign`] consumes nothing and yields an
//!   [`AssignedCore`] bound to the stream server the command center chose.
//! - [`AssignedCore::start_stream`] consumes the assignment and yields a
//!   [`StreamSession`] plus the downloaded [`StreamData`].
//! - [`StreamSession::stop`] consumes the session; the transport is
//!   released unconditionally.
//!
//! Wire contract: all bodies are JSON; every PUT/POST carries
//! `Content-MD5`; files travel in the suffix envelope described in
//! [`crate::codec`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::{b64_encode, decode_file, encode_file};
use crate::error::WorkerError;
use crate::transport::{ProxyConfig, Reply, ServerAddr, Transport};
use crate::trust::TrustStore;

/// Decoded files keyed by logical filename. Ordered so that serialized
/// bodies (and their digests) are deterministic.
pub type FileMap = BTreeMap<String, Vec<u8>>;

/// Assignment request sent to the command center.
#[derive(Debug, Serialize)]
struct AssignRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    donor_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_id: Option<&'a str>,
    engine: &'a str,
}

/// Assignment reply: where to stream, and the token that authorizes it.
#[derive(Debug, Deserialize)]
struct AssignReply {
    url: String,
    token: String,
}

/// Reply to `GET /core/start`, before file decoding.
#[derive(Debug, Deserialize)]
struct StartReply {
    stream_id: String,
    target_id: String,
    files: BTreeMap<String, String>,
    options: serde_json::Value,
}

/// Outbound frame payload.
#[derive(Debug, Serialize)]
struct FramePayload {
    frames: u32,
    files: BTreeMap<String, String>,
}

/// Outbound checkpoint payload. `frames` is the fractional frame count
/// accrued since the previous checkpoint.
#[derive(Debug, Serialize)]
struct CheckpointPayload {
    frames: f64,
    files: BTreeMap<String, String>,
}

/// Outbound stop payload.
#[derive(Debug, Serialize)]
struct StopPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Everything the stream server handed over at start time.
#[derive(Debug)]
pub struct StreamData {
    /// Opaque stream identifier.
    pub stream_id: String,
    /// The job family this stream was drawn from.
    pub target_id: String,
    /// Downloaded files, suffix envelopes already stripped.
    pub files: FileMap,
    /// Stream options; at minimum carries `steps_per_frame`.
    pub options: serde_json::Value,
}

impl StreamData {
    /// Reads `steps_per_frame` from the options, rounded to the nearest
    /// integer.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::StartFailed`] if the option is absent or
    /// not a positive number.
    pub fn steps_per_frame(&self) -> Result<u64, WorkerError> {
        let raw = self
            .options
            .get("steps_per_frame")
            .and_then(serde_json::Value::as_f64)
            .ok_or_else(|| {
                WorkerError::StartFailed("options are missing steps_per_frame".to_string())
            })?;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let rounded = (raw + 0.5).floor() as u64;
        if rounded == 0 {
            return Err(WorkerError::StartFailed(format!(
                "steps_per_frame {raw} rounds to zero"
            )));
        }
        Ok(rounded)
    }
}

/// Sink the driver writes stream submissions to.
///
/// [`StreamSession`] is the production implementation; tests substitute a
/// recorder. `stop` consumes the sink because nothing may follow it on the
/// session.
pub trait StreamSink: Sized {
    /// Submits frame files; `frame_count` unit frames are represented.
    fn send_frame(
        &mut self,
        files: &FileMap,
        frame_count: u32,
        gzip: bool,
    ) -> Result<(), WorkerError>;

    /// Submits checkpoint files with the fractional frame count accrued
    /// since the previous checkpoint.
    fn send_checkpoint(
        &mut self,
        files: &FileMap,
        frames: f64,
        gzip: bool,
    ) -> Result<(), WorkerError>;

    /// Sends a liveness ping.
    fn send_heartbeat(&mut self) -> Result<(), WorkerError>;

    /// Disengages from the stream, reporting `error` if present. Always
    /// the last request on the session.
    fn stop(self, error: Option<&str>) -> Result<(), WorkerError>;
}

/// The idle protocol client: knows how to request an assignment.
#[derive(Debug)]
pub struct CoreClient {
    core_key: String,
    engine_name: String,
    trust: TrustStore,
    proxy: Option<ProxyConfig>,
}

impl CoreClient {
    /// Creates a client that authenticates to the command center with
    /// `core_key` and advertises `engine_name`.
    #[must_use]
    pub fn new(
        core_key: impl Into<String>,
        engine_name: impl Into<String>,
        trust: TrustStore,
        proxy: Option<ProxyConfig>,
    ) -> Self {
        Self {
            core_key: core_key.into(),
            engine_name: engine_name.into(),
            trust,
            proxy,
        }
    }

    /// Requests a work assignment from the command center.
    ///
    /// On success the returned [`AssignedCore`] holds a fresh session
    /// against the stream server the command center chose.
    ///
    /// # Errors
    ///
    /// - [`WorkerError::BadRequest`] on HTTP 400, carrying the body text.
    /// - [`WorkerError::CoreOutdated`] on HTTP 401.
    /// - [`WorkerError::Network`] on any other non-200 status or
    ///   connection failure.
    pub fn assign(
        &self,
        cc: &ServerAddr,
        donor_token: Option<&str>,
        target_id: Option<&str>,
    ) -> Result<AssignedCore, WorkerError> {
        info!(cc = %cc.base_url(), "requesting assignment");
        let transport = Transport::connect(cc, &self.trust, self.proxy.as_ref(), &self.core_key)?;
        let request = AssignRequest {
            donor_token,
            target_id,
            engine: &self.engine_name,
        };
        let body = serde_json::to_vec(&request)?;
        let reply = transport.post("/core/assign", body)?;
        match reply.status {
            200 => {},
            400 => return Err(WorkerError::BadRequest(reply.body_text())),
            401 => return Err(WorkerError::CoreOutdated),
            status => {
                return Err(WorkerError::Network(format!(
                    "assignment returned status {status}"
                )));
            },
        }
        let assign: AssignReply = serde_json::from_slice(&reply.body)?;
        let scv = ServerAddr::parse(&assign.url)?;
        debug!(scv = %scv.base_url(), "assigned to stream server");
        let session = Transport::connect(&scv, &self.trust, self.proxy.as_ref(), &assign.token)?;
        Ok(AssignedCore {
            transport: session,
            target_constraint: target_id.map(str::to_owned),
        })
    }
}

/// An assignment in hand: the session is bound to the stream server but
/// the stream has not started.
#[derive(Debug)]
pub struct AssignedCore {
    transport: Transport,
    target_constraint: Option<String>,
}

impl AssignedCore {
    /// Starts the assigned stream and downloads its files.
    ///
    /// The reply's `Content-MD5` (when present) is verified against the
    /// raw body before parsing. Every file is unwrapped through the
    /// suffix envelope. If the caller constrained the assignment to a
    /// target and the stream server returned a different one, a
    /// best-effort stop with an error body is issued and
    /// [`WorkerError::TargetMismatch`] is returned.
    ///
    /// # Errors
    ///
    /// [`WorkerError::StartFailed`] on any non-200 reply; decoding
    /// failures surface as [`WorkerError::MalformedEncoding`].
    pub fn start_stream(self) -> Result<(StreamSession, StreamData), WorkerError> {
        let reply = self.transport.get("/core/start")?;
        if reply.status != 200 {
            return Err(WorkerError::StartFailed(format!(
                "stream server returned status {}",
                reply.status
            )));
        }
        let start: StartReply = serde_json::from_slice(&reply.body)?;
        let mut session = StreamSession {
            transport: self.transport,
            stream_id: start.stream_id.clone(),
        };
        if let Some(requested) = self.target_constraint {
            if requested != start.target_id {
                let err = WorkerError::TargetMismatch {
                    requested,
                    assigned: start.target_id,
                };
                session.abandon(&err.to_string());
                return Err(err);
            }
        }
        let mut files = FileMap::new();
        match decode_files(start.files) {
            Ok(decoded) => files.extend(decoded),
            Err(err) => {
                session.abandon(&err.to_string());
                return Err(err);
            },
        }
        info!(
            stream_id = %start.stream_id,
            target_id = %start.target_id,
            files = files.len(),
            "stream started"
        );
        let data = StreamData {
            stream_id: start.stream_id,
            target_id: start.target_id,
            files,
            options: start.options,
        };
        Ok((session, data))
    }
}

fn decode_files(wire: BTreeMap<String, String>) -> Result<FileMap, WorkerError> {
    let mut files = FileMap::new();
    for (name, text) in wire {
        let (logical, data) = decode_file(&name, text.as_bytes())?;
        files.insert(logical, data);
    }
    Ok(files)
}

fn encode_files(files: &FileMap, gzip: bool) -> BTreeMap<String, String> {
    files
        .iter()
        .map(|(name, data)| encode_file(name, data, gzip))
        .collect()
}

/// An active stream: frames, checkpoints, and heartbeats may be sent.
#[derive(Debug)]
pub struct StreamSession {
    transport: Transport,
    stream_id: String,
}

impl StreamSession {
    /// The identifier of the stream this session is bound to.
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn submit(&self, path: &str, body: Vec<u8>, what: &str) -> Result<(), WorkerError> {
        let reply = self.transport.put(path, body)?;
        expect_ok(&reply, what)
    }

    /// Best-effort stop used when startup fails after the session was
    /// established; the original error is the one worth reporting.
    fn abandon(&mut self, error: &str) {
        let payload = StopPayload {
            error: Some(b64_encode(error.as_bytes())),
        };
        match serde_json::to_vec(&payload) {
            Ok(body) => {
                if let Err(stop_err) = self.submit("/core/stop", body, "stop") {
                    warn!(error = %stop_err, "could not report startup failure to stream server");
                }
            },
            Err(stop_err) => {
                warn!(error = %stop_err, "could not serialize stop payload");
            },
        }
    }
}

fn expect_ok(reply: &Reply, what: &str) -> Result<(), WorkerError> {
    if reply.status == 200 {
        Ok(())
    } else {
        Err(WorkerError::SubmitFailed(format!(
            "{what} returned status {}",
            reply.status
        )))
    }
}

impl StreamSink for StreamSession {
    fn send_frame(
        &mut self,
        files: &FileMap,
        frame_count: u32,
        gzip: bool,
    ) -> Result<(), WorkerError> {
        let payload = FramePayload {
            frames: frame_count,
            files: encode_files(files, gzip),
        };
        let body = serde_json::to_vec(&payload)?;
        self.submit("/core/frame", body, "frame")
    }

    fn send_checkpoint(
        &mut self,
        files: &FileMap,
        frames: f64,
        gzip: bool,
    ) -> Result<(), WorkerError> {
        let payload = CheckpointPayload {
            frames,
            files: encode_files(files, gzip),
        };
        let body = serde_json::to_vec(&payload)?;
        self.submit("/core/checkpoint", body, "checkpoint")
    }

    fn send_heartbeat(&mut self) -> Result<(), WorkerError> {
        let reply = self.transport.post("/core/heartbeat", b"{}".to_vec())?;
        expect_ok(&reply, "heartbeat")
    }

    fn stop(self, error: Option<&str>) -> Result<(), WorkerError> {
        if let Some(text) = error {
            info!(stream_id = %self.stream_id, error = %text, "stopping stream with error");
        } else {
            info!(stream_id = %self.stream_id, "stopping stream");
        }
        let payload = StopPayload {
            error: error.map(|text| b64_encode(text.as_bytes())),
        };
        let body = serde_json::to_vec(&payload)?;
        // The session is consumed regardless of the reply; the transport
        // is released when `self` drops.
        self.submit("/core/stop", body, "stop")
    }
}
