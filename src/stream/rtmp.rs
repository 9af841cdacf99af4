//! # RTMP Publisher
//!
//! Minimal RTMP client that publishes one audio stream:
//!
//! 1. Plain (unsigned) handshake: C0/C1, S0/S1, C2, S2
//! 2. `SetChunkSize` to 4096 for everything we send afterwards
//! 3. `connect` → `_result`
//! 4. `releaseStream`, `FCPublish`, `createStream` → `_result(stream id)`
//! 5. `publish(key, "live")` → `onStatus(NetStream.Publish.Start)`
//!
//! After that only audio and `@setDataFrame` messages are written; inbound
//! data is not read again until the connection is closed.
//!
//! The chunk layer handles every header format (0-3), extended timestamps
//! and the protocol control messages a server sends during setup.

use crate::error::StreamError;
use crate::stream::amf::{decode_all, encode_all, Amf0Value};
use crate::stream::flv::{FlvTag, TAG_AUDIO, TAG_SCRIPT};
use crate::stream::output::TagSink;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

pub const DEFAULT_PORT: u16 = 1935;
pub const OUT_CHUNK_SIZE: usize = 4096;

const RTMP_VERSION: u8 = 3;
const HANDSHAKE_SIZE: usize = 1536;
const DEFAULT_CHUNK_SIZE: usize = 128;
const DEFAULT_WINDOW: u32 = 2_500_000;
const EXTENDED_TIMESTAMP: u32 = 0x00FF_FFFF;

const CSID_CONTROL: u8 = 2;
const CSID_COMMAND: u8 = 3;
const CSID_AUDIO: u8 = 4;
const CSID_DATA: u8 = 5;

pub const MSG_SET_CHUNK_SIZE: u8 = 1;
pub const MSG_ABORT: u8 = 2;
pub const MSG_ACK: u8 = 3;
pub const MSG_USER_CONTROL: u8 = 4;
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;
pub const MSG_AUDIO: u8 = 8;
pub const MSG_DATA_AMF0: u8 = 18;
pub const MSG_COMMAND_AMF0: u8 = 20;

const USER_CONTROL_PING_REQUEST: u16 = 6;
const USER_CONTROL_PING_RESPONSE: u16 = 7;

/// Where to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpTarget {
    pub host: String,
    pub port: u16,
    pub app: String,
    pub stream_key: String,
}

impl RtmpTarget {
    pub fn tc_url(&self) -> String {
        format!("rtmp://{}:{}/{}", self.host, self.port, self.app)
    }

    pub fn url(&self) -> String {
        format!("{}/{}", self.tc_url(), self.stream_key)
    }
}

/// One reassembled RTMP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpMessage {
    pub type_id: u8,
    pub stream_id: u32,
    pub timestamp: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct InboundChunk {
    timestamp: u32,
    delta: u32,
    length: usize,
    type_id: u8,
    stream_id: u32,
    extended: bool,
    payload: Vec<u8>,
}

/// Chunk-level reader/writer over a byte stream.
pub struct ChunkStream<S> {
    io: S,
    in_chunk_size: usize,
    out_chunk_size: usize,
    window_ack_size: u32,
    bytes_read: u64,
    last_ack: u64,
    inbound: HashMap<u32, InboundChunk>,
}

impl<S: Read + Write> ChunkStream<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            in_chunk_size: DEFAULT_CHUNK_SIZE,
            out_chunk_size: DEFAULT_CHUNK_SIZE,
            window_ack_size: DEFAULT_WINDOW,
            bytes_read: 0,
            last_ack: 0,
            inbound: HashMap::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }

    pub fn into_inner(self) -> S {
        self.io
    }

    pub fn set_out_chunk_size(&mut self, size: usize) {
        self.out_chunk_size = size.max(1);
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.io.read_exact(buf)?;
        self.bytes_read += buf.len() as u64;
        Ok(())
    }

    fn read_u8(&mut self) -> io::Result<u8> {
        let mut b = [0u8; 1];
        self.read_bytes(&mut b)?;
        Ok(b[0])
    }

    fn read_u24(&mut self) -> io::Result<u32> {
        let mut b = [0u8; 3];
        self.read_bytes(&mut b)?;
        Ok(u32::from(b[0]) << 16 | u32::from(b[1]) << 8 | u32::from(b[2]))
    }

    fn read_u32_be(&mut self) -> io::Result<u32> {
        let mut b = [0u8; 4];
        self.read_bytes(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    fn read_u32_le(&mut self) -> io::Result<u32> {
        let mut b = [0u8; 4];
        self.read_bytes(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Write one message as a format-0 chunk followed by format-3
    /// continuation chunks.
    pub fn write_message(
        &mut self,
        csid: u8,
        type_id: u8,
        stream_id: u32,
        timestamp: u32,
        payload: &[u8],
    ) -> io::Result<()> {
        let extended = timestamp >= EXTENDED_TIMESTAMP;
        let chunks = payload.len() / self.out_chunk_size + 1;
        let mut buf = Vec::with_capacity(payload.len() + 16 + chunks * 5);

        buf.push(csid & 0x3F);
        buf.write_u24::<BigEndian>(if extended { EXTENDED_TIMESTAMP } else { timestamp })?;
        buf.write_u24::<BigEndian>(payload.len() as u32)?;
        buf.push(type_id);
        buf.write_u32::<LittleEndian>(stream_id)?;
        if extended {
            buf.write_u32::<BigEndian>(timestamp)?;
        }
        for (i, chunk) in payload.chunks(self.out_chunk_size).enumerate() {
            if i > 0 {
                buf.push(0xC0 | (csid & 0x3F));
                if extended {
                    buf.write_u32::<BigEndian>(timestamp)?;
                }
            }
            buf.extend_from_slice(chunk);
        }
        self.io.write_all(&buf)
    }

    /// Read chunks until one message is complete. Protocol control messages
    /// are applied (and answered) before being returned.
    pub fn read_message(&mut self) -> io::Result<RtmpMessage> {
        loop {
            if let Some(message) = self.read_chunk()? {
                self.apply_control(&message)?;
                self.maybe_ack()?;
                return Ok(message);
            }
        }
    }

    fn read_chunk(&mut self) -> io::Result<Option<RtmpMessage>> {
        let first = self.read_u8()?;
        let fmt = first >> 6;
        let csid = match first & 0x3F {
            0 => 64 + u32::from(self.read_u8()?),
            1 => {
                let lo = u32::from(self.read_u8()?);
                let hi = u32::from(self.read_u8()?);
                64 + lo + hi * 256
            }
            id => u32::from(id),
        };

        let mut state = self.inbound.remove(&csid).unwrap_or_default();
        let starting = state.payload.is_empty();
        match fmt {
            0 => {
                let ts = self.read_u24()?;
                state.length = self.read_u24()? as usize;
                state.type_id = self.read_u8()?;
                state.stream_id = self.read_u32_le()?;
                state.extended = ts == EXTENDED_TIMESTAMP;
                state.timestamp = if state.extended { self.read_u32_be()? } else { ts };
                state.delta = 0;
            }
            1 | 2 => {
                let delta = self.read_u24()?;
                if fmt == 1 {
                    state.length = self.read_u24()? as usize;
                    state.type_id = self.read_u8()?;
                }
                state.extended = delta == EXTENDED_TIMESTAMP;
                state.delta = if state.extended { self.read_u32_be()? } else { delta };
                if starting {
                    state.timestamp = state.timestamp.wrapping_add(state.delta);
                }
            }
            _ => {
                if state.extended {
                    self.read_u32_be()?;
                }
                if starting {
                    state.timestamp = state.timestamp.wrapping_add(state.delta);
                }
            }
        }

        let wanted = state
            .length
            .saturating_sub(state.payload.len())
            .min(self.in_chunk_size);
        let start = state.payload.len();
        state.payload.resize(start + wanted, 0);
        self.read_bytes(&mut state.payload[start..])?;

        let message = if state.payload.len() >= state.length {
            Some(RtmpMessage {
                type_id: state.type_id,
                stream_id: state.stream_id,
                timestamp: state.timestamp,
                payload: std::mem::take(&mut state.payload),
            })
        } else {
            None
        };
        self.inbound.insert(csid, state);
        Ok(message)
    }

    fn apply_control(&mut self, message: &RtmpMessage) -> io::Result<()> {
        let payload = &message.payload[..];
        match message.type_id {
            MSG_SET_CHUNK_SIZE if payload.len() >= 4 => {
                let size = (&payload[..4]).read_u32::<BigEndian>()? & 0x7FFF_FFFF;
                trace!(size, "Peer chunk size");
                self.in_chunk_size = (size as usize).max(1);
            }
            MSG_ABORT if payload.len() >= 4 => {
                let csid = (&payload[..4]).read_u32::<BigEndian>()?;
                self.inbound.remove(&csid);
            }
            MSG_WINDOW_ACK_SIZE if payload.len() >= 4 => {
                self.window_ack_size = (&payload[..4]).read_u32::<BigEndian>()?;
            }
            MSG_SET_PEER_BANDWIDTH if payload.len() >= 4 => {
                let window = (&payload[..4]).read_u32::<BigEndian>()?;
                self.write_message(CSID_CONTROL, MSG_WINDOW_ACK_SIZE, 0, 0, &window.to_be_bytes())?;
            }
            MSG_USER_CONTROL if payload.len() >= 6 => {
                let event = (&payload[..2]).read_u16::<BigEndian>()?;
                if event == USER_CONTROL_PING_REQUEST {
                    let mut reply = Vec::with_capacity(6);
                    reply.write_u16::<BigEndian>(USER_CONTROL_PING_RESPONSE)?;
                    reply.extend_from_slice(&payload[2..6]);
                    self.write_message(CSID_CONTROL, MSG_USER_CONTROL, 0, 0, &reply)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn maybe_ack(&mut self) -> io::Result<()> {
        if self.window_ack_size == 0 {
            return Ok(());
        }
        if self.bytes_read - self.last_ack >= u64::from(self.window_ack_size) {
            self.last_ack = self.bytes_read;
            let seq = (self.bytes_read & 0xFFFF_FFFF) as u32;
            self.write_message(CSID_CONTROL, MSG_ACK, 0, 0, &seq.to_be_bytes())?;
        }
        Ok(())
    }
}

/// A connection that has completed `publish` and accepts audio.
pub struct RtmpPublisher<S: Read + Write> {
    chunks: ChunkStream<S>,
    target: RtmpTarget,
    stream_id: u32,
    next_transaction: f64,
    closed: bool,
}

impl RtmpPublisher<TcpStream> {
    /// Resolve, connect and publish to `target`. Blocks for at most
    /// `timeout` per network operation during setup.
    pub fn connect(target: &RtmpTarget, timeout: Duration) -> Result<Self, StreamError> {
        let url = target.url();
        let addrs = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|e| StreamError::transport(format!("resolve {url}"), e))?;

        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no address resolved");
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = e,
            }
        }
        let stream = stream.ok_or_else(|| StreamError::transport(format!("connect {url}"), last_err))?;

        stream
            .set_read_timeout(Some(timeout))
            .and_then(|_| stream.set_write_timeout(Some(timeout)))
            .and_then(|_| stream.set_nodelay(true))
            .map_err(|e| StreamError::transport(format!("configure socket for {url}"), e))?;

        Self::publish_over(stream, target)
    }
}

impl<S: Read + Write> RtmpPublisher<S> {
    /// Run the handshake and publish sequence over an already-open stream.
    pub fn publish_over(io: S, target: &RtmpTarget) -> Result<Self, StreamError> {
        let mut io = io;
        handshake(&mut io).map_err(|e| StreamError::transport("rtmp handshake", e))?;
        debug!(url = %target.url(), "RTMP handshake complete");

        let mut publisher = Self {
            chunks: ChunkStream::new(io),
            target: target.clone(),
            stream_id: 0,
            next_transaction: 1.0,
            closed: false,
        };

        publisher
            .chunks
            .write_message(
                CSID_CONTROL,
                MSG_SET_CHUNK_SIZE,
                0,
                0,
                &(OUT_CHUNK_SIZE as u32).to_be_bytes(),
            )
            .map_err(|e| StreamError::transport("send chunk size", e))?;
        publisher.chunks.set_out_chunk_size(OUT_CHUNK_SIZE);

        publisher.connect_app()?;
        publisher.create_stream()?;
        publisher.publish()?;
        info!(url = %target.url(), stream_id = publisher.stream_id, "RTMP publishing started");
        Ok(publisher)
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn get_ref(&self) -> &S {
        self.chunks.get_ref()
    }

    fn transaction(&mut self) -> f64 {
        let tx = self.next_transaction;
        self.next_transaction += 1.0;
        tx
    }

    fn send_command(&mut self, stream_id: u32, values: &[Amf0Value]) -> Result<(), StreamError> {
        let name = values.first().and_then(Amf0Value::as_str).unwrap_or("?").to_string();
        self.chunks
            .write_message(CSID_COMMAND, MSG_COMMAND_AMF0, stream_id, 0, &encode_all(values))
            .map_err(|e| StreamError::transport(format!("send {name}"), e))
    }

    /// Read until a command satisfying `matches` arrives. `_error` replies and
    /// error-level `onStatus` events abort the wait.
    fn wait_for(
        &mut self,
        what: &str,
        matches: impl Fn(&str, &[Amf0Value]) -> bool,
    ) -> Result<Vec<Amf0Value>, StreamError> {
        loop {
            let message = self
                .chunks
                .read_message()
                .map_err(|e| StreamError::transport(format!("waiting for {what}"), e))?;
            if message.type_id != MSG_COMMAND_AMF0 {
                trace!(type_id = message.type_id, "RTMP message during setup");
                continue;
            }

            let values = decode_all(&message.payload)
                .map_err(|e| StreamError::Protocol(format!("bad command payload: {e}")))?;
            let name = values.first().and_then(Amf0Value::as_str).unwrap_or_default();

            if name == "_error" || (name == "onStatus" && status_level(&values) == Some("error")) {
                return Err(StreamError::Protocol(format!(
                    "{what} refused: {}",
                    status_description(&values)
                )));
            }
            if matches(name, &values) {
                return Ok(values);
            }
            trace!(command = name, "Ignoring RTMP command during setup");
        }
    }

    fn connect_app(&mut self) -> Result<(), StreamError> {
        let tx = self.transaction();
        let props = Amf0Value::Object(vec![
            ("app".into(), Amf0Value::string(self.target.app.clone())),
            ("type".into(), Amf0Value::string("nonprivate")),
            ("flashVer".into(), Amf0Value::string("FMLE/3.0 (compatible; intercom-audio)")),
            ("tcUrl".into(), Amf0Value::string(self.target.tc_url())),
        ]);
        self.send_command(0, &[Amf0Value::string("connect"), Amf0Value::Number(tx), props])?;
        self.wait_for("connect", |name, values| is_result_for(name, values, tx))?;
        Ok(())
    }

    fn create_stream(&mut self) -> Result<(), StreamError> {
        let key = Amf0Value::string(self.target.stream_key.clone());
        let tx = self.transaction();
        self.send_command(0, &[Amf0Value::string("releaseStream"), Amf0Value::Number(tx), Amf0Value::Null, key.clone()])?;
        let tx = self.transaction();
        self.send_command(0, &[Amf0Value::string("FCPublish"), Amf0Value::Number(tx), Amf0Value::Null, key])?;

        let tx = self.transaction();
        self.send_command(0, &[Amf0Value::string("createStream"), Amf0Value::Number(tx), Amf0Value::Null])?;
        let values = self.wait_for("createStream", |name, values| is_result_for(name, values, tx))?;
        let stream_id = values
            .get(3)
            .and_then(Amf0Value::as_number)
            .ok_or_else(|| StreamError::Protocol("createStream result has no stream id".into()))?;
        self.stream_id = stream_id as u32;
        Ok(())
    }

    fn publish(&mut self) -> Result<(), StreamError> {
        let tx = self.transaction();
        self.send_command(
            self.stream_id,
            &[
                Amf0Value::string("publish"),
                Amf0Value::Number(tx),
                Amf0Value::Null,
                Amf0Value::string(self.target.stream_key.clone()),
                Amf0Value::string("live"),
            ],
        )?;
        self.wait_for("publish", |name, values| {
            name == "onStatus"
                && values
                    .get(3)
                    .and_then(|info| info.get("code"))
                    .and_then(Amf0Value::as_str)
                    == Some("NetStream.Publish.Start")
        })?;
        Ok(())
    }

    pub fn send_metadata(&mut self, body: &[u8]) -> Result<(), StreamError> {
        let mut payload = encode_all(&[Amf0Value::string("@setDataFrame")]);
        payload.extend_from_slice(body);
        self.chunks
            .write_message(CSID_DATA, MSG_DATA_AMF0, self.stream_id, 0, &payload)
            .map_err(|e| StreamError::transport("send metadata", e))
    }

    pub fn send_audio(&mut self, timestamp: u32, body: &[u8]) -> Result<(), StreamError> {
        self.chunks
            .write_message(CSID_AUDIO, MSG_AUDIO, self.stream_id, timestamp, body)
            .map_err(|e| StreamError::transport("send audio", e))
    }

    /// Unpublish and delete the stream. Safe to call more than once.
    pub fn close(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let key = Amf0Value::string(self.target.stream_key.clone());
        let tx = self.transaction();
        self.send_command(0, &[Amf0Value::string("FCUnpublish"), Amf0Value::Number(tx), Amf0Value::Null, key])?;
        let tx = self.transaction();
        let stream_id = Amf0Value::Number(f64::from(self.stream_id));
        self.send_command(0, &[Amf0Value::string("deleteStream"), Amf0Value::Number(tx), Amf0Value::Null, stream_id])?;
        info!(url = %self.target.url(), "RTMP stream unpublished");
        Ok(())
    }
}

impl<S: Read + Write + Send> TagSink for RtmpPublisher<S> {
    fn send_tag(&mut self, tag: &FlvTag) -> Result<(), StreamError> {
        match tag.tag_type {
            TAG_AUDIO => self.send_audio(tag.timestamp, &tag.body),
            TAG_SCRIPT => self.send_metadata(&tag.body),
            other => {
                warn!(tag_type = other, "Unsupported tag type for RTMP");
                Ok(())
            }
        }
    }

    fn finish(&mut self) -> Result<(), StreamError> {
        self.close()
    }
}

fn is_result_for(name: &str, values: &[Amf0Value], tx: f64) -> bool {
    name == "_result" && values.get(1).and_then(Amf0Value::as_number) == Some(tx)
}

fn status_level(values: &[Amf0Value]) -> Option<&str> {
    values.get(3).and_then(|v| v.get("level")).and_then(Amf0Value::as_str)
}

fn status_description(values: &[Amf0Value]) -> String {
    let info = values.get(3);
    let field = |key| info.and_then(|v| v.get(key)).and_then(Amf0Value::as_str);
    match (field("code"), field("description")) {
        (Some(code), Some(desc)) => format!("{code} ({desc})"),
        (Some(code), None) => code.to_string(),
        (None, Some(desc)) => desc.to_string(),
        (None, None) => "no details".to_string(),
    }
}

fn handshake<S: Read + Write>(io: &mut S) -> io::Result<()> {
    let mut c0c1 = Vec::with_capacity(1 + HANDSHAKE_SIZE);
    c0c1.push(RTMP_VERSION);
    c0c1.extend_from_slice(&[0u8; 8]); // time + zero
    while c0c1.len() < 1 + HANDSHAKE_SIZE {
        c0c1.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    }
    c0c1.truncate(1 + HANDSHAKE_SIZE);
    io.write_all(&c0c1)?;

    let version = io.read_u8()?;
    if version != RTMP_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("server speaks RTMP version {version}"),
        ));
    }
    let mut s1 = vec![0u8; HANDSHAKE_SIZE];
    io.read_exact(&mut s1)?;
    io.write_all(&s1)?; // C2 echoes S1

    let mut s2 = vec![0u8; HANDSHAKE_SIZE];
    io.read_exact(&mut s2)?;
    io.flush()
}
