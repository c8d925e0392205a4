//! The connection engine: handshake, the single read loop, write
//! serialization, flow control, shutdown, and keep-alive — everything
//! else in this crate exists to serve this module.

use crate::enums::FrameType;
use crate::error::{Error, ProtoError, Reason, Result};
use crate::flags::{
    ContinuationFlags, DataFlags, HeadersFlags, PingFlags, PushPromiseFlags, SettingsFlags,
};
use crate::frame::{self, FrameHeader};
use crate::headers::HeaderList;
use crate::hpack;
use crate::request::{Request, RequestContext};
use crate::response::Response;
use crate::settings::{self, PeerSettings};
use crate::stream::Stream;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use log::{debug, trace, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

const CONN_WINDOW_INITIAL: i64 = 65_535;
const CONN_WINDOW_REFILL_THRESHOLD: i64 = 32_767;

/// Headers forbidden on the wire per RFC 7540 §8.1.2.2; connection-specific
/// HTTP/1.1 machinery has no meaning over a multiplexed stream.
const FORBIDDEN_HEADERS: &[&str] =
    &["connection", "transfer-encoding", "keep-alive", "proxy-connection", "upgrade", "host"];

struct WriteState<T> {
    writer: WriteHalf<T>,
    encoder: hpack::Encoder,
    conn_send_window: i64,
}

struct Shared {
    streams: DashMap<u32, Stream>,
    next_stream_id: AtomicU32,
    peer_settings: RwLock<PeerSettings>,
    goaway_received: AtomicBool,
    last_processed_stream_id: AtomicU32,
    alive: AtomicBool,
    options: crate::config::Options,
    flow_notify: Notify,
    settings_ack: Mutex<Option<oneshot::Sender<()>>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
}

/// A live HTTP/2 client connection over transport `T`. `T` exclusively
/// belongs to the connection for its whole lifetime.
pub struct Connection<T> {
    write: Mutex<WriteState<T>>,
    shared: Shared,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Perform the preface + SETTINGS handshake, then start the read loop
    /// and keep-alive task. Resolves once the peer has ACKed our SETTINGS.
    pub async fn initialize(transport: T, options: crate::config::Options) -> Result<Arc<Self>> {
        let options = options.normalized();
        let (read_half, mut write_half) = split(transport);

        frame::write_preface(&mut write_half).await?;
        let client_settings = settings::serialize_client_settings(&options);
        frame::write_frame(&mut write_half, FrameType::Settings, 0, 0, &client_settings).await?;

        let (ack_tx, ack_rx) = oneshot::channel();
        let conn = Arc::new(Self {
            write: Mutex::new(WriteState {
                writer: write_half,
                encoder: hpack::Encoder::new(options.header_table_size as usize),
                conn_send_window: CONN_WINDOW_INITIAL,
            }),
            shared: Shared {
                streams: DashMap::new(),
                next_stream_id: AtomicU32::new(1),
                peer_settings: RwLock::new(PeerSettings::default()),
                goaway_received: AtomicBool::new(false),
                last_processed_stream_id: AtomicU32::new(u32::MAX),
                alive: AtomicBool::new(true),
                options: options.clone(),
                flow_notify: Notify::new(),
                settings_ack: Mutex::new(Some(ack_tx)),
                read_task: Mutex::new(None),
                keepalive_task: Mutex::new(None),
            },
        });

        let read_task = tokio::spawn(run_read_loop(conn.clone(), read_half));
        *conn.shared.read_task.lock().await = Some(read_task);

        match tokio::time::timeout(options.settings_ack_timeout, ack_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(Error::Network("connection closed during handshake".into())),
            Err(_) => return Err(Error::Timeout("SETTINGS ACK")),
        }

        let keepalive = tokio::spawn(run_keep_alive(conn.clone(), options.keep_alive_interval));
        *conn.shared.keepalive_task.lock().await = Some(keepalive);

        Ok(conn)
    }

    /// True while this engine has not observed GOAWAY and its read loop is
    /// still running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst) && !self.shared.goaway_received.load(Ordering::SeqCst)
    }

    /// Drive one request/response across a freshly allocated stream.
    /// `cancel`, if provided, races the response wait and converts into an
    /// RST_STREAM(CANCEL) plus `Error::Cancelled`.
    pub async fn send_request(
        self: &Arc<Self>,
        request: Request,
        _ctx: &RequestContext,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<Response> {
        if !self.is_alive() {
            return Err(Error::Network("connection is going away".into()));
        }

        let max_concurrent = self.shared.peer_settings.read().await.max_concurrent_streams();
        if self.shared.streams.len() as u32 >= max_concurrent {
            return Err(Error::InvalidRequest("MAX_CONCURRENT_STREAMS reached".into()));
        }

        let stream_id = self.shared.next_stream_id.fetch_add(2, Ordering::SeqCst);
        if stream_id > 0x7fff_fffd {
            return Err(Error::InvalidRequest("stream id space exhausted".into()));
        }

        let header_list = build_request_headers(&request);
        let peer_initial_window = i64::from(self.shared.peer_settings.read().await.initial_window_size());

        let (tx, rx) = oneshot::channel();
        let stream = Stream::new(
            stream_id,
            peer_initial_window,
            i64::from(self.shared.options.initial_window_size),
            self.shared.options.max_response_body_bytes,
            self.shared.options.max_header_list_size,
            tx,
        );
        self.shared.streams.insert(stream_id, stream);

        if let Err(err) = self.write_request_headers(stream_id, &header_list, request.body.is_empty()).await {
            self.shared.streams.remove(&stream_id);
            return Err(err);
        }
        if let Some(mut s) = self.shared.streams.get_mut(&stream_id) {
            s.mark_request_sent(request.body.is_empty());
        }

        if !request.body.is_empty() {
            if let Err(err) = self.write_request_body(stream_id, request.body).await {
                self.shared.streams.remove(&stream_id);
                return Err(err);
            }
            if let Some(mut s) = self.shared.streams.get_mut(&stream_id) {
                s.mark_body_sent();
            }
        }

        let result = match cancel {
            Some(cancel_rx) => tokio::select! {
                result = rx => result.map_err(|_| Error::Network("stream dropped".into())),
                _ = cancel_rx => {
                    self.cancel_stream(stream_id).await;
                    Err(Error::Cancelled)
                }
            },
            None => rx.await.map_err(|_| Error::Network("stream dropped".into())),
        };
        self.shared.streams.remove(&stream_id);
        result?
    }

    /// Send RST_STREAM(CANCEL) for `stream_id` and fail its caller. Used
    /// both for explicit cancellation and internally on write failures.
    pub async fn cancel_stream(self: &Arc<Self>, stream_id: u32) {
        if let Some(mut stream) = self.shared.streams.get_mut(&stream_id) {
            stream.cancel();
        }
        let payload = build_rst_stream(Reason::Cancel);
        let mut guard = self.write.lock().await;
        let _ = frame::write_frame(&mut guard.writer, FrameType::ResetStream, 0, stream_id, &payload).await;
    }

    async fn write_request_headers(&self, stream_id: u32, headers: &HeaderList, end_stream: bool) -> Result<()> {
        let mut guard = self.write.lock().await;
        let block = guard.encoder.encode(headers);
        let max_frame_size = self.shared.peer_settings.read().await.max_frame_size() as usize;
        let chunks: Vec<&[u8]> = block.chunks(max_frame_size.max(1)).collect();
        let chunk_count = chunks.len().max(1);

        for (i, chunk) in (0..chunk_count).map(|i| (i, chunks.get(i).copied().unwrap_or(&[]))) {
            let is_last = i + 1 == chunk_count;
            if i == 0 {
                let mut flags = HeadersFlags::empty();
                if end_stream {
                    flags |= HeadersFlags::END_STREAM;
                }
                if is_last {
                    flags |= HeadersFlags::END_HEADERS;
                }
                frame::write_frame(&mut guard.writer, FrameType::Headers, flags.bits(), stream_id, chunk).await?;
            } else {
                let mut flags = ContinuationFlags::empty();
                if is_last {
                    flags |= ContinuationFlags::END_HEADERS;
                }
                frame::write_frame(&mut guard.writer, FrameType::Continuation, flags.bits(), stream_id, chunk)
                    .await?;
            }
        }
        Ok(())
    }

    async fn write_request_body(self: &Arc<Self>, stream_id: u32, body: Bytes) -> Result<()> {
        let mut remaining = body;
        loop {
            let max_frame_size = self.shared.peer_settings.read().await.max_frame_size() as u64;
            // Register interest before taking the write lock: a
            // WINDOW_UPDATE processed between releasing the lock below and
            // awaiting this future must still wake us, since `notify_waiters`
            // stores no permit for a `Notified` that doesn't exist yet.
            let notified = self.shared.flow_notify.notified();
            let sent = {
                let mut guard = self.write.lock().await;
                let stream_window = self
                    .shared
                    .streams
                    .get(&stream_id)
                    .map(|s| s.send_window().max(0) as u64)
                    .unwrap_or(0);
                let conn_window = guard.conn_send_window.max(0) as u64;
                let n = stream_window.min(conn_window).min(max_frame_size).min(remaining.len() as u64) as usize;
                if n == 0 {
                    None
                } else {
                    let chunk = remaining.split_to(n);
                    guard.conn_send_window -= n as i64;
                    if let Some(mut s) = self.shared.streams.get_mut(&stream_id) {
                        s.debit_send(n as u32);
                    }
                    let end_stream = remaining.is_empty();
                    let flags = if end_stream { DataFlags::END_STREAM.bits() } else { 0 };
                    frame::write_frame(&mut guard.writer, FrameType::Data, flags, stream_id, &chunk).await?;
                    Some(())
                }
            };
            if sent.is_none() {
                notified.await;
            } else if remaining.is_empty() {
                return Ok(());
            }
        }
    }

    /// Best-effort GOAWAY(NO_ERROR), fail every remaining stream, and stop
    /// the background tasks. Never blocks indefinitely and never panics.
    pub async fn dispose(self: &Arc<Self>) {
        self.shared.alive.store(false, Ordering::SeqCst);
        let payload = build_goaway(0, Reason::NoError, &[]);
        let _ = tokio::time::timeout(Duration::from_millis(100), async {
            let mut guard = self.write.lock().await;
            frame::write_frame(&mut guard.writer, FrameType::GoAway, 0, 0, &payload).await
        })
        .await;

        for mut entry in self.shared.streams.iter_mut() {
            entry.fail(Error::Network("connection disposed".into()));
        }
        self.shared.streams.clear();

        if let Some(handle) = self.shared.read_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.shared.keepalive_task.lock().await.take() {
            handle.abort();
        }
    }
}

/// Build the outgoing header list: fixed pseudo-header order, forbidden
/// headers stripped, `te` allowed only as exactly `trailers`, a default
/// `user-agent` appended when absent.
fn build_request_headers(request: &Request) -> HeaderList {
    let mut headers = HeaderList::with_capacity(request.headers.len() + 5);
    headers.push(":method", request.method.to_string());
    headers.push(":scheme", request.scheme.clone());
    headers.push(":authority", request.authority());
    headers.push(":path", request.path.clone());

    let mut saw_user_agent = false;
    for (name, value) in request.headers.iter() {
        let lower = name.to_ascii_lowercase();
        if FORBIDDEN_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if lower == "te" && value != "trailers" {
            continue;
        }
        if lower == "user-agent" {
            saw_user_agent = true;
        }
        headers.push(lower, value.to_string());
    }
    if !saw_user_agent {
        headers.push("user-agent", concat!("h2engine/", env!("CARGO_PKG_VERSION")));
    }
    headers
}

fn build_goaway(last_stream_id: u32, reason: Reason, debug: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + debug.len());
    buf.put_u32(last_stream_id & 0x7fff_ffff);
    buf.put_u32(reason.to_wire());
    buf.extend_from_slice(debug);
    buf.freeze()
}

fn build_rst_stream(reason: Reason) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(reason.to_wire());
    buf.freeze()
}

fn build_window_update(increment: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(increment & 0x7fff_ffff);
    buf.freeze()
}

fn parse_goaway(mut payload: Bytes) -> Option<(u32, Reason)> {
    if payload.len() < 8 {
        return None;
    }
    let last_stream_id = payload.get_u32() & 0x7fff_ffff;
    let code = payload.get_u32();
    Some((last_stream_id, Reason::from_wire(code)))
}

async fn run_keep_alive<T>(conn: Arc<Connection<T>>, interval: Duration)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; skip it
    loop {
        ticker.tick().await;
        if !conn.is_alive() {
            return;
        }
        let mut guard = conn.write.lock().await;
        if frame::write_frame(&mut guard.writer, FrameType::Ping, 0, 0, &[0u8; 8]).await.is_err() {
            return;
        }
    }
}

/// The connection's single reader. Owns the HPACK decoder and every piece
/// of state nothing else touches (continuation tracking, the connection
/// recv window) as plain locals — no synchronization needed for state only
/// this task ever sees.
async fn run_read_loop<T>(conn: Arc<Connection<T>>, mut reader: ReadHalf<T>)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut decoder = hpack::Decoder::new(conn.shared.options.header_table_size as usize);
    decoder.set_max_decoded_bytes(conn.shared.options.max_decoded_header_bytes);
    let mut conn_recv_window: i64 = CONN_WINDOW_INITIAL;
    let mut continuation_stream: Option<u32> = None;

    loop {
        let (header, payload) = match frame::read_frame(&mut reader, conn.shared.options.max_frame_size).await {
            Ok(pair) => pair,
            Err(_) => break,
        };

        if let Some(expected) = continuation_stream {
            if header.frame_type() != Some(FrameType::Continuation) || header.stream_id != expected {
                fatal(&conn, Reason::ProtocolError).await;
                break;
            }
        }

        let outcome = dispatch(&conn, &mut decoder, &mut conn_recv_window, &mut continuation_stream, header, payload)
            .await;

        if let Err(reason) = outcome {
            fatal(&conn, reason).await;
            break;
        }
    }

    conn.shared.alive.store(false, Ordering::SeqCst);
}

async fn dispatch<T>(
    conn: &Arc<Connection<T>>,
    decoder: &mut hpack::Decoder,
    conn_recv_window: &mut i64,
    continuation_stream: &mut Option<u32>,
    header: FrameHeader,
    payload: Bytes,
) -> std::result::Result<(), Reason>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match header.frame_type() {
        Some(FrameType::Settings) => handle_settings(conn, header, payload).await,
        Some(FrameType::Ping) => handle_ping(conn, header, payload).await,
        Some(FrameType::GoAway) => {
            handle_goaway(conn, payload);
            Ok(())
        }
        Some(FrameType::WindowUpdate) => handle_window_update(conn, header, payload).await,
        Some(FrameType::Headers) => {
            handle_headers(conn, decoder, continuation_stream, header, payload).await
        }
        Some(FrameType::Continuation) => {
            handle_continuation(conn, decoder, continuation_stream, header, payload).await
        }
        Some(FrameType::Data) => handle_data(conn, conn_recv_window, header, payload).await,
        Some(FrameType::ResetStream) => handle_rst_stream(conn, header, payload).await,
        Some(FrameType::PushPromise) => handle_push_promise(conn, header, payload).await,
        Some(FrameType::Priority) => handle_priority(header),
        None => {
            trace!("ignoring unrecognized frame type {:#x}", header.raw_type);
            Ok(())
        }
    }
}

async fn handle_settings<T>(conn: &Arc<Connection<T>>, header: FrameHeader, payload: Bytes) -> std::result::Result<(), Reason>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if header.stream_id != 0 {
        return Err(Reason::ProtocolError);
    }
    let flags = SettingsFlags::from_bits_truncate(header.flags);
    if flags.contains(SettingsFlags::ACK) {
        if !payload.is_empty() {
            return Err(Reason::FrameSizeError);
        }
        if let Some(tx) = conn.shared.settings_ack.lock().await.take() {
            let _ = tx.send(());
        }
        return Ok(());
    }

    let entries = settings::PeerSettings::parse(&payload).map_err(|e| e.reason())?;
    let delta = {
        let mut peer_settings = conn.shared.peer_settings.write().await;
        peer_settings.apply(&entries).map_err(|e| e.reason())?
    };

    if let Some(window_delta) = delta.initial_window_size_delta {
        for mut entry in conn.shared.streams.iter_mut() {
            if entry.apply_window_delta(window_delta).is_err() {
                return Err(Reason::FlowControlError);
            }
        }
    }
    if let Some(new_size) = delta.header_table_size_changed {
        let mut guard = conn.write.lock().await;
        guard.encoder.set_max_dynamic_size(new_size as usize);
    }

    let mut guard = conn.write.lock().await;
    frame::write_frame(&mut guard.writer, FrameType::Settings, SettingsFlags::ACK.bits(), 0, &[])
        .await
        .map_err(|_| Reason::InternalError)?;
    Ok(())
}

async fn handle_ping<T>(conn: &Arc<Connection<T>>, header: FrameHeader, payload: Bytes) -> std::result::Result<(), Reason>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if header.stream_id != 0 || payload.len() != 8 {
        return Err(Reason::ProtocolError);
    }
    let flags = PingFlags::from_bits_truncate(header.flags);
    if flags.contains(PingFlags::ACK) {
        return Ok(());
    }
    let mut guard = conn.write.lock().await;
    frame::write_frame(&mut guard.writer, FrameType::Ping, PingFlags::ACK.bits(), 0, &payload)
        .await
        .map_err(|_| Reason::InternalError)?;
    Ok(())
}

fn handle_goaway<T>(conn: &Arc<Connection<T>>, payload: Bytes) {
    let Some((last_stream_id, reason)) = parse_goaway(payload) else { return };
    warn!("received GOAWAY last_stream={last_stream_id} reason={reason}");
    conn.shared.goaway_received.store(true, Ordering::SeqCst);
    conn.shared.last_processed_stream_id.store(last_stream_id, Ordering::SeqCst);
    for mut entry in conn.shared.streams.iter_mut() {
        if *entry.key() > last_stream_id {
            entry.fail(Error::Network(format!(
                "GOAWAY({reason}): stream {} was not processed",
                entry.key()
            )));
        }
    }
}

async fn handle_window_update<T>(conn: &Arc<Connection<T>>, header: FrameHeader, payload: Bytes) -> std::result::Result<(), Reason>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if payload.len() != 4 {
        return Err(Reason::FrameSizeError);
    }
    let increment = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
    if increment == 0 {
        return if header.stream_id == 0 { Err(Reason::ProtocolError) } else {
            // Stream-scoped: RST_STREAM that stream only, connection stays alive.
            if let Some(mut stream) = conn.shared.streams.get_mut(&header.stream_id) {
                stream.fail(Error::Network("WINDOW_UPDATE increment of 0".into()));
            }
            let mut guard = conn.write.lock().await;
            let _ = frame::write_frame(
                &mut guard.writer,
                FrameType::ResetStream,
                0,
                header.stream_id,
                &build_rst_stream(Reason::ProtocolError),
            )
            .await;
            Ok(())
        };
    }

    if header.stream_id == 0 {
        let mut guard = conn.write.lock().await;
        guard.conn_send_window += i64::from(increment);
        if guard.conn_send_window > crate::stream::MAX_WINDOW {
            return Err(Reason::FlowControlError);
        }
    } else if let Some(mut stream) = conn.shared.streams.get_mut(&header.stream_id) {
        if stream.credit_send(increment).is_err() {
            drop(stream);
            let mut guard = conn.write.lock().await;
            let _ = frame::write_frame(
                &mut guard.writer,
                FrameType::ResetStream,
                0,
                header.stream_id,
                &build_rst_stream(Reason::FlowControlError),
            )
            .await;
            return Ok(());
        }
    }
    conn.shared.flow_notify.notify_waiters();
    Ok(())
}

async fn handle_headers<T>(
    conn: &Arc<Connection<T>>,
    decoder: &mut hpack::Decoder,
    continuation_stream: &mut Option<u32>,
    header: FrameHeader,
    mut payload: Bytes,
) -> std::result::Result<(), Reason>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let flags = HeadersFlags::from_bits_truncate(header.flags);
    if flags.contains(HeadersFlags::PADDED) {
        if payload.is_empty() {
            return Err(Reason::ProtocolError);
        }
        let pad_len = payload.get_u8() as usize;
        if pad_len > payload.len() {
            return Err(Reason::ProtocolError);
        }
        payload.truncate(payload.len() - pad_len);
    }
    if flags.contains(HeadersFlags::PRIORITY) {
        if payload.len() < 5 {
            return Err(Reason::ProtocolError);
        }
        payload.advance(5);
    }

    let Some(mut stream) = conn.shared.streams.get_mut(&header.stream_id) else {
        // Incoming HEADERS on a stream we don't know about: already closed
        // or reset. Not a connection error.
        return Ok(());
    };
    stream.push_header_fragment(&payload);
    if flags.contains(HeadersFlags::END_STREAM) {
        stream.defer_end_stream();
    }
    if flags.contains(HeadersFlags::END_HEADERS) {
        stream.finish_headers(decoder).map_err(|e| e.reason())?;
    } else {
        *continuation_stream = Some(header.stream_id);
    }
    Ok(())
}

async fn handle_continuation<T>(
    conn: &Arc<Connection<T>>,
    decoder: &mut hpack::Decoder,
    continuation_stream: &mut Option<u32>,
    header: FrameHeader,
    payload: Bytes,
) -> std::result::Result<(), Reason>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let flags = ContinuationFlags::from_bits_truncate(header.flags);
    if let Some(mut stream) = conn.shared.streams.get_mut(&header.stream_id) {
        stream.push_header_fragment(&payload);
        if flags.contains(ContinuationFlags::END_HEADERS) {
            *continuation_stream = None;
            stream.finish_headers(decoder).map_err(|e| e.reason())?;
        }
    } else if flags.contains(ContinuationFlags::END_HEADERS) {
        *continuation_stream = None;
    }
    Ok(())
}

async fn handle_data<T>(conn: &Arc<Connection<T>>, conn_recv_window: &mut i64, header: FrameHeader, mut payload: Bytes) -> std::result::Result<(), Reason>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let flow_controlled_length = header.length;
    *conn_recv_window -= i64::from(flow_controlled_length);
    if *conn_recv_window < CONN_WINDOW_REFILL_THRESHOLD {
        let increment = (CONN_WINDOW_INITIAL - *conn_recv_window) as u32;
        *conn_recv_window += i64::from(increment);
        let mut guard = conn.write.lock().await;
        let _ = frame::write_frame(
            &mut guard.writer,
            FrameType::WindowUpdate,
            0,
            0,
            &build_window_update(increment),
        )
        .await;
    }

    let flags = DataFlags::from_bits_truncate(header.flags);
    if flags.contains(DataFlags::PADDED) {
        if payload.is_empty() {
            return Err(Reason::ProtocolError);
        }
        let pad_len = payload.get_u8() as usize;
        if pad_len > payload.len() {
            return Err(Reason::ProtocolError);
        }
        payload.truncate(payload.len() - pad_len);
    }

    // Everything that touches the stream's `DashMap` guard happens here,
    // synchronously, so the guard is never held across an `.await` — the
    // request path takes the write lock and then the stream lock in the
    // opposite order, and holding both at once is how that deadlocks.
    let (append_result, stream_window_increment) = {
        let Some(mut stream) = conn.shared.streams.get_mut(&header.stream_id) else {
            let mut guard = conn.write.lock().await;
            let _ = frame::write_frame(
                &mut guard.writer,
                FrameType::ResetStream,
                0,
                header.stream_id,
                &build_rst_stream(Reason::StreamClosed),
            )
            .await;
            return Ok(());
        };

        stream.debit_recv(flow_controlled_length);
        let increment = if stream.recv_window() < CONN_WINDOW_REFILL_THRESHOLD {
            let increment = (i64::from(conn.shared.options.initial_window_size) - stream.recv_window()) as u32;
            stream.credit_recv(increment);
            Some(increment)
        } else {
            None
        };

        let append_result = stream.append_body(&payload);
        if append_result.is_ok() && flags.contains(DataFlags::END_STREAM) {
            stream.finish();
        }
        (append_result, increment)
    };

    if let Some(increment) = stream_window_increment {
        let mut guard = conn.write.lock().await;
        let _ = frame::write_frame(
            &mut guard.writer,
            FrameType::WindowUpdate,
            0,
            header.stream_id,
            &build_window_update(increment),
        )
        .await;
    }

    if let Err(err) = append_result {
        let reason = err.reason();
        let mut guard = conn.write.lock().await;
        let _ = frame::write_frame(&mut guard.writer, FrameType::ResetStream, 0, header.stream_id, &build_rst_stream(reason))
            .await;
        drop(guard);
        if let Some(mut stream) = conn.shared.streams.get_mut(&header.stream_id) {
            stream.fail(Error::Network(format!("{reason}")));
        }
    }
    Ok(())
}

async fn handle_rst_stream<T>(conn: &Arc<Connection<T>>, header: FrameHeader, payload: Bytes) -> std::result::Result<(), Reason>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if header.stream_id == 0 {
        return Err(Reason::ProtocolError);
    }
    if payload.len() != 4 {
        return Err(Reason::FrameSizeError);
    }
    let reason = Reason::from_wire(u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]));
    if let Some((_, mut stream)) = conn.shared.streams.remove(&header.stream_id) {
        if reason == Reason::Cancel {
            stream.cancel();
        } else {
            stream.fail(Error::Network(format!("RST_STREAM: {}", reason.name())));
        }
    }
    Ok(())
}

async fn handle_push_promise<T>(conn: &Arc<Connection<T>>, header: FrameHeader, mut payload: Bytes) -> std::result::Result<(), Reason>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if !conn.shared.options.enable_push {
        return Err(Reason::ProtocolError);
    }
    let flags = PushPromiseFlags::from_bits_truncate(header.flags);
    if flags.contains(PushPromiseFlags::PADDED) {
        if payload.is_empty() {
            return Err(Reason::ProtocolError);
        }
        payload.advance(1);
    }
    if payload.len() < 4 {
        return Err(Reason::ProtocolError);
    }
    let promised_id = payload.get_u32() & 0x7fff_ffff;

    let mut guard = conn.write.lock().await;
    let _ = frame::write_frame(
        &mut guard.writer,
        FrameType::ResetStream,
        0,
        promised_id,
        &build_rst_stream(Reason::RefusedStream),
    )
    .await;
    Ok(())
}

fn handle_priority(header: FrameHeader) -> std::result::Result<(), Reason> {
    if header.length != 5 {
        return Err(Reason::FrameSizeError);
    }
    Ok(())
}

/// Connection-fatal path: emit GOAWAY with the matching reason and fail
/// every still-active stream in one pass.
async fn fatal<T>(conn: &Arc<Connection<T>>, reason: Reason)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!("connection fatal: {reason}");
    conn.shared.goaway_received.store(true, Ordering::SeqCst);
    let payload = build_goaway(0, reason, &[]);
    {
        let mut guard = conn.write.lock().await;
        let _ = frame::write_frame(&mut guard.writer, FrameType::GoAway, 0, 0, &payload).await;
    }
    for mut entry in conn.shared.streams.iter_mut() {
        entry.fail(Error::Network(format!("connection failed: {reason}")));
    }
    conn.shared.streams.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    async fn read_preface(io: &mut DuplexStream) {
        let mut buf = [0u8; frame::HEADER_LEN + 15];
        io.read_exact(&mut buf[..frame::PREFACE.len()]).await.unwrap();
        assert_eq!(&buf[..frame::PREFACE.len()], frame::PREFACE);
    }

    /// Drive just enough of the server side of the handshake that a real
    /// client's `initialize()` call resolves.
    async fn complete_handshake(mut io: DuplexStream) -> DuplexStream {
        read_preface(&mut io).await;
        let _ = frame::read_frame(&mut io, 1 << 24).await.unwrap(); // client SETTINGS
        frame::write_frame(&mut io, FrameType::Settings, 0, 0, &[]).await.unwrap();
        frame::write_frame(&mut io, FrameType::Settings, SettingsFlags::ACK.bits(), 0, &[]).await.unwrap();
        io
    }

    #[tokio::test]
    async fn handshake_completes_and_connection_stays_alive() {
        let (client_io, server_io) = duplex(1 << 16);
        let server = tokio::spawn(complete_handshake(server_io));
        let conn = Connection::initialize(client_io, Options::default()).await.unwrap();
        assert!(conn.is_alive());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn goaway_fails_a_pending_request() {
        let (client_io, server_io) = duplex(1 << 16);
        let server = tokio::spawn(async move {
            let mut io = complete_handshake(server_io).await;
            let _ = frame::read_frame(&mut io, 1 << 24).await.unwrap(); // client HEADERS
            let payload = build_goaway(0, Reason::NoError, &[]);
            frame::write_frame(&mut io, FrameType::GoAway, 0, 0, &payload).await.unwrap();
        });

        let conn = Connection::initialize(client_io, Options::default()).await.unwrap();
        let request = Request::get("example.com", "/");
        let ctx = RequestContext::new();
        let result = conn.send_request(request, &ctx, None).await;
        assert!(result.is_err());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn interleaved_frame_during_continuation_kills_the_connection() {
        let (client_io, server_io) = duplex(1 << 16);
        let server = tokio::spawn(async move {
            let mut io = complete_handshake(server_io).await;
            let _ = frame::read_frame(&mut io, 1 << 24).await.unwrap(); // client HEADERS
            // HEADERS without END_HEADERS, expecting CONTINUATION next.
            frame::write_frame(&mut io, FrameType::Headers, 0, 1, &[0x88]).await.unwrap();
            // A PING instead of CONTINUATION must be rejected as PROTOCOL_ERROR.
            frame::write_frame(&mut io, FrameType::Ping, 0, 0, &[0u8; 8]).await.unwrap();
        });

        let conn = Connection::initialize(client_io, Options::default()).await.unwrap();
        let request = Request::get("example.com", "/");
        let ctx = RequestContext::new();
        let result = conn.send_request(request, &ctx, None).await;
        assert!(result.is_err());
        server.await.unwrap();
    }
}
