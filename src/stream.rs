//! Per-stream state: the client-side subset of the RFC 7540 §5.1 state
//! machine, response reassembly, and the single-fire completion channel.

use crate::error::{Error, ProtoError, Reason};
use crate::headers::HeaderList;
use crate::hpack;
use crate::response::Response;
use bytes::BytesMut;
use log::trace;
use std::time::Instant;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

pub const MAX_WINDOW: i64 = (1i64 << 31) - 1;
pub const MIN_WINDOW: i64 = -(1i64 << 31);

/// Everything the connection's read loop and request path share about one
/// stream. Holds only its own id — never a back-reference to the
/// connection; all lookups go back through the connection's stream map.
pub struct Stream {
    pub id: u32,
    state: StreamState,
    send_window: i64,
    recv_window: i64,
    header_block: BytesMut,
    body: BytesMut,
    status: Option<u16>,
    response_headers: HeaderList,
    headers_complete: bool,
    pending_end_stream: bool,
    completed: bool,
    completion: Option<oneshot::Sender<crate::error::Result<Response>>>,
    max_response_body_bytes: u64,
    max_header_list_size: Option<u32>,
    started_at: Instant,
}

impl Stream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u32,
        send_window: i64,
        recv_window: i64,
        max_response_body_bytes: u64,
        max_header_list_size: Option<u32>,
        completion: oneshot::Sender<crate::error::Result<Response>>,
    ) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            send_window,
            recv_window,
            header_block: BytesMut::new(),
            body: BytesMut::new(),
            status: None,
            response_headers: HeaderList::new(),
            headers_complete: false,
            pending_end_stream: false,
            completed: false,
            completion: Some(completion),
            max_response_body_bytes,
            max_header_list_size,
            started_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    #[must_use]
    pub fn send_window(&self) -> i64 {
        self.send_window
    }

    #[must_use]
    pub fn recv_window(&self) -> i64 {
        self.recv_window
    }

    pub fn mark_request_sent(&mut self, end_stream: bool) {
        self.state = if end_stream { StreamState::HalfClosedLocal } else { StreamState::Open };
    }

    pub fn mark_body_sent(&mut self) {
        if self.state == StreamState::Open {
            self.state = StreamState::HalfClosedLocal;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Debit the stream send window by a DATA frame's flow-controlled
    /// length (full wire payload, padding included).
    pub fn debit_send(&mut self, len: u32) {
        self.send_window -= i64::from(len);
    }

    /// Apply a WINDOW_UPDATE increment. Zero increments are rejected by the
    /// caller before this runs (connection- or stream-scoped per §4.8).
    pub fn credit_send(&mut self, increment: u32) -> Result<(), ProtoError> {
        self.send_window += i64::from(increment);
        if self.send_window > MAX_WINDOW {
            return Err(ProtoError::Stream(Reason::FlowControlError));
        }
        Ok(())
    }

    /// Apply a peer `INITIAL_WINDOW_SIZE` delta (signed) to this stream's
    /// send window, per §4.8's SETTINGS-driven adjustment rule.
    pub fn apply_window_delta(&mut self, delta: i64) -> Result<(), ProtoError> {
        let updated = self.send_window + delta;
        if updated > MAX_WINDOW || updated < MIN_WINDOW {
            return Err(ProtoError::Connection(Reason::FlowControlError));
        }
        self.send_window = updated;
        Ok(())
    }

    pub fn debit_recv(&mut self, len: u32) {
        self.recv_window -= i64::from(len);
    }

    pub fn credit_recv(&mut self, increment: u32) {
        self.recv_window += i64::from(increment);
    }

    /// Append a HEADERS/CONTINUATION fragment to the reassembly buffer.
    pub fn push_header_fragment(&mut self, fragment: &[u8]) {
        self.header_block.extend_from_slice(fragment);
    }

    pub fn defer_end_stream(&mut self) {
        self.pending_end_stream = true;
    }

    #[must_use]
    pub fn headers_complete(&self) -> bool {
        self.headers_complete
    }

    /// Decode the reassembled header block (called once END_HEADERS is
    /// seen), validate `:status` and the header-list-size budget, and
    /// (per `pending_end_stream`) finish the response immediately if the
    /// HEADERS carried END_STREAM.
    pub fn finish_headers(&mut self, decoder: &mut hpack::Decoder) -> Result<(), ProtoError> {
        let block = std::mem::take(&mut self.header_block);
        let headers = decoder.decode(&block)?;

        let list_size = headers.list_size();
        if let Some(limit) = self.max_header_list_size {
            if list_size > limit as usize {
                return Err(ProtoError::Stream(Reason::RefusedStream));
            }
        }

        let mut status = None;
        let mut regular = HeaderList::with_capacity(headers.len());
        for (name, value) in headers {
            if name.starts_with(':') {
                if name != ":status" {
                    return Err(ProtoError::Stream(Reason::ProtocolError));
                }
                let parsed: u16 = value.parse().map_err(|_| ProtoError::Stream(Reason::ProtocolError))?;
                if !(100..=999).contains(&parsed) {
                    return Err(ProtoError::Stream(Reason::ProtocolError));
                }
                status = Some(parsed);
            } else {
                regular.push(name, value);
            }
        }

        self.status = Some(status.ok_or(ProtoError::Stream(Reason::ProtocolError))?);
        self.response_headers = regular;
        self.headers_complete = true;

        if self.pending_end_stream {
            self.finish();
        }
        Ok(())
    }

    /// Append response body bytes. Callers must only invoke this once
    /// `headers_complete()` is true; earlier DATA is a protocol error.
    pub fn append_body(&mut self, data: &[u8]) -> Result<(), ProtoError> {
        if !self.headers_complete {
            return Err(ProtoError::Stream(Reason::ProtocolError));
        }
        if self.max_response_body_bytes > 0
            && self.body.len() as u64 + data.len() as u64 > self.max_response_body_bytes
        {
            return Err(ProtoError::Stream(Reason::Cancel));
        }
        self.body.extend_from_slice(data);
        Ok(())
    }

    pub fn finish(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            _ => StreamState::Closed,
        };
        let response = Response {
            status: self.status.unwrap_or(0),
            headers: std::mem::take(&mut self.response_headers),
            body: std::mem::take(&mut self.body).freeze(),
            elapsed: self.started_at.elapsed(),
            error: None,
        };
        trace!("stream {} complete: {} {}B", self.id, response.status, response.body.len());
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Ok(response));
        }
    }

    pub fn fail(&mut self, err: Error) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.state = StreamState::Closed;
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Err(err));
        }
    }

    pub fn cancel(&mut self) {
        self.fail(Error::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_stream() -> (Stream, oneshot::Receiver<crate::error::Result<Response>>) {
        let (tx, rx) = oneshot::channel();
        (Stream::new(1, 65_535, 65_535, 0, None, tx), rx)
    }

    #[test]
    fn data_before_headers_is_a_protocol_error() {
        let (mut stream, _rx) = new_stream();
        assert!(stream.append_body(b"x").is_err());
    }

    #[test]
    fn window_overflow_is_rejected() {
        let (mut stream, _rx) = new_stream();
        assert!(stream.credit_send(u32::MAX).is_err());
    }

    #[test]
    fn apply_delta_bounds_checked() {
        let (mut stream, _rx) = new_stream();
        assert!(stream.apply_window_delta(i64::from(i32::MAX)).is_ok());
        assert!(stream.apply_window_delta(i64::from(i32::MAX)).is_err());
    }

    #[test]
    fn finish_is_idempotent() {
        let (mut stream, rx) = new_stream();
        stream.headers_complete = true;
        stream.status = Some(200);
        stream.finish();
        stream.finish();
        assert!(rx.try_recv().is_ok());
    }
}
