//! The response handed back from `Connection::send_request`.

use crate::error::Error;
use crate::headers::HeaderList;
use bytes::Bytes;
use std::time::Duration;

/// A completed HTTP/2 response. Non-2xx statuses are not an error — only
/// transport/protocol failures surface through `Connection::send_request`'s
/// `Result`. `error` stays `None` on every response this crate constructs
/// today; the slot exists so a caller that assembles partial responses out
/// of band (e.g. after a trailers-level failure) has somewhere to attach one
/// without changing the type.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderList,
    pub body: Bytes,
    pub elapsed: Duration,
    pub error: Option<Error>,
}

impl Response {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
