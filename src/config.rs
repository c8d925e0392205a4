//! Engine configuration: the tunables listed in the external-interface
//! defaults table, with bounds enforced at construction.

use std::time::Duration;

/// Construction-time options for an [`crate::Connection`].
///
/// Defaults match the design-level configuration table: a 4096-octet HPACK
/// table, 16 KiB frames, a 65 535-octet initial flow control window, push
/// disabled, a 100 MiB response body cap, a 5 s SETTINGS ACK timeout and a
/// 30 s keep-alive PING interval.
#[derive(Debug, Clone)]
pub struct Options {
    /// `SETTINGS_HEADER_TABLE_SIZE` this client advertises for its own
    /// dynamic table (governs the peer's encoder, i.e. our decoder budget).
    pub header_table_size: u32,
    /// Whether to accept server push. The engine never sets this to `true`
    /// functionally (PUSH_PROMISE is always refused) but the flag still
    /// controls whether receiving one is a protocol error or a refusal.
    pub enable_push: bool,
    /// `SETTINGS_INITIAL_WINDOW_SIZE` advertised by this client.
    pub initial_window_size: u32,
    /// `SETTINGS_MAX_FRAME_SIZE` advertised by this client.
    pub max_frame_size: u32,
    /// `SETTINGS_MAX_HEADER_LIST_SIZE` advertised by this client, if bounded.
    pub max_header_list_size: Option<u32>,
    /// Maximum number of concurrent streams this client advertises it will
    /// accept pushes or responses against (not a limit on streams *we*
    /// open; that's bounded by the peer's own setting).
    pub max_concurrent_streams: u32,
    /// Decompression-bomb cap: maximum total decoded header bytes (sum of
    /// name+value lengths) per header block. Not part of RFC 7541, a local
    /// safety budget.
    pub max_decoded_header_bytes: usize,
    /// Maximum accumulated response body size. `0` means unlimited.
    pub max_response_body_bytes: u64,
    /// How long to wait for the peer's SETTINGS ACK during `Initialize`.
    pub settings_ack_timeout: Duration,
    /// Interval between keep-alive PING frames.
    pub keep_alive_interval: Duration,
}

impl Options {
    pub const MIN_MAX_FRAME_SIZE: u32 = 16_384;
    pub const MAX_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;
    pub const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

    /// Clamp user-supplied values into the bounds §6 documents, rather than
    /// rejecting construction outright — only values derived from the peer
    /// are treated as hard errors.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.max_frame_size = self
            .max_frame_size
            .clamp(Self::MIN_MAX_FRAME_SIZE, Self::MAX_MAX_FRAME_SIZE);
        self.initial_window_size = self.initial_window_size.min(Self::MAX_WINDOW_SIZE);
        self.header_table_size = self.header_table_size.min(Self::MAX_WINDOW_SIZE);
        if let Some(limit) = self.max_header_list_size.as_mut() {
            *limit = (*limit).min(Self::MAX_WINDOW_SIZE);
        }
        self.max_decoded_header_bytes = self.max_decoded_header_bytes.max(1);
        self
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: false,
            initial_window_size: 65_535,
            max_frame_size: Self::MIN_MAX_FRAME_SIZE,
            max_header_list_size: None,
            max_concurrent_streams: 100,
            max_decoded_header_bytes: 128 * 1024,
            max_response_body_bytes: 100 * 1024 * 1024,
            settings_ack_timeout: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(30),
        }
        .normalized()
    }
}
