//! RFC 7540 §6.5 SETTINGS: parse/validate the peer's frame, apply it to a
//! tracked settings map, and serialize this client's own SETTINGS.

use crate::enums::SettingsParameter;
use crate::error::{ProtoError, Reason};
use bytes::{BufMut, Bytes, BytesMut};
use enum_map::{enum_map, EnumMap};
use num_traits::FromPrimitive;

pub const MAX_SETTING_VALUE: u32 = (1u32 << 31) - 1;

/// One peer's settings, with RFC 7540 §11.3 defaults.
#[derive(Debug, Clone)]
pub struct PeerSettings {
    values: EnumMap<SettingsParameter, u32>,
}

/// What changed as a result of applying a SETTINGS frame — the connection
/// engine uses this to know whether it must walk every active stream's
/// send window or mark the HPACK encoder's table size pending.
#[derive(Debug, Clone, Copy, Default)]
pub struct SettingsDelta {
    pub initial_window_size_delta: Option<i64>,
    pub header_table_size_changed: Option<u32>,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            values: enum_map! {
                SettingsParameter::HeaderTableSize => 4096,
                SettingsParameter::EnablePush => 1,
                SettingsParameter::MaxConcurrentStreams => u32::MAX,
                SettingsParameter::InitialWindowSize => 65_535,
                SettingsParameter::MaxFrameSize => 16_384,
                SettingsParameter::MaxHeaderListSize => u32::MAX,
            },
        }
    }
}

impl PeerSettings {
    #[must_use]
    pub fn get(&self, key: SettingsParameter) -> u32 {
        self.values[key]
    }

    #[must_use]
    pub fn initial_window_size(&self) -> u32 {
        self.get(SettingsParameter::InitialWindowSize)
    }

    #[must_use]
    pub fn max_frame_size(&self) -> u32 {
        self.get(SettingsParameter::MaxFrameSize)
    }

    #[must_use]
    pub fn max_concurrent_streams(&self) -> u32 {
        self.get(SettingsParameter::MaxConcurrentStreams)
    }

    #[must_use]
    pub fn header_table_size(&self) -> u32 {
        self.get(SettingsParameter::HeaderTableSize)
    }

    /// Parse a SETTINGS payload into `(id, value)` pairs. Unknown
    /// identifiers are not errors — they are dropped here, before `apply`
    /// ever sees them, per RFC 7540 §6.5.2.
    pub fn parse(payload: &[u8]) -> Result<Vec<(SettingsParameter, u32)>, ProtoError> {
        if payload.len() % 6 != 0 {
            return Err(ProtoError::Connection(Reason::FrameSizeError));
        }
        let mut entries = Vec::with_capacity(payload.len() / 6);
        for chunk in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([chunk[0], chunk[1]]);
            let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
            if let Some(param) = SettingsParameter::from_u16(id) {
                entries.push((param, value));
            }
        }
        Ok(entries)
    }

    /// Validate and apply parsed entries, returning what changed.
    pub fn apply(&mut self, entries: &[(SettingsParameter, u32)]) -> Result<SettingsDelta, ProtoError> {
        let mut delta = SettingsDelta::default();
        for &(param, mut value) in entries {
            match param {
                SettingsParameter::EnablePush => {
                    if value > 1 {
                        return Err(ProtoError::Connection(Reason::ProtocolError));
                    }
                }
                SettingsParameter::InitialWindowSize => {
                    if value > MAX_SETTING_VALUE {
                        return Err(ProtoError::Connection(Reason::FlowControlError));
                    }
                    let previous = self.initial_window_size();
                    delta.initial_window_size_delta =
                        Some(i64::from(value) - i64::from(previous));
                }
                SettingsParameter::MaxFrameSize => {
                    if !(16_384..=(1 << 24) - 1).contains(&value) {
                        return Err(ProtoError::Connection(Reason::ProtocolError));
                    }
                }
                SettingsParameter::HeaderTableSize => {
                    value = value.min(MAX_SETTING_VALUE);
                    if value != self.header_table_size() {
                        delta.header_table_size_changed = Some(value);
                    }
                }
                SettingsParameter::MaxConcurrentStreams | SettingsParameter::MaxHeaderListSize => {
                    value = value.min(MAX_SETTING_VALUE);
                }
            }
            self.values[param] = value;
        }
        Ok(delta)
    }
}

/// Serialize this client's initial SETTINGS frame payload: always
/// `ENABLE_PUSH=0` and `MAX_CONCURRENT_STREAMS=100`, plus any non-default
/// `INITIAL_WINDOW_SIZE`/`MAX_HEADER_LIST_SIZE` the options carry.
#[must_use]
pub fn serialize_client_settings(options: &crate::config::Options) -> Bytes {
    let mut entries = vec![
        (SettingsParameter::EnablePush, 0u32),
        (SettingsParameter::MaxConcurrentStreams, 100),
    ];
    if options.initial_window_size != 65_535 {
        entries.push((SettingsParameter::InitialWindowSize, options.initial_window_size));
    }
    if let Some(limit) = options.max_header_list_size {
        entries.push((SettingsParameter::MaxHeaderListSize, limit));
    }
    if options.header_table_size != 4096 {
        entries.push((SettingsParameter::HeaderTableSize, options.header_table_size));
    }

    let mut buf = BytesMut::with_capacity(entries.len() * 6);
    for (param, value) in entries {
        buf.put_u16(param as u16);
        buf.put_u32(value);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_misaligned_payload() {
        assert!(PeerSettings::parse(&[0, 1, 2]).is_err());
    }

    #[test]
    fn parse_skips_unknown_identifiers() {
        let payload = [0, 0xff, 0, 0, 0, 1];
        assert_eq!(PeerSettings::parse(&payload).unwrap(), vec![]);
    }

    #[test]
    fn apply_rejects_bad_enable_push() {
        let mut settings = PeerSettings::default();
        let err = settings.apply(&[(SettingsParameter::EnablePush, 2)]).unwrap_err();
        assert_eq!(err.reason(), Reason::ProtocolError);
    }

    #[test]
    fn apply_rejects_frame_size_out_of_bounds() {
        let mut settings = PeerSettings::default();
        assert!(settings.apply(&[(SettingsParameter::MaxFrameSize, 100)]).is_err());
        assert!(settings.apply(&[(SettingsParameter::MaxFrameSize, 1 << 25)]).is_err());
    }

    #[test]
    fn apply_reports_initial_window_delta() {
        let mut settings = PeerSettings::default();
        let delta = settings.apply(&[(SettingsParameter::InitialWindowSize, 1024)]).unwrap();
        assert_eq!(delta.initial_window_size_delta, Some(1024 - 65_535));
    }

    #[test]
    fn apply_clamps_oversized_header_table_size() {
        let mut settings = PeerSettings::default();
        let delta = settings
            .apply(&[(SettingsParameter::HeaderTableSize, u32::MAX)])
            .unwrap();
        assert_eq!(settings.header_table_size(), MAX_SETTING_VALUE);
        assert_eq!(delta.header_table_size_changed, Some(MAX_SETTING_VALUE));
    }

    #[test]
    fn client_settings_always_disable_push() {
        let options = crate::config::Options::default();
        let payload = serialize_client_settings(&options);
        let entries = PeerSettings::parse(&payload).unwrap();
        assert!(entries.contains(&(SettingsParameter::EnablePush, 0)));
        assert!(entries.contains(&(SettingsParameter::MaxConcurrentStreams, 100)));
    }
}
