//! Transport parameters (spec section 6): the TLS extension `0xffa5` carrying per-endpoint QUIC
//! configuration, exchanged during the handshake.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;

use crate::cid::ConnectionId;
use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};
use crate::error::{TransportError, TransportErrorCode};
use crate::VarInt;

macro_rules! tp_ids {
    ($($name:ident = $val:expr,)*) => {
        #[derive(Debug, Copy, Clone, Eq, PartialEq)]
        #[allow(non_camel_case_types)]
        enum TransportParameterId {
            $($name,)*
            Unknown(u64),
        }

        impl TransportParameterId {
            fn code(self) -> u64 {
                match self {
                    $(Self::$name => $val,)*
                    Self::Unknown(x) => x,
                }
            }
            fn from_code(x: u64) -> Self {
                match x {
                    $($val => Self::$name,)*
                    x => Self::Unknown(x),
                }
            }
        }
    };
}

tp_ids! {
    OriginalDestinationConnectionId = 0x00,
    MaxIdleTimeout = 0x01,
    StatelessResetToken = 0x02,
    MaxUdpPayloadSize = 0x03,
    InitialMaxData = 0x04,
    InitialMaxStreamDataBidiLocal = 0x05,
    InitialMaxStreamDataBidiRemote = 0x06,
    InitialMaxStreamDataUni = 0x07,
    InitialMaxStreamsBidi = 0x08,
    InitialMaxStreamsUni = 0x09,
    AckDelayExponent = 0x0a,
    MaxAckDelay = 0x0b,
    DisableActiveMigration = 0x0c,
    PreferredAddress = 0x0d,
    ActiveConnectionIdLimit = 0x0e,
}

/// A full set of negotiated transport parameters, local or peer
#[derive(Debug, Clone)]
pub struct TransportParameters {
    pub original_dcid: Option<ConnectionId>,
    pub max_idle_timeout: u64,
    pub stateless_reset_token: Option<[u8; 16]>,
    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,
    pub max_ack_delay: u64,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            original_dcid: None,
            max_idle_timeout: 0,
            stateless_reset_token: None,
            max_udp_payload_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            active_connection_id_limit: 2,
        }
    }
}

impl TransportParameters {
    pub fn write(&self, buf: &mut BytesMut) {
        macro_rules! write_varint {
            ($id:expr, $val:expr) => {
                if $val != 0 {
                    buf.write_var(TransportParameterId::$id.code());
                    let v = VarInt::from_u64($val).unwrap_or(VarInt::MAX);
                    buf.write_var(v.size() as u64);
                    buf.write(v);
                }
            };
        }

        if let Some(cid) = &self.original_dcid {
            buf.write_var(TransportParameterId::OriginalDestinationConnectionId.code());
            buf.write_var(cid.len() as u64);
            buf.put_slice(cid);
        }
        write_varint!(MaxIdleTimeout, self.max_idle_timeout);
        if let Some(token) = &self.stateless_reset_token {
            buf.write_var(TransportParameterId::StatelessResetToken.code());
            buf.write_var(16);
            buf.put_slice(token);
        }
        write_varint!(MaxUdpPayloadSize, self.max_udp_payload_size);
        write_varint!(InitialMaxData, self.initial_max_data);
        write_varint!(InitialMaxStreamDataBidiLocal, self.initial_max_stream_data_bidi_local);
        write_varint!(InitialMaxStreamDataBidiRemote, self.initial_max_stream_data_bidi_remote);
        write_varint!(InitialMaxStreamDataUni, self.initial_max_stream_data_uni);
        write_varint!(InitialMaxStreamsBidi, self.initial_max_streams_bidi);
        write_varint!(InitialMaxStreamsUni, self.initial_max_streams_uni);
        if self.ack_delay_exponent != 3 {
            write_varint!(AckDelayExponent, self.ack_delay_exponent);
        }
        if self.max_ack_delay != 25 {
            write_varint!(MaxAckDelay, self.max_ack_delay);
        }
        if self.disable_active_migration {
            buf.write_var(TransportParameterId::DisableActiveMigration.code());
            buf.write_var(0);
        }
        write_varint!(ActiveConnectionIdLimit, self.active_connection_id_limit);

        // Emit a "grease" transport parameter per spec section 6: an unknown type of the form
        // `0xff00 | r` with a few random bytes of payload. Any reserved-pattern type works; the
        // low byte just has to vary so two connections don't look identical on the wire.
        let mut rng = rand::thread_rng();
        let grease_id = 0x1f00 * (1 + rng.next_u64() % 0x20) + 0x1f; // 31*N + 27 per RFC 9000 appx A
        let mut payload = vec![0u8; (rng.next_u32() % 16) as usize];
        rng.fill_bytes(&mut payload);
        buf.write_var(grease_id);
        buf.write_var(payload.len() as u64);
        buf.put_slice(&payload);
    }

    pub fn read(buf: &mut Bytes) -> Result<Self, TransportError> {
        let mut params = TransportParameters::default();
        let mut seen = std::collections::HashSet::new();

        macro_rules! bad(($reason:expr) => {
            return Err(TransportError::new(TransportErrorCode::TransportParameter, None, $reason))
        });

        while buf.has_remaining() {
            let id = buf
                .get_var()
                .map_err(|_| TransportError::new(TransportErrorCode::TransportParameter, None, "truncated"))?;
            let id = TransportParameterId::from_code(id);
            let len = buf
                .get_var()
                .map_err(|_| TransportError::new(TransportErrorCode::TransportParameter, None, "truncated"))? as usize;
            if buf.remaining() < len {
                bad!("truncated parameter value");
            }
            if !matches!(id, TransportParameterId::Unknown(_)) && !seen.insert(id) {
                bad!("duplicate transport parameter");
            }
            let mut value = buf.split_to(len);

            match id {
                TransportParameterId::OriginalDestinationConnectionId => {
                    if len > 20 {
                        bad!("oversize connection id");
                    }
                    params.original_dcid = Some(ConnectionId::new(&value));
                }
                TransportParameterId::MaxIdleTimeout => params.max_idle_timeout = read_varint(&mut value)?,
                TransportParameterId::StatelessResetToken => {
                    if len != 16 {
                        bad!("malformed stateless reset token");
                    }
                    let mut token = [0u8; 16];
                    value.copy_to_slice(&mut token);
                    params.stateless_reset_token = Some(token);
                }
                TransportParameterId::MaxUdpPayloadSize => {
                    let v = read_varint(&mut value)?;
                    if v < 1200 {
                        bad!("max_udp_payload_size below minimum");
                    }
                    params.max_udp_payload_size = v;
                }
                TransportParameterId::InitialMaxData => params.initial_max_data = read_varint(&mut value)?,
                TransportParameterId::InitialMaxStreamDataBidiLocal => {
                    params.initial_max_stream_data_bidi_local = read_varint(&mut value)?
                }
                TransportParameterId::InitialMaxStreamDataBidiRemote => {
                    params.initial_max_stream_data_bidi_remote = read_varint(&mut value)?
                }
                TransportParameterId::InitialMaxStreamDataUni => {
                    params.initial_max_stream_data_uni = read_varint(&mut value)?
                }
                TransportParameterId::InitialMaxStreamsBidi => {
                    params.initial_max_streams_bidi = read_varint(&mut value)?
                }
                TransportParameterId::InitialMaxStreamsUni => {
                    params.initial_max_streams_uni = read_varint(&mut value)?
                }
                TransportParameterId::AckDelayExponent => {
                    let v = read_varint(&mut value)?;
                    if v > 20 {
                        bad!("ack_delay_exponent out of range");
                    }
                    params.ack_delay_exponent = v;
                }
                TransportParameterId::MaxAckDelay => {
                    let v = read_varint(&mut value)?;
                    if v >= (1 << 14) {
                        bad!("max_ack_delay out of range");
                    }
                    params.max_ack_delay = v;
                }
                TransportParameterId::DisableActiveMigration => params.disable_active_migration = true,
                TransportParameterId::ActiveConnectionIdLimit => {
                    params.active_connection_id_limit = read_varint(&mut value)?
                }
                // Preferred address and any genuinely unrecognized type: ignored per spec
                // section 6 ("An unknown type is ignored").
                TransportParameterId::PreferredAddress | TransportParameterId::Unknown(_) => {}
            }
        }
        Ok(params)
    }
}

fn read_varint(buf: &mut Bytes) -> Result<u64, TransportError> {
    buf.get_var()
        .map_err(|_: UnexpectedEnd| TransportError::new(TransportErrorCode::TransportParameter, None, "malformed varint"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut params = TransportParameters::default();
        params.initial_max_data = 1_000_000;
        params.initial_max_streams_bidi = 10;
        params.active_connection_id_limit = 4;
        params.original_dcid = Some(ConnectionId::new(&[1, 2, 3, 4]));

        let mut buf = BytesMut::new();
        params.write(&mut buf);
        let mut bytes: Bytes = buf.freeze();
        let decoded = TransportParameters::read(&mut bytes).unwrap();

        assert_eq!(decoded.initial_max_data, 1_000_000);
        assert_eq!(decoded.initial_max_streams_bidi, 10);
        assert_eq!(decoded.active_connection_id_limit, 4);
        assert_eq!(decoded.original_dcid.unwrap().to_vec(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn duplicate_is_rejected() {
        let mut buf = BytesMut::new();
        buf.write_var(TransportParameterId::InitialMaxData.code());
        buf.write_var(1);
        buf.put_u8(5);
        buf.write_var(TransportParameterId::InitialMaxData.code());
        buf.write_var(1);
        buf.put_u8(5);
        let mut bytes = buf.freeze();
        assert!(TransportParameters::read(&mut bytes).is_err());
    }

    #[test]
    fn max_udp_payload_size_below_minimum_rejected() {
        let mut buf = BytesMut::new();
        buf.write_var(TransportParameterId::MaxUdpPayloadSize.code());
        buf.write_var(1);
        buf.put_u8(100);
        let mut bytes = buf.freeze();
        assert!(TransportParameters::read(&mut bytes).is_err());
    }
}
