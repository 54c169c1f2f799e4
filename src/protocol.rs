//! Semtech UDP protocol (protocol version 2) framing: the fixed-size
//! headers in front of every PUSH_DATA/PUSH_ACK/PULL_DATA/PULL_RESP/
//! PULL_ACK/TX_ACK datagram, plus the 16-bit random tokens used to
//! match requests to acknowledgements.

use crate::error::DecodeError;
use rand::Rng;
use std::fmt;

pub const PROTOCOL_VERSION: u8 = 2;

pub const PKT_PUSH_DATA: u8 = 0;
pub const PKT_PUSH_ACK: u8 = 1;
pub const PKT_PULL_DATA: u8 = 2;
pub const PKT_PULL_RESP: u8 = 3;
pub const PKT_PULL_ACK: u8 = 4;
pub const PKT_TX_ACK: u8 = 5;

pub const UNIX_GPS_EPOCH_OFFSET: i64 = 315_964_800;

pub const NB_PKT_MAX: usize = 24;
pub const TX_BUFF_SIZE: usize = 540 * NB_PKT_MAX + 30 + 200;

/// 64-bit gateway MAC, transmitted as two 32-bit network-order halves.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 8]);

impl MacAddress {
    pub const fn nil() -> Self {
        MacAddress([0; 8])
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        MacAddress(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, DecodeError> {
        let hex_str = hex_str.trim_start_matches("0x");
        if hex_str.len() != 16 {
            return Err(DecodeError::MalformedFrame);
        }
        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let slice = &hex_str[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(slice, 16).map_err(|_| DecodeError::MalformedFrame)?;
        }
        Ok(MacAddress(bytes))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

/// A random 16-bit token as used on PULL_DATA/PUSH_DATA requests.
pub fn random_token() -> u16 {
    rand::thread_rng().gen()
}

/// Builds a 12-byte PULL_DATA datagram (no JSON body).
pub fn encode_pull_data(token: u16, mac: MacAddress) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.push(PROTOCOL_VERSION);
    buf.extend_from_slice(&token.to_be_bytes());
    buf.push(PKT_PULL_DATA);
    buf.extend_from_slice(mac.as_bytes());
    buf
}

/// Prepends the fixed PUSH_DATA header to a caller-assembled JSON body.
pub fn encode_push_data_header(buf: &mut Vec<u8>, token: u16, mac: MacAddress) {
    buf.push(PROTOCOL_VERSION);
    buf.extend_from_slice(&token.to_be_bytes());
    buf.push(PKT_PUSH_DATA);
    buf.extend_from_slice(mac.as_bytes());
}

/// Builds a TX_ACK datagram: 12-byte header optionally followed by a
/// JSON body (omitted entirely when `json_body` is `None`, matching the
/// "empty body on success" rule).
pub fn encode_tx_ack(token: u16, mac: MacAddress, json_body: Option<&[u8]>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + json_body.map_or(0, <[u8]>::len));
    buf.push(PROTOCOL_VERSION);
    buf.extend_from_slice(&token.to_be_bytes());
    buf.push(PKT_TX_ACK);
    buf.extend_from_slice(mac.as_bytes());
    if let Some(body) = json_body {
        buf.extend_from_slice(body);
    }
    buf
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    PushAck { token: u16 },
    PullAck { token: u16 },
    PullResp { token: u16, json: &'a [u8] },
}

/// Parses an inbound datagram's header. Unrecognized identifiers or a
/// version mismatch are reported as [`DecodeError::MalformedFrame`] and
/// should simply be logged and ignored by the caller, never treated as
/// fatal.
pub fn parse_frame(buf: &[u8]) -> Result<Frame<'_>, DecodeError> {
    if buf.len() < 4 || buf[0] != PROTOCOL_VERSION {
        return Err(DecodeError::MalformedFrame);
    }
    let token = u16::from_be_bytes([buf[1], buf[2]]);
    match buf[3] {
        PKT_PUSH_ACK => Ok(Frame::PushAck { token }),
        PKT_PULL_ACK => Ok(Frame::PullAck { token }),
        PKT_PULL_RESP => Ok(Frame::PullResp {
            token,
            json: &buf[4..],
        }),
        _ => Err(DecodeError::MalformedFrame),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_round_trips_through_hex() {
        let mac = MacAddress::from_hex("0011223344556677").unwrap();
        assert_eq!(mac.as_bytes(), &[0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);
        assert_eq!(mac.to_string(), "0011223344556677");
    }

    #[test]
    fn pull_data_frame_layout() {
        let mac = MacAddress::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        let buf = encode_pull_data(0xABCD, mac);
        assert_eq!(buf.len(), 12);
        assert_eq!(buf[0], PROTOCOL_VERSION);
        assert_eq!(u16::from_be_bytes([buf[1], buf[2]]), 0xABCD);
        assert_eq!(buf[3], PKT_PULL_DATA);
        assert_eq!(&buf[4..12], mac.as_bytes());
    }

    #[test]
    fn parse_push_ack() {
        let buf = [PROTOCOL_VERSION, 0x12, 0x34, PKT_PUSH_ACK];
        assert_eq!(parse_frame(&buf).unwrap(), Frame::PushAck { token: 0x1234 });
    }

    #[test]
    fn rejects_bad_version() {
        let buf = [9, 0, 0, PKT_PUSH_ACK];
        assert!(parse_frame(&buf).is_err());
    }

    #[test]
    fn tx_ack_omits_body_on_success() {
        let mac = MacAddress::nil();
        let buf = encode_tx_ack(42, mac, None);
        assert_eq!(buf.len(), 12);
    }
}
