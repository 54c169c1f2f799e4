//! Class B beacon payload construction.
//!
//! Layout and field sizes follow the LoRaWAN Class B beacon frame as
//! emitted by the reference packet forwarder: a network-common part
//! (RFU1, time, crc1) followed by a gateway-specific part (infodesc,
//! latitude, longitude, RFU2, crc2). RFU1/RFU2 sizes vary with the
//! beacon spreading factor so that the frame's time-on-air matches the
//! LoRaWAN Class B specification for each datarate.

use byteorder::{ByteOrder, LittleEndian};

/// Spreading factor a beacon may be sent at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconSf {
    Sf8,
    Sf9,
    Sf10,
    Sf12,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("latitude {0} out of range [-90, 90]")]
    InvalidLatitude(f64),
    #[error("longitude {0} out of range [-180, 180]")]
    InvalidLongitude(f64),
}

/// Number of (RFU1, RFU2) bytes for each supported spreading factor.
fn rfu_sizes(sf: BeaconSf) -> (usize, usize) {
    match sf {
        BeaconSf::Sf8 => (1, 3),
        BeaconSf::Sf9 => (2, 0),
        BeaconSf::Sf10 => (3, 1),
        BeaconSf::Sf12 => (5, 3),
    }
}

/// Total beacon payload size in bytes for a given spreading factor.
pub fn payload_size(sf: BeaconSf) -> usize {
    let (rfu1, rfu2) = rfu_sizes(sf);
    rfu1 + 4 + 2 + 7 + rfu2 + 2
}

/// Builds the binary beacon payload for a given GPS time (seconds since
/// the GPS epoch), gateway position, and `infodesc` byte.
///
/// `gps_seconds` is truncated to `u32` as the beacon frame carries only
/// the low 32 bits of GPS seconds.
pub fn build_payload(
    sf: BeaconSf,
    gps_seconds: u32,
    infodesc: u8,
    ref_lat: f64,
    ref_lon: f64,
) -> Result<Vec<u8>, Error> {
    if !(-90.0..=90.0).contains(&ref_lat) {
        return Err(Error::InvalidLatitude(ref_lat));
    }
    if !(-180.0..=180.0).contains(&ref_lon) {
        return Err(Error::InvalidLongitude(ref_lon));
    }

    let (rfu1, rfu2) = rfu_sizes(sf);
    let mut payload = vec![0u8; payload_size(sf)];
    let mut idx = 0usize;

    // RFU1: all zero.
    idx += rfu1;

    // time, little-endian.
    LittleEndian::write_u32(&mut payload[idx..idx + 4], gps_seconds);
    idx += 4;

    // crc1 over RFU1 + time.
    let crc1 = crc16_ccitt(&payload[0..idx]);
    LittleEndian::write_u16(&mut payload[idx..idx + 2], crc1);
    idx += 2;

    let gw_part_start = idx;

    payload[idx] = infodesc;
    idx += 1;

    let lat_fixed = clamp_fixed_point(ref_lat / 90.0);
    payload[idx] = (lat_fixed & 0xFF) as u8;
    payload[idx + 1] = ((lat_fixed >> 8) & 0xFF) as u8;
    payload[idx + 2] = ((lat_fixed >> 16) & 0xFF) as u8;
    idx += 3;

    let lon_fixed = clamp_fixed_point(ref_lon / 180.0);
    payload[idx] = (lon_fixed & 0xFF) as u8;
    payload[idx + 1] = ((lon_fixed >> 8) & 0xFF) as u8;
    payload[idx + 2] = ((lon_fixed >> 16) & 0xFF) as u8;
    idx += 3;

    // RFU2: all zero.
    idx += rfu2;

    let crc2 = crc16_ccitt(&payload[gw_part_start..idx]);
    LittleEndian::write_u16(&mut payload[idx..idx + 2], crc2);

    Ok(payload)
}

/// Converts a fraction of a hemisphere (lat/90 or lon/180) to the 24-bit
/// signed fixed-point representation used by the beacon frame, clamped
/// to +-0x7FFFFF as the spec requires (+90N/+180E are represented as
/// 89.99999/179.99999).
fn clamp_fixed_point(fraction: f64) -> i32 {
    let raw = (fraction * (1i64 << 23) as f64) as i64;
    raw.clamp(-0x0080_0000, 0x007F_FFFF) as i32
}

/// CRC-16/CCITT: poly 0x1021, init 0x0000, no input/output reflection,
/// no final xor.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    const POLY: u16 = 0x1021;
    let mut x: u16 = 0x0000;
    for &byte in data {
        x ^= (byte as u16) << 8;
        for _ in 0..8 {
            x = if x & 0x8000 != 0 { (x << 1) ^ POLY } else { x << 1 };
        }
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_known_vectors() {
        // CRC-16/XMODEM (poly 0x1021, init 0x0000) check value for "123456789".
        assert_eq!(crc16_ccitt(b"123456789"), 0x31C3);
        assert_eq!(crc16_ccitt(&[]), 0x0000);
    }

    #[test]
    fn payload_sizes_match_reference() {
        assert_eq!(payload_size(BeaconSf::Sf8), 1 + 4 + 2 + 7 + 3 + 2);
        assert_eq!(payload_size(BeaconSf::Sf9), 2 + 4 + 2 + 7 + 0 + 2);
        assert_eq!(payload_size(BeaconSf::Sf10), 3 + 4 + 2 + 7 + 1 + 2);
        assert_eq!(payload_size(BeaconSf::Sf12), 5 + 4 + 2 + 7 + 3 + 2);
    }

    #[test]
    fn time_field_and_crc1_at_known_offsets() {
        let sf = BeaconSf::Sf9;
        let payload = build_payload(sf, 0x1234_5678, 0, 45.5, -122.5).unwrap();
        let (rfu1, _rfu2) = rfu_sizes(sf);
        let time_bytes = &payload[rfu1..rfu1 + 4];
        assert_eq!(LittleEndian::read_u32(time_bytes), 0x1234_5678);
        let crc1 = LittleEndian::read_u16(&payload[rfu1 + 4..rfu1 + 6]);
        assert_eq!(crc1, crc16_ccitt(&payload[0..rfu1 + 4]));
    }

    #[test]
    fn crc2_covers_gateway_specific_part() {
        let sf = BeaconSf::Sf8;
        let payload = build_payload(sf, 1000, 7, 1.0, 1.0).unwrap();
        let (rfu1, rfu2) = rfu_sizes(sf);
        let gw_start = rfu1 + 4 + 2;
        let gw_end = gw_start + 7 + rfu2;
        let crc2 = LittleEndian::read_u16(&payload[gw_end..gw_end + 2]);
        assert_eq!(crc2, crc16_ccitt(&payload[gw_start..gw_end]));
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(build_payload(BeaconSf::Sf8, 0, 0, 91.0, 0.0).is_err());
        assert!(build_payload(BeaconSf::Sf8, 0, 0, 0.0, 181.0).is_err());
    }

    #[test]
    fn latitude_clamped_at_plus_90() {
        let fixed = clamp_fixed_point(90.0 / 90.0);
        assert_eq!(fixed, 0x007F_FFFF);
    }
}
