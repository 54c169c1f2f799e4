//! RX/TX packet domain types and their Semtech UDP JSON wire
//! representations (the `rxpk`/`txpk`/`stat` objects of §4 and §6).

use crate::error::DecodeError;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modulation {
    Lora,
    Fsk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bandwidth {
    Bw125,
    Bw250,
    Bw500,
}

impl Bandwidth {
    pub fn hz(self) -> u32 {
        match self {
            Bandwidth::Bw125 => 125_000,
            Bandwidth::Bw250 => 250_000,
            Bandwidth::Bw500 => 500_000,
        }
    }

    fn khz(self) -> u32 {
        self.hz() / 1000
    }

    fn from_khz(khz: u32) -> Result<Self, DecodeError> {
        match khz {
            125 => Ok(Bandwidth::Bw125),
            250 => Ok(Bandwidth::Bw250),
            500 => Ok(Bandwidth::Bw500),
            other => Err(DecodeError::InvalidBandwidth(other)),
        }
    }
}

/// LoRa spreading factor, datarate-as-sent-on-the-wire for FSK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRate {
    Lora { spreading_factor: u8, bandwidth: Bandwidth },
    Fsk { bps: u32 },
}

impl DataRate {
    pub fn to_wire_string(self) -> DatrJson {
        match self {
            DataRate::Lora { spreading_factor, bandwidth } => {
                DatrJson::Lora(format!("SF{spreading_factor}BW{}", bandwidth.khz()))
            }
            DataRate::Fsk { bps } => DatrJson::Fsk(bps),
        }
    }

    pub fn from_wire(value: &DatrJson) -> Result<Self, DecodeError> {
        match value {
            DatrJson::Lora(s) => parse_lora_datr(s),
            DatrJson::Fsk(bps) => Ok(DataRate::Fsk { bps: *bps }),
        }
    }
}

fn parse_lora_datr(s: &str) -> Result<DataRate, DecodeError> {
    let s = s.strip_prefix("SF").ok_or_else(|| DecodeError::invalid_data_rate(s))?;
    let bw_pos = s.find("BW").ok_or_else(|| DecodeError::invalid_data_rate(s))?;
    let sf: u8 = s[..bw_pos].parse().map_err(|_| DecodeError::invalid_data_rate(s))?;
    if !(5..=12).contains(&sf) {
        return Err(DecodeError::invalid_data_rate(s));
    }
    let bw_khz: u32 = s[bw_pos + 2..].parse().map_err(|_| DecodeError::invalid_data_rate(s))?;
    let bandwidth = Bandwidth::from_khz(bw_khz)?;
    Ok(DataRate::Lora { spreading_factor: sf, bandwidth })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodingRate {
    Cr4_5,
    Cr4_6,
    Cr4_7,
    Cr4_8,
    Off,
}

impl CodingRate {
    pub fn to_wire_str(self) -> &'static str {
        match self {
            CodingRate::Cr4_5 => "4/5",
            CodingRate::Cr4_6 => "4/6",
            CodingRate::Cr4_7 => "4/7",
            CodingRate::Cr4_8 => "4/8",
            CodingRate::Off => "OFF",
        }
    }

    /// Parses a downlink `codr`, folding the non-canonical `2/3`/`1/2`
    /// spellings some servers still send onto their `4/6`/`4/8`
    /// equivalents.
    pub fn from_wire(s: &str) -> Result<Self, DecodeError> {
        match s {
            "4/5" => Ok(CodingRate::Cr4_5),
            "4/6" | "2/3" => Ok(CodingRate::Cr4_6),
            "4/7" => Ok(CodingRate::Cr4_7),
            "4/8" | "1/2" => Ok(CodingRate::Cr4_8),
            "OFF" => Ok(CodingRate::Off),
            other => Err(DecodeError::InvalidCodeRate(other.to_string())),
        }
    }

    pub fn jit_coderate(self) -> jit::CodeRate {
        match self {
            CodingRate::Cr4_5 | CodingRate::Off => jit::CodeRate::Cr4_5,
            CodingRate::Cr4_6 => jit::CodeRate::Cr4_6,
            CodingRate::Cr4_7 => jit::CodeRate::Cr4_7,
            CodingRate::Cr4_8 => jit::CodeRate::Cr4_8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcStatus {
    Ok,
    Bad,
    None,
}

impl CrcStatus {
    pub fn wire_value(self) -> i8 {
        match self {
            CrcStatus::Ok => 1,
            CrcStatus::Bad => -1,
            CrcStatus::None => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    Immediate,
    Timestamped,
    OnGps,
}

/// A received packet as reported by the HAL, in the agent's internal
/// representation (spec.md §3 "RX packet").
#[derive(Debug, Clone)]
pub struct RxPacket {
    pub count_us: u32,
    pub if_chain: u8,
    pub rf_chain: u8,
    pub freq_hz: u32,
    pub modulation: Modulation,
    pub datarate: DataRate,
    pub coderate: CodingRate,
    pub crc_status: CrcStatus,
    pub rssi_chan: f32,
    pub rssi_signal: Option<f32>,
    pub snr: f32,
    pub freq_offset: i32,
    pub payload: Vec<u8>,
    pub fine_timestamp: Option<u32>,
    pub modem_id: u8,
}

/// A packet destined for the HAL (spec.md §3 "TX packet").
#[derive(Debug, Clone)]
pub struct TxPacket {
    pub count_us: u32,
    pub tx_mode: TxMode,
    pub rf_chain: u8,
    pub rf_power_dbm: i8,
    pub freq_hz: u32,
    pub modulation: Modulation,
    pub bandwidth: Bandwidth,
    pub datarate: DataRate,
    pub coderate: CodingRate,
    pub invert_pol: bool,
    pub preamble: u16,
    pub no_crc: bool,
    pub no_header: bool,
    /// FSK frequency deviation in kHz, truncated from the wire's Hz value.
    /// `None` for LoRa packets.
    pub fdev_khz: Option<u8>,
    pub payload: Vec<u8>,
}

impl TxPacket {
    pub fn time_on_air_us(&self) -> u32 {
        let modulation = match self.datarate {
            DataRate::Lora { spreading_factor, bandwidth } => jit::Modulation::Lora {
                spreading_factor: spreading_factor as u32,
                bandwidth_hz: bandwidth.hz(),
                coderate: self.coderate.jit_coderate(),
                preamble_symbols: self.preamble as u32,
                explicit_header: !self.no_header,
            },
            DataRate::Fsk { bps } => jit::Modulation::Fsk {
                bitrate_bps: bps,
                preamble_bytes: (self.preamble / 8).max(1) as u32,
            },
        };
        jit::time_on_air_us(modulation, self.payload.len())
    }
}

/// `datr` is a LoRa spreading-factor/bandwidth string on the wire, or a
/// bare integer bitrate for FSK.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum DatrJson {
    Lora(String),
    Fsk(u32),
}

#[derive(Debug, Serialize_repr, Deserialize_repr, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum CrcJson {
    Bad = -1,
    None = 0,
    Ok = 1,
}

impl From<CrcStatus> for CrcJson {
    fn from(value: CrcStatus) -> Self {
        match value {
            CrcStatus::Ok => CrcJson::Ok,
            CrcStatus::Bad => CrcJson::Bad,
            CrcStatus::None => CrcJson::None,
        }
    }
}

pub mod base64_field {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// The `rxpk` JSON object, built for outbound PUSH_DATA only.
#[derive(Debug, Serialize)]
pub struct RxPkJson {
    pub jver: u8,
    pub tmst: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ftime: Option<u32>,
    pub chan: u8,
    pub rfch: u8,
    pub freq: f64,
    pub mid: u8,
    pub stat: i8,
    pub modu: &'static str,
    pub datr: DatrJson,
    pub codr: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssis: Option<i32>,
    pub lsnr: f32,
    pub foff: i32,
    pub rssi: i32,
    pub size: u32,
    #[serde(with = "base64_field")]
    pub data: Vec<u8>,
}

/// Builds the `rxpk` JSON entry for one received packet, per spec.md
/// §4.1. `gps` supplies the UTC/GPS timestamp fields when a valid GPS
/// reference exists; pass `None` to omit `time`/`tmms`.
pub fn rxpk_json(pkt: &RxPacket, iso_time: Option<String>, tmms: Option<u64>) -> RxPkJson {
    RxPkJson {
        jver: 1,
        tmst: pkt.count_us,
        time: iso_time,
        tmms,
        ftime: pkt.fine_timestamp,
        chan: pkt.if_chain,
        rfch: pkt.rf_chain,
        freq: (pkt.freq_hz as f64 / 1e6 * 1e6).round() / 1e6,
        mid: pkt.modem_id,
        stat: pkt.crc_status.wire_value(),
        modu: match pkt.modulation {
            Modulation::Lora => "LORA",
            Modulation::Fsk => "FSK",
        },
        datr: pkt.datarate.to_wire_string(),
        codr: pkt.coderate.to_wire_str(),
        rssis: pkt.rssi_signal.map(|v| v.round() as i32),
        lsnr: (pkt.snr * 10.0).round() / 10.0,
        foff: pkt.freq_offset,
        rssi: pkt.rssi_chan.round() as i32,
        size: pkt.payload.len() as u32,
        data: pkt.payload.clone(),
    }
}

/// The `txpk` JSON object as received inside a PULL_RESP.
#[derive(Debug, Deserialize)]
pub struct TxPkJson {
    pub imme: Option<bool>,
    pub tmst: Option<u32>,
    pub tmms: Option<u64>,
    pub freq: f64,
    pub rfch: u8,
    pub powe: Option<i32>,
    pub modu: String,
    pub datr: DatrJson,
    pub codr: Option<String>,
    pub ipol: Option<bool>,
    pub prea: Option<u16>,
    pub fdev: Option<u32>,
    pub ncrc: Option<bool>,
    pub nhdr: Option<bool>,
    pub size: u32,
    #[serde(with = "base64_field")]
    pub data: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct PullRespJson {
    pub txpk: TxPkJson,
}

/// The result tags a TX_ACK communicates, per spec.md §4.2/§6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAckReason {
    CollisionPacket,
    CollisionBeacon,
    TooLate,
    TooEarly,
    TxFreq,
    TxPower(i32),
    GpsUnlocked,
    Full,
}

impl TxAckReason {
    fn tag(self) -> &'static str {
        match self {
            TxAckReason::CollisionPacket => "COLLISION_PACKET",
            TxAckReason::CollisionBeacon => "COLLISION_BEACON",
            TxAckReason::TooLate => "TOO_LATE",
            TxAckReason::TooEarly => "TOO_EARLY",
            TxAckReason::TxFreq => "TX_FREQ",
            TxAckReason::TxPower(_) => "TX_POWER",
            TxAckReason::GpsUnlocked => "GPS_UNLOCKED",
            TxAckReason::Full => "COLLISION_PACKET",
        }
    }

    fn is_warning(self) -> bool {
        matches!(self, TxAckReason::TxPower(_))
    }

    fn value(self) -> Option<i32> {
        match self {
            TxAckReason::TxPower(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct TxAckInner {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warn: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<i32>,
}

#[derive(Serialize)]
struct TxAckJson {
    txpk_ack: TxAckInner,
}

/// Builds the JSON body of a non-OK TX_ACK. Returns `None` when
/// `reason` is `None`, matching the "empty body on success" rule.
pub fn tx_ack_json(reason: Option<TxAckReason>) -> Option<Vec<u8>> {
    let reason = reason?;
    let inner = if reason.is_warning() {
        TxAckInner { error: None, warn: Some(reason.tag()), value: reason.value() }
    } else {
        TxAckInner { error: Some(reason.tag()), warn: None, value: reason.value() }
    };
    let json = TxAckJson { txpk_ack: inner };
    Some(serde_json::to_vec(&json).expect("TxAckJson always serializes"))
}

/// The `stat` JSON object assembled periodically by the statistics
/// loop (spec.md §4.7).
#[derive(Debug, Serialize)]
pub struct StatJson {
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lati: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alti: Option<i32>,
    pub rxnb: u32,
    pub rxok: u32,
    pub rxfw: u32,
    pub ackr: f32,
    pub dwnb: u32,
    pub txnb: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lora_datr_round_trips() {
        let dr = DataRate::Lora { spreading_factor: 7, bandwidth: Bandwidth::Bw125 };
        let wire = dr.to_wire_string();
        assert_eq!(wire, DatrJson::Lora("SF7BW125".to_string()));
        assert_eq!(DataRate::from_wire(&wire).unwrap(), dr);
    }

    #[test]
    fn fsk_datr_round_trips() {
        let dr = DataRate::Fsk { bps: 50_000 };
        let wire = dr.to_wire_string();
        assert_eq!(DataRate::from_wire(&wire).unwrap(), dr);
    }

    #[test]
    fn codingrate_folds_legacy_spellings() {
        assert_eq!(CodingRate::from_wire("2/3").unwrap(), CodingRate::Cr4_6);
        assert_eq!(CodingRate::from_wire("1/2").unwrap(), CodingRate::Cr4_8);
        assert_eq!(CodingRate::from_wire("4/7").unwrap(), CodingRate::Cr4_7);
    }

    #[test]
    fn uplink_round_trip_scenario() {
        let pkt = RxPacket {
            count_us: 1_000_000,
            if_chain: 0,
            rf_chain: 0,
            freq_hz: 868_100_000,
            modulation: Modulation::Lora,
            datarate: DataRate::Lora { spreading_factor: 7, bandwidth: Bandwidth::Bw125 },
            coderate: CodingRate::Cr4_5,
            crc_status: CrcStatus::Ok,
            rssi_chan: -95.0,
            rssi_signal: Some(-97.0),
            snr: 8.5,
            freq_offset: 0,
            payload: (0u8..12).collect(),
            fine_timestamp: None,
            modem_id: 0,
        };
        let json = rxpk_json(&pkt, None, None);
        let value = serde_json::to_value(&json).unwrap();
        assert_eq!(value["jver"], 1);
        assert_eq!(value["tmst"], 1_000_000);
        assert_eq!(value["chan"], 0);
        assert_eq!(value["rfch"], 0);
        assert_eq!(value["freq"], 868.1);
        assert_eq!(value["stat"], 1);
        assert_eq!(value["modu"], "LORA");
        assert_eq!(value["datr"], "SF7BW125");
        assert_eq!(value["codr"], "4/5");
        assert_eq!(value["rssis"], -97);
        assert_eq!(value["lsnr"], 8.5);
        assert_eq!(value["rssi"], -95);
        assert_eq!(value["size"], 12);
        assert_eq!(value["data"], "AAECAwQFBgcICQoL");
    }

    #[test]
    fn tx_ack_empty_body_on_success() {
        assert!(tx_ack_json(None).is_none());
    }

    #[test]
    fn tx_ack_warning_carries_value() {
        let body = tx_ack_json(Some(TxAckReason::TxPower(20))).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["txpk_ack"]["warn"], "TX_POWER");
        assert_eq!(value["txpk_ack"]["value"], 20);
    }

    #[test]
    fn tx_ack_collision_beacon_error() {
        let body = tx_ack_json(Some(TxAckReason::CollisionBeacon)).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["txpk_ack"]["error"], "COLLISION_BEACON");
    }
}
