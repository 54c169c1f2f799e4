//! Configuration schema (spec.md §6) and the layered loader built on
//! top of the `config` crate, mirroring how the teacher loads its own
//! settings before handing them to the agent.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

fn default_true() -> bool {
    true
}

fn default_com_type() -> String {
    "SPI".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BoardConf {
    #[serde(default = "default_com_type")]
    pub com_type: String,
    pub com_path: String,
    #[serde(default)]
    pub lorawan_public: bool,
    #[serde(default)]
    pub clksrc: u8,
    #[serde(default)]
    pub full_duplex: bool,
    #[serde(default)]
    pub antenna_gain: f32,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FineTimestampMode {
    HighCapacity,
    AllSf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FineTimestampConf {
    #[serde(default)]
    pub enable: bool,
    pub mode: Option<FineTimestampMode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LbtConf {
    pub channels: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sx1261Conf {
    #[serde(default)]
    pub rssi_offset: f32,
    pub spectral_scan: Option<serde_json::Value>,
    pub lbt: Option<LbtConf>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub enum RadioType {
    SX1255,
    SX1257,
    SX1250,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxGainLutEntry {
    pub rf_power: i8,
    pub pa_gain: u8,
    pub dig_gain: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RadioConf {
    #[serde(default = "default_true")]
    pub enable: bool,
    pub freq: u32,
    #[serde(default)]
    pub rssi_offset: f32,
    #[serde(default)]
    pub rssi_tcomp: [f32; 5],
    #[serde(rename = "type")]
    pub radio_type: RadioType,
    #[serde(default)]
    pub single_input_mode: bool,
    #[serde(default)]
    pub tx_enable: bool,
    pub tx_freq_min: Option<u32>,
    pub tx_freq_max: Option<u32>,
    #[serde(default)]
    pub tx_gain_lut: Vec<TxGainLutEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultiSfAll {
    #[serde(default)]
    pub spreading_factor_enable: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChanMultiSf {
    #[serde(default = "default_true")]
    pub enable: bool,
    pub radio: u8,
    #[serde(rename = "if")]
    pub if_offset: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChanLoraStd {
    #[serde(default)]
    pub enable: bool,
    pub radio: Option<u8>,
    #[serde(rename = "if")]
    pub if_offset: Option<i32>,
    pub bandwidth: Option<u32>,
    pub spread_factor: Option<u8>,
    pub implicit_hdr: Option<bool>,
    pub implicit_payload_length: Option<u8>,
    pub implicit_crc_en: Option<bool>,
    pub implicit_coderate: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChanFsk {
    #[serde(default)]
    pub enable: bool,
    pub radio: Option<u8>,
    #[serde(rename = "if")]
    pub if_offset: Option<i32>,
    pub bandwidth: Option<u32>,
    pub datarate: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sx130xConf {
    pub board_conf: BoardConf,
    #[serde(default)]
    pub fine_timestamp: FineTimestampConf,
    pub sx1261_conf: Option<Sx1261Conf>,
    pub radio_0: Option<RadioConf>,
    pub radio_1: Option<RadioConf>,
    #[serde(default)]
    pub chan_multi_sf_all: MultiSfAll,
    pub chan_multi_sf_0: Option<ChanMultiSf>,
    pub chan_multi_sf_1: Option<ChanMultiSf>,
    pub chan_multi_sf_2: Option<ChanMultiSf>,
    pub chan_multi_sf_3: Option<ChanMultiSf>,
    pub chan_multi_sf_4: Option<ChanMultiSf>,
    pub chan_multi_sf_5: Option<ChanMultiSf>,
    pub chan_multi_sf_6: Option<ChanMultiSf>,
    pub chan_multi_sf_7: Option<ChanMultiSf>,
    pub chan_lora_std: Option<ChanLoraStd>,
    pub chan_fsk: Option<ChanFsk>,
}

impl Default for FineTimestampConf {
    fn default() -> Self {
        FineTimestampConf { enable: false, mode: None }
    }
}

impl Default for MultiSfAll {
    fn default() -> Self {
        MultiSfAll { spreading_factor_enable: (7..=12).collect() }
    }
}

fn default_server_address() -> String {
    "127.0.0.1".to_string()
}
fn default_serv_port_up() -> u16 {
    1780
}
fn default_serv_port_down() -> u16 {
    1782
}
fn default_keepalive() -> u32 {
    5
}
fn default_stat_interval() -> u32 {
    30
}
fn default_push_timeout_ms() -> u32 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConf {
    #[serde(rename = "gateway_ID")]
    pub gateway_id: String,
    #[serde(default = "default_server_address")]
    pub server_address: String,
    #[serde(default = "default_serv_port_up")]
    pub serv_port_up: u16,
    #[serde(default = "default_serv_port_down")]
    pub serv_port_down: u16,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval: u32,
    #[serde(default = "default_stat_interval")]
    pub stat_interval: u32,
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u32,
    #[serde(default = "default_true")]
    pub forward_crc_valid: bool,
    #[serde(default)]
    pub forward_crc_error: bool,
    #[serde(default)]
    pub forward_crc_disabled: bool,
    pub gps_tty_path: Option<String>,
    #[serde(default)]
    pub ref_latitude: f64,
    #[serde(default)]
    pub ref_longitude: f64,
    #[serde(default)]
    pub ref_altitude: i32,
    #[serde(default)]
    pub fake_gps: bool,
    #[serde(default)]
    pub beacon_period: u32,
    pub beacon_freq_hz: Option<u32>,
    #[serde(default)]
    pub beacon_freq_nb: u8,
    #[serde(default)]
    pub beacon_freq_step: u32,
    #[serde(default)]
    pub beacon_datarate: u8,
    #[serde(default)]
    pub beacon_bw_hz: u32,
    #[serde(default)]
    pub beacon_power: i8,
    #[serde(default)]
    pub beacon_infodesc: u8,
    #[serde(default)]
    pub autoquit_threshold: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefPayload {
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DebugConf {
    #[serde(default)]
    pub ref_payload: Vec<RefPayload>,
    pub log_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "SX130x_conf")]
    pub sx130x_conf: Sx130xConf,
    pub gateway_conf: GatewayConf,
    #[serde(default)]
    pub debug_conf: DebugConf,
}

impl Config {
    pub fn mac(&self) -> Result<crate::protocol::MacAddress> {
        crate::protocol::MacAddress::from_hex(&self.gateway_conf.gateway_id)
            .map_err(|_| Error::config("gateway_ID is not a 16-hex-digit MAC"))
    }

    /// Loads configuration from `path` (JSON, matching §6's schema).
    /// Errors here are fatal per spec.md §7's "configuration errors"
    /// taxonomy: the caller should log and exit the process.
    pub fn load(path: &Path) -> Result<Config> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| Error::config(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| Error::config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_deserializes() {
        let json = serde_json::json!({
            "SX130x_conf": {
                "board_conf": { "com_path": "/dev/spidev0.0" }
            },
            "gateway_conf": {
                "gateway_ID": "0011223344556677"
            }
        });
        let cfg: Config = serde_json::from_value(json).unwrap();
        assert_eq!(cfg.gateway_conf.serv_port_up, 1780);
        assert_eq!(cfg.gateway_conf.stat_interval, 30);
        assert!(cfg.mac().is_ok());
    }

    #[test]
    fn rejects_bad_gateway_id() {
        let json = serde_json::json!({
            "SX130x_conf": { "board_conf": { "com_path": "/dev/spidev0.0" } },
            "gateway_conf": { "gateway_ID": "not-hex" }
        });
        let cfg: Config = serde_json::from_value(json).unwrap();
        assert!(cfg.mac().is_err());
    }
}
