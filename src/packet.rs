// SPDX-License-Identifier: Apache-2.0 OR MIT
//! IGMP wire codec (RFC 1112, RFC 2236, RFC 3376).
//!
//! Decodes raw IGMP payloads (IP header already stripped) into a tagged
//! `Message` and encodes messages back to bytes with a correct ones'
//! complement checksum. Unknown type codes decode to `Message::Unknown`
//! so the dispatch loop can skip them without treating them as errors.
//!
//! ## IGMP Message Types
//!
//! | Type | Value | Description |
//! |------|-------|-------------|
//! | Membership Query | 0x11 | v1/v2 (8 bytes) or v3 (>= 12 bytes) |
//! | V1 Membership Report | 0x12 | Legacy host join |
//! | V2 Membership Report | 0x16 | Host joined group |
//! | Leave Group | 0x17 | Host left group |
//! | V3 Membership Report | 0x22 | Group record list |

use std::net::Ipv4Addr;
use std::time::Duration;

use thiserror::Error;

pub const IGMP_MEMBERSHIP_QUERY: u8 = 0x11;
pub const IGMP_V1_MEMBERSHIP_REPORT: u8 = 0x12;
pub const IGMP_V2_MEMBERSHIP_REPORT: u8 = 0x16;
pub const IGMP_LEAVE_GROUP: u8 = 0x17;
pub const IGMP_V3_MEMBERSHIP_REPORT: u8 = 0x22;

/// All systems on this subnet (224.0.0.1), destination of General Queries
pub const ALL_HOSTS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);

/// All routers on this subnet (224.0.0.2), destination of Leave messages
pub const ALL_ROUTERS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 2);

/// IGMPv3-capable routers (224.0.0.22), destination of v3 reports
pub const V3_ROUTERS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 22);

/// Errors that can occur while decoding an IGMP message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },
}

/// Which query wire format a `Query` uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryVersion {
    /// 8-byte query with max response code 0
    V1,
    /// 8-byte query with non-zero max response code
    V2,
    /// 12+ byte query with QRV/QQIC and a source list
    V3,
}

/// A membership query (general when `group` is unspecified)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub version: QueryVersion,
    /// 0.0.0.0 for a General Query
    pub group: Ipv4Addr,
    /// Max response code in the v2 tenths-of-second / v3 exponential encoding
    pub max_resp_code: u8,
    /// v3 S flag (suppress router-side processing); always false for v1/v2
    pub suppress: bool,
    /// v3 Querier's Robustness Variable; 0 for v1/v2
    pub qrv: u8,
    /// v3 Querier's Query Interval Code; 0 for v1/v2
    pub qqic: u8,
    /// v3 source list; empty for v1/v2
    pub sources: Vec<Ipv4Addr>,
}

impl Query {
    pub fn general_v2(max_resp_code: u8) -> Self {
        Self {
            version: QueryVersion::V2,
            group: Ipv4Addr::UNSPECIFIED,
            max_resp_code,
            suppress: false,
            qrv: 0,
            qqic: 0,
            sources: Vec::new(),
        }
    }

    pub fn group_specific_v2(group: Ipv4Addr, max_resp_code: u8) -> Self {
        Self {
            group,
            ..Self::general_v2(max_resp_code)
        }
    }

    pub fn general_v3(max_resp_code: u8, qrv: u8, qqic: u8) -> Self {
        Self {
            version: QueryVersion::V3,
            group: Ipv4Addr::UNSPECIFIED,
            max_resp_code,
            suppress: false,
            qrv: qrv & 0x07,
            qqic,
            sources: Vec::new(),
        }
    }

    pub fn group_specific_v3(
        group: Ipv4Addr,
        max_resp_code: u8,
        qrv: u8,
        qqic: u8,
        sources: Vec<Ipv4Addr>,
    ) -> Self {
        Self {
            group,
            sources,
            ..Self::general_v3(max_resp_code, qrv, qqic)
        }
    }

    pub fn is_general(&self) -> bool {
        self.group.is_unspecified()
    }
}

/// IGMPv3 group record types (RFC 3376 §4.2.12)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    ModeIsInclude = 1,
    ModeIsExclude = 2,
    ChangeToInclude = 3,
    ChangeToExclude = 4,
    AllowNewSources = 5,
    BlockOldSources = 6,
}

impl RecordType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordType::ModeIsInclude),
            2 => Some(RecordType::ModeIsExclude),
            3 => Some(RecordType::ChangeToInclude),
            4 => Some(RecordType::ChangeToExclude),
            5 => Some(RecordType::AllowNewSources),
            6 => Some(RecordType::BlockOldSources),
            _ => None,
        }
    }
}

/// One group record from an IGMPv3 report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRecord {
    pub record_type: RecordType,
    pub group: Ipv4Addr,
    pub sources: Vec<Ipv4Addr>,
}

/// A decoded IGMP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Query(Query),
    ReportV1 { group: Ipv4Addr },
    ReportV2 { group: Ipv4Addr },
    Leave { group: Ipv4Addr },
    /// v3 report; records with unrecognized record types are skipped
    ReportV3 { records: Vec<ReportRecord> },
    /// Checksum-valid message with an unrecognized type code, kept verbatim
    Unknown { type_code: u8, raw: Vec<u8> },
}

impl Message {
    /// Decode an IGMP payload. The checksum covers the whole message and
    /// is verified before the type byte is interpreted, so any corruption
    /// surfaces as `ChecksumMismatch` rather than a type-dependent error.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 8 {
            return Err(DecodeError::MalformedPacket("short header"));
        }

        if internet_checksum(data) != 0 {
            let mut zeroed = data.to_vec();
            zeroed[2] = 0;
            zeroed[3] = 0;
            return Err(DecodeError::ChecksumMismatch {
                expected: internet_checksum(&zeroed),
                actual: u16::from_be_bytes([data[2], data[3]]),
            });
        }

        match data[0] {
            IGMP_MEMBERSHIP_QUERY => Self::decode_query(data),
            IGMP_V1_MEMBERSHIP_REPORT => Ok(Message::ReportV1 {
                group: read_addr(data, 4),
            }),
            IGMP_V2_MEMBERSHIP_REPORT => Ok(Message::ReportV2 {
                group: read_addr(data, 4),
            }),
            IGMP_LEAVE_GROUP => Ok(Message::Leave {
                group: read_addr(data, 4),
            }),
            IGMP_V3_MEMBERSHIP_REPORT => Self::decode_v3_report(data),
            type_code => Ok(Message::Unknown {
                type_code,
                raw: data.to_vec(),
            }),
        }
    }

    fn decode_query(data: &[u8]) -> Result<Self, DecodeError> {
        let max_resp_code = data[1];
        let group = read_addr(data, 4);

        if data.len() < 12 {
            // 8-byte v1/v2 query; a v1 querier always sends code 0
            let version = if max_resp_code == 0 {
                QueryVersion::V1
            } else {
                QueryVersion::V2
            };
            return Ok(Message::Query(Query {
                version,
                group,
                max_resp_code,
                suppress: false,
                qrv: 0,
                qqic: 0,
                sources: Vec::new(),
            }));
        }

        let resv_s_qrv = data[8];
        let qqic = data[9];
        let n_sources = u16::from_be_bytes([data[10], data[11]]) as usize;
        if data.len() < 12 + 4 * n_sources {
            return Err(DecodeError::MalformedPacket("truncated v3 source list"));
        }
        let sources = (0..n_sources).map(|i| read_addr(data, 12 + 4 * i)).collect();

        Ok(Message::Query(Query {
            version: QueryVersion::V3,
            group,
            max_resp_code,
            suppress: resv_s_qrv & 0x08 != 0,
            qrv: resv_s_qrv & 0x07,
            qqic,
            sources,
        }))
    }

    fn decode_v3_report(data: &[u8]) -> Result<Self, DecodeError> {
        let n_records = u16::from_be_bytes([data[6], data[7]]) as usize;
        let mut records = Vec::with_capacity(n_records);
        let mut offset = 8;

        for _ in 0..n_records {
            if data.len() < offset + 8 {
                return Err(DecodeError::MalformedPacket("truncated group record"));
            }
            let type_code = data[offset];
            let aux_len = data[offset + 1] as usize;
            let n_sources = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            let group = read_addr(data, offset + 4);
            let record_end = offset + 8 + 4 * n_sources + 4 * aux_len;
            if data.len() < record_end {
                return Err(DecodeError::MalformedPacket("truncated group record"));
            }
            // Unrecognized record types are skipped, not fatal (RFC 3376 §4.2.12)
            if let Some(record_type) = RecordType::from_u8(type_code) {
                let sources = (0..n_sources)
                    .map(|i| read_addr(data, offset + 8 + 4 * i))
                    .collect();
                records.push(ReportRecord {
                    record_type,
                    group,
                    sources,
                });
            }
            offset = record_end;
        }

        Ok(Message::ReportV3 { records })
    }

    /// Encode to wire bytes. Total over all constructible messages; the
    /// checksum is always recomputed.
    pub fn encode(&self) -> Vec<u8> {
        let mut packet = match self {
            Message::Query(query) => encode_query(query),
            Message::ReportV1 { group } => encode_simple(IGMP_V1_MEMBERSHIP_REPORT, *group),
            Message::ReportV2 { group } => encode_simple(IGMP_V2_MEMBERSHIP_REPORT, *group),
            Message::Leave { group } => encode_simple(IGMP_LEAVE_GROUP, *group),
            Message::ReportV3 { records } => encode_v3_report(records),
            Message::Unknown { raw, .. } => return raw.clone(),
        };

        let checksum = internet_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
        packet
    }
}

fn encode_simple(type_code: u8, group: Ipv4Addr) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8);
    packet.push(type_code);
    packet.push(0);
    packet.extend_from_slice(&[0, 0]); // checksum placeholder
    packet.extend_from_slice(&group.octets());
    packet
}

fn encode_query(query: &Query) -> Vec<u8> {
    let mut packet = Vec::with_capacity(12 + 4 * query.sources.len());
    packet.push(IGMP_MEMBERSHIP_QUERY);
    packet.push(query.max_resp_code);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&query.group.octets());

    if query.version == QueryVersion::V3 {
        let s_flag = if query.suppress { 0x08 } else { 0 };
        packet.push(s_flag | (query.qrv & 0x07));
        packet.push(query.qqic);
        packet.extend_from_slice(&(query.sources.len() as u16).to_be_bytes());
        for source in &query.sources {
            packet.extend_from_slice(&source.octets());
        }
    }
    packet
}

fn encode_v3_report(records: &[ReportRecord]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + records.len() * 8);
    packet.push(IGMP_V3_MEMBERSHIP_REPORT);
    packet.push(0);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&[0, 0]); // reserved
    packet.extend_from_slice(&(records.len() as u16).to_be_bytes());
    for record in records {
        packet.push(record.record_type as u8);
        packet.push(0); // aux data len
        packet.extend_from_slice(&(record.sources.len() as u16).to_be_bytes());
        packet.extend_from_slice(&record.group.octets());
        for source in &record.sources {
            packet.extend_from_slice(&source.octets());
        }
    }
    packet
}

fn read_addr(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    )
}

/// 16-bit ones' complement internet checksum. Over a message whose
/// checksum field is correct the result is 0.
pub(crate) fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]]) as u32
        } else {
            (chunk[0] as u32) << 8
        };
        sum = sum.wrapping_add(word);
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Decode a max response code into a duration. v2 codes are tenths of a
/// second; v3 codes >= 128 use the mant/exp floating encoding.
pub fn max_resp_duration(code: u8, version: QueryVersion) -> Duration {
    let tenths = if version == QueryVersion::V3 && code >= 128 {
        let mant = (code & 0x0F) as u64;
        let exp = ((code >> 4) & 0x07) as u64;
        (mant | 0x10) << (exp + 3)
    } else {
        code as u64
    };
    Duration::from_millis(tenths * 100)
}

/// Encode a duration as a max response code for the given query version.
pub fn max_resp_code(duration: Duration, version: QueryVersion) -> u8 {
    let tenths = duration.as_millis() / 100;
    if tenths < 128 {
        return tenths as u8;
    }
    match version {
        // v2 codes are linear and saturate at 25.5 seconds
        QueryVersion::V1 | QueryVersion::V2 => tenths.min(255) as u8,
        QueryVersion::V3 => {
            let mut tenths = tenths.min(31744) as u64; // max encodable: 0xFF
            let mut exp = 0u8;
            while tenths > 0x1F {
                tenths >>= 1;
                exp += 1;
            }
            // tenths now holds 1 in bit 4 plus a 4-bit mantissa
            0x80 | ((exp - 3) << 4) | ((tenths & 0x0F) as u8)
        }
    }
}
