use crate::error::Error;
use num_enum::TryFromPrimitive;
use std::net::{Ipv4Addr, Ipv6Addr};
use vdb::{Prefix, Vrp};

/// RTR protocol version 0.
///
/// Ref: RFC 6810
pub const VERSION_0: u8 = 0;

/// RTR protocol version 1. Adds the End of Data timer fields.
///
/// Ref: RFC 8210
pub const VERSION_1: u8 = 1;

/// Every PDU starts with a fixed eight byte header.
pub const HEADER_SIZE: usize = 8;

/// Upper bound accepted for the header length field. Anything a router
/// legitimately sends is far smaller.
pub const MAX_PDU_SIZE: u32 = 65536;

/// Prefix PDU flags field value for an announcement.
pub const FLAG_ANNOUNCE: u8 = 1;

/// Prefix PDU flags field value for a withdrawal.
pub const FLAG_WITHDRAW: u8 = 0;

/// RTR PDU types.
///
/// Ref: RFC 8210 §5
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum PduType {
    /// Cache to router: the cache has new data available.
    SerialNotify = 0,

    /// Router to cache: send changes since the given serial.
    SerialQuery = 1,

    /// Router to cache: send the complete data set.
    ResetQuery = 2,

    /// Cache to router: response data follows.
    CacheResponse = 3,

    /// An IPv4 VRP announcement or withdrawal.
    Ipv4Prefix = 4,

    /// An IPv6 VRP announcement or withdrawal.
    Ipv6Prefix = 6,

    /// Cache to router: end of a response, carries the new serial.
    EndOfData = 7,

    /// Cache to router: the cache cannot serve an incremental update,
    /// start over with a Reset Query.
    CacheReset = 8,

    /// Either direction: a fatal protocol error.
    ErrorReport = 10,
}

impl PduType {
    /// Stable lowercase label, used for per-type counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            PduType::SerialNotify => "serial_notify",
            PduType::SerialQuery => "serial_query",
            PduType::ResetQuery => "reset_query",
            PduType::CacheResponse => "cache_response",
            PduType::Ipv4Prefix => "ipv4_prefix",
            PduType::Ipv6Prefix => "ipv6_prefix",
            PduType::EndOfData => "end_of_data",
            PduType::CacheReset => "cache_reset",
            PduType::ErrorReport => "error_report",
        }
    }
}

/// Error Report error codes.
///
/// Ref: RFC 8210 §12
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone)]
#[repr(u16)]
pub enum ErrorCode {
    CorruptData = 0,
    InternalError = 1,
    NoDataAvailable = 2,
    InvalidRequest = 3,
    UnsupportedProtocolVersion = 4,
    UnsupportedPduType = 5,
    WithdrawalOfUnknownRecord = 6,
    DuplicateAnnouncementReceived = 7,
    UnexpectedProtocolVersion = 8,
}

/// The fixed PDU header.
///
/// ```text
/// 0          8          16         24        31
/// +----------+----------+----------+----------+
/// | version  |   type   |  session id or zero |
/// +----------+----------+----------+----------+
/// |            length (incl. header)          |
/// +----------+----------+----------+----------+
/// ```
///
/// The third field doubles as the error code in Error Report PDUs. The
/// length counts the entire PDU including this header.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Header {
    pub version: u8,
    pub typ: PduType,
    pub session: u16,
    pub length: u32,
}

impl Header {
    pub fn to_wire(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.typ as u8;
        buf[2..4].copy_from_slice(&self.session.to_be_bytes());
        buf[4..8].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn from_wire(buf: &[u8]) -> Result<Header, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::TooSmall(buf.len()));
        }
        let version = buf[0];
        if version != VERSION_0 && version != VERSION_1 {
            return Err(Error::UnsupportedVersion(version));
        }
        let typ = PduType::try_from(buf[1])
            .map_err(|_| Error::UnsupportedPduType(buf[1]))?;
        let session = u16::from_be_bytes([buf[2], buf[3]]);
        let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if length < HEADER_SIZE as u32 {
            return Err(Error::LengthMismatch { length });
        }
        if length > MAX_PDU_SIZE {
            return Err(Error::TooLarge(length));
        }
        Ok(Header {
            version,
            typ,
            session,
            length,
        })
    }
}

/// Cache to router notification that new data is available under `serial`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SerialNotifyPdu {
    pub version: u8,
    pub session: u16,
    pub serial: u32,
}

/// Router request for the changes since `serial`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SerialQueryPdu {
    pub version: u8,
    pub session: u16,
    pub serial: u32,
}

/// Router request for the complete data set.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ResetQueryPdu {
    pub version: u8,
}

/// Start of a cache response.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CacheResponsePdu {
    pub version: u8,
    pub session: u16,
}

/// An IPv4 VRP, announced (flags = 1) or withdrawn (flags = 0).
///
/// ```text
/// +-------+-------------+--------------+-------+
/// | flags | prefix len  |  max length  | zero  |
/// +-------+-------------+--------------+-------+
/// |               IPv4 prefix                  |
/// +--------------------------------------------+
/// |                   ASN                      |
/// +--------------------------------------------+
/// ```
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Ipv4PrefixPdu {
    pub version: u8,
    pub flags: u8,
    pub prefix_length: u8,
    pub max_length: u8,
    pub prefix: Ipv4Addr,
    pub asn: u32,
}

/// An IPv6 VRP, same layout as [`Ipv4PrefixPdu`] with a 16 byte address.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Ipv6PrefixPdu {
    pub version: u8,
    pub flags: u8,
    pub prefix_length: u8,
    pub max_length: u8,
    pub prefix: Ipv6Addr,
    pub asn: u32,
}

/// End of a cache response. Version 1 adds the refresh/retry/expire timers;
/// in version 0 they are neither sent nor parsed.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct EndOfDataPdu {
    pub version: u8,
    pub session: u16,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
}

/// Cache cannot serve an incremental update for the presented serial or
/// session, the router must issue a Reset Query.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CacheResetPdu {
    pub version: u8,
}

/// A fatal protocol error. Carries a copy of the offending PDU and a
/// diagnostic text; the error code travels in the header session field.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ErrorReportPdu {
    pub version: u8,
    pub code: ErrorCode,
    pub pdu_copy: Vec<u8>,
    pub text: String,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Pdu {
    SerialNotify(SerialNotifyPdu),
    SerialQuery(SerialQueryPdu),
    ResetQuery(ResetQueryPdu),
    CacheResponse(CacheResponsePdu),
    Ipv4Prefix(Ipv4PrefixPdu),
    Ipv6Prefix(Ipv6PrefixPdu),
    EndOfData(EndOfDataPdu),
    CacheReset(CacheResetPdu),
    ErrorReport(ErrorReportPdu),
}

impl Pdu {
    pub fn typ(&self) -> PduType {
        match self {
            Pdu::SerialNotify(_) => PduType::SerialNotify,
            Pdu::SerialQuery(_) => PduType::SerialQuery,
            Pdu::ResetQuery(_) => PduType::ResetQuery,
            Pdu::CacheResponse(_) => PduType::CacheResponse,
            Pdu::Ipv4Prefix(_) => PduType::Ipv4Prefix,
            Pdu::Ipv6Prefix(_) => PduType::Ipv6Prefix,
            Pdu::EndOfData(_) => PduType::EndOfData,
            Pdu::CacheReset(_) => PduType::CacheReset,
            Pdu::ErrorReport(_) => PduType::ErrorReport,
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            Pdu::SerialNotify(p) => p.version,
            Pdu::SerialQuery(p) => p.version,
            Pdu::ResetQuery(p) => p.version,
            Pdu::CacheResponse(p) => p.version,
            Pdu::Ipv4Prefix(p) => p.version,
            Pdu::Ipv6Prefix(p) => p.version,
            Pdu::EndOfData(p) => p.version,
            Pdu::CacheReset(p) => p.version,
            Pdu::ErrorReport(p) => p.version,
        }
    }

    /// Build a prefix PDU for `vrp` with the given flags.
    pub fn prefix(version: u8, vrp: &Vrp, flags: u8) -> Pdu {
        match vrp.prefix {
            Prefix::V4(p) => Pdu::Ipv4Prefix(Ipv4PrefixPdu {
                version,
                flags,
                prefix_length: p.length,
                max_length: vrp.max_length,
                prefix: p.value,
                asn: vrp.asn,
            }),
            Prefix::V6(p) => Pdu::Ipv6Prefix(Ipv6PrefixPdu {
                version,
                flags,
                prefix_length: p.length,
                max_length: vrp.max_length,
                prefix: p.value,
                asn: vrp.asn,
            }),
        }
    }

    /// Serialize a full PDU, header included.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let (session, body) = match self {
            Pdu::SerialNotify(p) => (p.session, p.serial.to_be_bytes().to_vec()),
            Pdu::SerialQuery(p) => (p.session, p.serial.to_be_bytes().to_vec()),
            Pdu::ResetQuery(_) => (0, Vec::new()),
            Pdu::CacheResponse(p) => (p.session, Vec::new()),
            Pdu::Ipv4Prefix(p) => {
                let mut body = vec![p.flags, p.prefix_length, p.max_length, 0];
                body.extend_from_slice(&p.prefix.octets());
                body.extend_from_slice(&p.asn.to_be_bytes());
                (0, body)
            }
            Pdu::Ipv6Prefix(p) => {
                let mut body = vec![p.flags, p.prefix_length, p.max_length, 0];
                body.extend_from_slice(&p.prefix.octets());
                body.extend_from_slice(&p.asn.to_be_bytes());
                (0, body)
            }
            Pdu::EndOfData(p) => {
                let mut body = p.serial.to_be_bytes().to_vec();
                if p.version >= VERSION_1 {
                    body.extend_from_slice(&p.refresh.to_be_bytes());
                    body.extend_from_slice(&p.retry.to_be_bytes());
                    body.extend_from_slice(&p.expire.to_be_bytes());
                }
                (p.session, body)
            }
            Pdu::CacheReset(_) => (0, Vec::new()),
            Pdu::ErrorReport(p) => {
                let mut body = Vec::new();
                body.extend_from_slice(
                    &(p.pdu_copy.len() as u32).to_be_bytes(),
                );
                body.extend_from_slice(&p.pdu_copy);
                body.extend_from_slice(&(p.text.len() as u32).to_be_bytes());
                body.extend_from_slice(p.text.as_bytes());
                (p.code as u16, body)
            }
        };

        let length = (HEADER_SIZE + body.len()) as u32;
        if length > MAX_PDU_SIZE {
            return Err(Error::TooLarge(length));
        }
        let header = Header {
            version: self.version(),
            typ: self.typ(),
            session,
            length,
        };
        let mut buf = header.to_wire().to_vec();
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Deserialize a full PDU. `buf` must hold exactly the PDU as framed by
    /// its header length field.
    pub fn from_wire(buf: &[u8]) -> Result<Pdu, Error> {
        let header = Header::from_wire(buf)?;
        if buf.len() != header.length as usize {
            return Err(Error::LengthMismatch {
                length: header.length,
            });
        }
        let body = &buf[HEADER_SIZE..];

        let expect = |n: usize| -> Result<(), Error> {
            if body.len() == n {
                Ok(())
            } else {
                Err(Error::LengthMismatch {
                    length: header.length,
                })
            }
        };

        match header.typ {
            PduType::SerialNotify => {
                expect(4)?;
                Ok(Pdu::SerialNotify(SerialNotifyPdu {
                    version: header.version,
                    session: header.session,
                    serial: be_u32(&body[0..4]),
                }))
            }
            PduType::SerialQuery => {
                expect(4)?;
                Ok(Pdu::SerialQuery(SerialQueryPdu {
                    version: header.version,
                    session: header.session,
                    serial: be_u32(&body[0..4]),
                }))
            }
            PduType::ResetQuery => {
                expect(0)?;
                Ok(Pdu::ResetQuery(ResetQueryPdu {
                    version: header.version,
                }))
            }
            PduType::CacheResponse => {
                expect(0)?;
                Ok(Pdu::CacheResponse(CacheResponsePdu {
                    version: header.version,
                    session: header.session,
                }))
            }
            PduType::Ipv4Prefix => {
                expect(12)?;
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&body[4..8]);
                Ok(Pdu::Ipv4Prefix(Ipv4PrefixPdu {
                    version: header.version,
                    flags: body[0],
                    prefix_length: body[1],
                    max_length: body[2],
                    prefix: Ipv4Addr::from(octets),
                    asn: be_u32(&body[8..12]),
                }))
            }
            PduType::Ipv6Prefix => {
                expect(24)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[4..20]);
                Ok(Pdu::Ipv6Prefix(Ipv6PrefixPdu {
                    version: header.version,
                    flags: body[0],
                    prefix_length: body[1],
                    max_length: body[2],
                    prefix: Ipv6Addr::from(octets),
                    asn: be_u32(&body[20..24]),
                }))
            }
            PduType::EndOfData => {
                if header.version >= VERSION_1 {
                    expect(16)?;
                } else {
                    expect(4)?;
                }
                let (refresh, retry, expire) = if header.version >= VERSION_1 {
                    (
                        be_u32(&body[4..8]),
                        be_u32(&body[8..12]),
                        be_u32(&body[12..16]),
                    )
                } else {
                    (0, 0, 0)
                };
                Ok(Pdu::EndOfData(EndOfDataPdu {
                    version: header.version,
                    session: header.session,
                    serial: be_u32(&body[0..4]),
                    refresh,
                    retry,
                    expire,
                }))
            }
            PduType::CacheReset => {
                expect(0)?;
                Ok(Pdu::CacheReset(CacheResetPdu {
                    version: header.version,
                }))
            }
            PduType::ErrorReport => {
                if body.len() < 8 {
                    return Err(Error::LengthMismatch {
                        length: header.length,
                    });
                }
                let pdu_len = be_u32(&body[0..4]) as usize;
                if body.len() < 4 + pdu_len + 4 {
                    return Err(Error::LengthMismatch {
                        length: header.length,
                    });
                }
                let pdu_copy = body[4..4 + pdu_len].to_vec();
                let rest = &body[4 + pdu_len..];
                let text_len = be_u32(&rest[0..4]) as usize;
                if rest.len() != 4 + text_len {
                    return Err(Error::LengthMismatch {
                        length: header.length,
                    });
                }
                let text = String::from_utf8(rest[4..].to_vec())
                    .map_err(|_| Error::BadErrorText)?;
                Ok(Pdu::ErrorReport(ErrorReportPdu {
                    version: header.version,
                    code: ErrorCode::try_from(header.session)?,
                    pdu_copy,
                    text,
                }))
            }
        }
    }
}

fn be_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}
