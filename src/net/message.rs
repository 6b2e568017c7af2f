//! Protocol message set: a closed, fixed-size set of message types. Only the
//! last four carry brokerage/coordinator semantics; everything else is a reserved
//! identifier the codec recognizes and skips without interpreting.

use crate::error::{BrokerError, Result};
use crate::net::address::Address;
use crate::net::wire::{
    read_bool, read_string, read_u32, read_u8, write_bool, write_string, write_u32, write_u8,
};

/// Fixed 4-byte header prefixing every message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: u8,
    pub msg_size: u8,
    pub has_payload: bool,
}

impl MessageHeader {
    pub const WIRE_LEN: usize = 4;

    pub fn encode(self) -> [u8; 4] {
        [self.msg_type, self.msg_size, self.has_payload as u8, 0]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::WIRE_LEN {
            return Err(BrokerError::CorruptFrame {
                peer: None,
                reason: "frame shorter than header".into(),
            });
        }
        Ok(Self {
            msg_type: bytes[0],
            msg_size: bytes[1],
            has_payload: bytes[2] != 0,
        })
    }
}

/// The closed set of message type identifiers. Only the brokerage-relevant four
/// are given structured encodings; the rest are reserved for the FASTBuild job
/// dispatch/result pipeline this subsystem does not implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Connection = 1,
    Status = 2,
    RequestJob = 3,
    NoJobAvailable = 4,
    Job = 5,
    JobResult = 6,
    RequestManifest = 7,
    Manifest = 8,
    RequestFile = 9,
    File = 10,
    JobResultCompressed = 11,
    ConnectionAck = 12,
    RequestWorkerList = 13,
    WorkerList = 14,
    SetWorkerStatus = 15,
    UpdateWorkerInfo = 16,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => Self::Connection,
            2 => Self::Status,
            3 => Self::RequestJob,
            4 => Self::NoJobAvailable,
            5 => Self::Job,
            6 => Self::JobResult,
            7 => Self::RequestManifest,
            8 => Self::Manifest,
            9 => Self::RequestFile,
            10 => Self::File,
            11 => Self::JobResultCompressed,
            12 => Self::ConnectionAck,
            13 => Self::RequestWorkerList,
            14 => Self::WorkerList,
            15 => Self::SetWorkerStatus,
            16 => Self::UpdateWorkerInfo,
            other => return Err(BrokerError::UnknownMessage(other)),
        })
    }

    /// `true` for the four message types this codec gives structured encodings to;
    /// everything else is reserved and is passed through as an opaque body.
    pub fn is_core(self) -> bool {
        matches!(
            self,
            Self::RequestWorkerList | Self::WorkerList | Self::SetWorkerStatus | Self::UpdateWorkerInfo
        )
    }
}

/// Descriptive worker fields carried by `UpdateWorkerInfo`, and optionally embedded
/// per-entry in a `want_full_info` `WorkerList` reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkerInfoFields {
    pub version: String,
    pub user: String,
    pub hostname: String,
    pub domainname: String,
    pub mode: String,
    pub available_cpus: u32,
    pub total_cpus: u32,
    pub memory_mib: u32,
}

impl WorkerInfoFields {
    fn write(&self, out: &mut Vec<u8>) {
        write_string(out, &self.version);
        write_string(out, &self.user);
        write_string(out, &self.hostname);
        write_string(out, &self.domainname);
        write_string(out, &self.mode);
        write_u32(out, self.available_cpus);
        write_u32(out, self.total_cpus);
        write_u32(out, self.memory_mib);
    }

    fn read(cursor: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            version: read_string(cursor)?,
            user: read_string(cursor)?,
            hostname: read_string(cursor)?,
            domainname: read_string(cursor)?,
            mode: read_string(cursor)?,
            available_cpus: read_u32(cursor)?,
            total_cpus: read_u32(cursor)?,
            memory_mib: read_u32(cursor)?,
        })
    }
}

/// One entry of a `WorkerList` reply payload; the flavor (address-only vs. full) is
/// fixed for the whole reply by the originating request's `want_full_info` flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerListEntry {
    AddressOnly(Address),
    Full(Address, WorkerInfoFields),
}

impl WorkerListEntry {
    fn write(&self, out: &mut Vec<u8>) {
        match self {
            Self::AddressOnly(addr) => write_u32(out, addr.0),
            Self::Full(addr, info) => {
                info.write(out);
                write_u32(out, addr.0);
            }
        }
    }

    fn read(cursor: &mut &[u8], full: bool) -> Result<Self> {
        if full {
            let info = WorkerInfoFields::read(cursor)?;
            let addr = Address(read_u32(cursor)?);
            Ok(Self::Full(addr, info))
        } else {
            Ok(Self::AddressOnly(Address(read_u32(cursor)?)))
        }
    }
}

/// A decoded message: the four structured variants plus a catch-all for the
/// reserved identifiers this codec recognizes but never interprets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RequestWorkerList {
        protocol_version: u32,
        platform: u8,
        want_full_info: bool,
    },
    WorkerList {
        entries: Vec<WorkerListEntry>,
    },
    SetWorkerStatus {
        is_available: bool,
        protocol_version: u32,
        platform: u8,
    },
    UpdateWorkerInfo {
        info: WorkerInfoFields,
    },
    /// A reserved (job-dispatch pipeline) message type, passed through unparsed.
    Reserved {
        msg_type: MessageType,
        body: Vec<u8>,
        payload: Option<Vec<u8>>,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::RequestWorkerList { .. } => MessageType::RequestWorkerList,
            Self::WorkerList { .. } => MessageType::WorkerList,
            Self::SetWorkerStatus { .. } => MessageType::SetWorkerStatus,
            Self::UpdateWorkerInfo { .. } => MessageType::UpdateWorkerInfo,
            Self::Reserved { msg_type, .. } => *msg_type,
        }
    }

    pub fn has_payload(&self) -> bool {
        matches!(self, Self::WorkerList { .. } | Self::UpdateWorkerInfo { .. })
            || matches!(self, Self::Reserved { payload: Some(_), .. })
    }

    /// Encode the fixed header+body frame. Returns the frame and, separately, the
    /// payload bytes if `has_payload()` is true — the caller sends these as two
    /// independent length-prefixed writes.
    pub fn encode(&self) -> (Vec<u8>, Option<Vec<u8>>) {
        let mut body = Vec::new();
        let payload = match self {
            Self::RequestWorkerList {
                protocol_version,
                platform,
                want_full_info,
            } => {
                write_u32(&mut body, *protocol_version);
                write_u8(&mut body, *platform);
                body.extend_from_slice(&[0, 0, 0]); // pad[3]
                write_bool(&mut body, *want_full_info);
                None
            }
            Self::WorkerList { entries } => {
                let mut payload = Vec::new();
                write_u32(&mut payload, entries.len() as u32);
                for entry in entries {
                    entry.write(&mut payload);
                }
                Some(payload)
            }
            Self::SetWorkerStatus {
                is_available,
                protocol_version,
                platform,
            } => {
                write_bool(&mut body, *is_available);
                body.push(0); // pad
                write_u32(&mut body, *protocol_version);
                write_u8(&mut body, *platform);
                None
            }
            Self::UpdateWorkerInfo { info } => {
                let mut payload = Vec::new();
                info.write(&mut payload);
                Some(payload)
            }
            Self::Reserved { body: b, payload, .. } => {
                body = b.clone();
                payload.clone()
            }
        };

        let header = MessageHeader {
            msg_type: self.message_type() as u8,
            msg_size: (MessageHeader::WIRE_LEN + body.len()) as u8,
            has_payload: payload.is_some(),
        };

        let mut frame = header.encode().to_vec();
        frame.extend_from_slice(&body);
        (frame, payload)
    }

    /// Decode a received `(header+body frame, optional payload frame)` pair.
    ///
    /// `want_full_info_hint` tells a `WorkerList` decode which entry flavor to
    /// expect; it is the `want_full_info` value the local side sent on the
    /// matching `RequestWorkerList`, since the flavor is not repeated on the wire.
    pub fn decode(frame: &[u8], payload: Option<&[u8]>, want_full_info_hint: bool) -> Result<Self> {
        let header = MessageHeader::decode(frame)?;
        if header.msg_size as usize != frame.len() {
            return Err(BrokerError::CorruptFrame {
                peer: None,
                reason: format!(
                    "declared msg_size {} does not match frame length {}",
                    header.msg_size,
                    frame.len()
                ),
            });
        }
        if header.has_payload != payload.is_some() {
            return Err(BrokerError::CorruptFrame {
                peer: None,
                reason: "has_payload flag disagrees with presence of a payload frame".into(),
            });
        }

        let msg_type = MessageType::from_u8(header.msg_type)?;
        let mut body = &frame[MessageHeader::WIRE_LEN..];

        Ok(match msg_type {
            MessageType::RequestWorkerList => {
                let protocol_version = read_u32(&mut body)?;
                let platform = read_u8(&mut body)?;
                if body.len() < 3 {
                    return Err(BrokerError::CorruptFrame {
                        peer: None,
                        reason: "RequestWorkerList missing pad bytes".into(),
                    });
                }
                body = &body[3..];
                let want_full_info = read_bool(&mut body)?;
                Message::RequestWorkerList {
                    protocol_version,
                    platform,
                    want_full_info,
                }
            }
            MessageType::WorkerList => {
                let payload = payload.ok_or_else(|| BrokerError::CorruptFrame {
                    peer: None,
                    reason: "WorkerList requires a payload".into(),
                })?;
                let mut cursor = payload;
                let count = read_u32(&mut cursor)?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    entries.push(WorkerListEntry::read(&mut cursor, want_full_info_hint)?);
                }
                if !cursor.is_empty() {
                    return Err(BrokerError::CorruptFrame {
                        peer: None,
                        reason: "trailing bytes after WorkerList entries".into(),
                    });
                }
                Message::WorkerList { entries }
            }
            MessageType::SetWorkerStatus => {
                let is_available = read_bool(&mut body)?;
                if body.is_empty() {
                    return Err(BrokerError::CorruptFrame {
                        peer: None,
                        reason: "SetWorkerStatus missing pad byte".into(),
                    });
                }
                body = &body[1..];
                let protocol_version = read_u32(&mut body)?;
                let platform = read_u8(&mut body)?;
                Message::SetWorkerStatus {
                    is_available,
                    protocol_version,
                    platform,
                }
            }
            MessageType::UpdateWorkerInfo => {
                let payload = payload.ok_or_else(|| BrokerError::CorruptFrame {
                    peer: None,
                    reason: "UpdateWorkerInfo requires a payload".into(),
                })?;
                let mut cursor = payload;
                let info = WorkerInfoFields::read(&mut cursor)?;
                if !cursor.is_empty() {
                    return Err(BrokerError::CorruptFrame {
                        peer: None,
                        reason: "trailing bytes after UpdateWorkerInfo payload".into(),
                    });
                }
                Message::UpdateWorkerInfo { info }
            }
            other => Message::Reserved {
                msg_type: other,
                body: body.to_vec(),
                payload: payload.map(|p| p.to_vec()),
            },
        })
    }
}
