//! pgoutput logical replication protocol
//!
//! Parses the CopyData frames of a `START_REPLICATION ... LOGICAL` session:
//! XLogData (`w`) frames wrapping pgoutput messages, primary keepalives
//! (`k`), and encodes standby status updates (`r`).

use super::wire::{WireReader, WireWriter};
use crate::error::{CdcError, Result};
use crate::types::{format_lsn, Lsn};
use bytes::Bytes;
use tracing::debug;

/// PostgreSQL object identifier
pub type Oid = u32;

/// Transaction id
pub type Xid = u32;

/// Message type constants for the pgoutput protocol
pub mod message_types {
    pub const BEGIN: u8 = b'B';
    pub const COMMIT: u8 = b'C';
    pub const ORIGIN: u8 = b'O';
    pub const RELATION: u8 = b'R';
    pub const TYPE: u8 = b'Y';
    pub const INSERT: u8 = b'I';
    pub const UPDATE: u8 = b'U';
    pub const DELETE: u8 = b'D';
    pub const TRUNCATE: u8 = b'T';
    pub const MESSAGE: u8 = b'M';

    // in-progress transaction streaming, never requested
    pub const STREAM_START: u8 = b'S';
    pub const STREAM_STOP: u8 = b'E';
    pub const STREAM_COMMIT: u8 = b'c';
    pub const STREAM_ABORT: u8 = b'A';

    // CopyData envelope
    pub const XLOG_DATA: u8 = b'w';
    pub const PRIMARY_KEEPALIVE: u8 = b'k';
    pub const STANDBY_STATUS_UPDATE: u8 = b'r';
}

/// Replica identity setting of a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentity {
    Default,
    Nothing,
    Full,
    Index,
}

impl ReplicaIdentity {
    fn from_byte(b: u8) -> Self {
        match b {
            b'n' => ReplicaIdentity::Nothing,
            b'f' => ReplicaIdentity::Full,
            b'i' => ReplicaIdentity::Index,
            _ => ReplicaIdentity::Default,
        }
    }
}

/// Column metadata carried by a Relation message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column flags (bit 0 = part of the replica identity key)
    pub flags: u8,
    pub name: String,
    pub type_id: Oid,
    pub type_modifier: i32,
}

impl ColumnInfo {
    pub fn is_key(&self) -> bool {
        self.flags & 0x01 != 0
    }
}

/// One column of a tuple
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleValue {
    Null,
    /// TOASTed value not sent because it did not change
    Unchanged,
    Text(Bytes),
    Binary(Bytes),
}

pub type TupleData = Vec<TupleValue>;

/// Decoded pgoutput message
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalReplicationMessage {
    Begin {
        /// LSN of the commit record
        final_lsn: Lsn,
        timestamp: i64,
        xid: Xid,
    },
    Commit {
        flags: u8,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        timestamp: i64,
    },
    Origin {
        origin_lsn: Lsn,
        origin_name: String,
    },
    Relation {
        relation_id: Oid,
        namespace: String,
        relation_name: String,
        replica_identity: ReplicaIdentity,
        columns: Vec<ColumnInfo>,
    },
    Type {
        type_id: Oid,
        namespace: String,
        type_name: String,
    },
    Insert {
        relation_id: Oid,
        tuple: TupleData,
    },
    Update {
        relation_id: Oid,
        /// `K` (key columns only) or `O` (full old row)
        key_type: Option<u8>,
        old_tuple: Option<TupleData>,
        new_tuple: TupleData,
    },
    Delete {
        relation_id: Oid,
        key_type: u8,
        old_tuple: TupleData,
    },
    Truncate {
        relation_ids: Vec<Oid>,
        flags: u8,
    },
    /// Logical decoding message emitted with `pg_logical_emit_message`
    Message {
        transactional: bool,
        lsn: Lsn,
        prefix: String,
        content: Bytes,
    },
}

/// Stateless pgoutput message parser
#[derive(Debug, Clone)]
pub struct LogicalReplicationParser {
    protocol_version: u32,
}

impl LogicalReplicationParser {
    pub fn with_protocol_version(protocol_version: u32) -> Self {
        Self { protocol_version }
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Parse the payload of one XLogData frame
    pub fn parse(&self, data: Bytes) -> Result<LogicalReplicationMessage> {
        let mut reader = WireReader::from_bytes(data);
        let message_type = reader.read_u8()?;

        let message = match message_type {
            message_types::BEGIN => Self::parse_begin(&mut reader)?,
            message_types::COMMIT => Self::parse_commit(&mut reader)?,
            message_types::ORIGIN => Self::parse_origin(&mut reader)?,
            message_types::RELATION => Self::parse_relation(&mut reader)?,
            message_types::TYPE => Self::parse_type(&mut reader)?,
            message_types::INSERT => Self::parse_insert(&mut reader)?,
            message_types::UPDATE => Self::parse_update(&mut reader)?,
            message_types::DELETE => Self::parse_delete(&mut reader)?,
            message_types::TRUNCATE => Self::parse_truncate(&mut reader)?,
            message_types::MESSAGE => Self::parse_message(&mut reader)?,
            message_types::STREAM_START
            | message_types::STREAM_STOP
            | message_types::STREAM_COMMIT
            | message_types::STREAM_ABORT => {
                return Err(CdcError::unsupported(format!(
                    "Streaming message '{}' received but streaming was not requested (protocol v{})",
                    message_type as char, self.protocol_version
                )));
            }
            _ => {
                return Err(CdcError::protocol(format!(
                    "Unknown message type: {} ('{}')",
                    message_type, message_type as char
                )));
            }
        };

        Ok(message)
    }

    fn parse_begin(reader: &mut WireReader) -> Result<LogicalReplicationMessage> {
        let final_lsn = reader.read_u64()?;
        let timestamp = reader.read_i64()?;
        let xid = reader.read_u32()?;

        debug!("BEGIN: final_lsn={}, xid={}", format_lsn(final_lsn), xid);

        Ok(LogicalReplicationMessage::Begin {
            final_lsn,
            timestamp,
            xid,
        })
    }

    fn parse_commit(reader: &mut WireReader) -> Result<LogicalReplicationMessage> {
        let flags = reader.read_u8()?;
        let commit_lsn = reader.read_u64()?;
        let end_lsn = reader.read_u64()?;
        let timestamp = reader.read_i64()?;

        debug!(
            "COMMIT: commit_lsn={}, end_lsn={}",
            format_lsn(commit_lsn),
            format_lsn(end_lsn)
        );

        Ok(LogicalReplicationMessage::Commit {
            flags,
            commit_lsn,
            end_lsn,
            timestamp,
        })
    }

    fn parse_origin(reader: &mut WireReader) -> Result<LogicalReplicationMessage> {
        let origin_lsn = reader.read_u64()?;
        let origin_name = reader.read_cstring()?;
        Ok(LogicalReplicationMessage::Origin {
            origin_lsn,
            origin_name,
        })
    }

    fn parse_relation(reader: &mut WireReader) -> Result<LogicalReplicationMessage> {
        let relation_id = reader.read_u32()?;
        let namespace = reader.read_cstring()?;
        let relation_name = reader.read_cstring()?;
        let replica_identity = ReplicaIdentity::from_byte(reader.read_u8()?);
        let column_count = reader.read_u16()?;

        debug!(
            "RELATION: id={}, {}.{}, columns={}",
            relation_id, namespace, relation_name, column_count
        );

        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let flags = reader.read_u8()?;
            let name = reader.read_cstring()?;
            let type_id = reader.read_u32()?;
            let type_modifier = reader.read_i32()?;
            columns.push(ColumnInfo {
                flags,
                name,
                type_id,
                type_modifier,
            });
        }

        Ok(LogicalReplicationMessage::Relation {
            relation_id,
            namespace,
            relation_name,
            replica_identity,
            columns,
        })
    }

    fn parse_type(reader: &mut WireReader) -> Result<LogicalReplicationMessage> {
        let type_id = reader.read_u32()?;
        let namespace = reader.read_cstring()?;
        let type_name = reader.read_cstring()?;
        Ok(LogicalReplicationMessage::Type {
            type_id,
            namespace,
            type_name,
        })
    }

    fn parse_insert(reader: &mut WireReader) -> Result<LogicalReplicationMessage> {
        let relation_id = reader.read_u32()?;
        let tuple_type = reader.read_u8()?;
        if tuple_type != b'N' {
            return Err(CdcError::protocol(format!(
                "Unexpected tuple type in INSERT: '{}' (expected 'N')",
                tuple_type as char
            )));
        }
        let tuple = Self::parse_tuple_data(reader)?;
        Ok(LogicalReplicationMessage::Insert { relation_id, tuple })
    }

    fn parse_update(reader: &mut WireReader) -> Result<LogicalReplicationMessage> {
        let relation_id = reader.read_u32()?;

        let mut key_type = None;
        let mut old_tuple = None;
        let marker = reader.peek_u8()?;
        if marker == b'K' || marker == b'O' {
            reader.read_u8()?;
            key_type = Some(marker);
            old_tuple = Some(Self::parse_tuple_data(reader)?);
        }

        let new_tuple_type = reader.read_u8()?;
        if new_tuple_type != b'N' {
            return Err(CdcError::protocol(format!(
                "Unexpected new tuple type in UPDATE: '{}' (expected 'N')",
                new_tuple_type as char
            )));
        }
        let new_tuple = Self::parse_tuple_data(reader)?;

        Ok(LogicalReplicationMessage::Update {
            relation_id,
            key_type,
            old_tuple,
            new_tuple,
        })
    }

    fn parse_delete(reader: &mut WireReader) -> Result<LogicalReplicationMessage> {
        let relation_id = reader.read_u32()?;
        let key_type = reader.read_u8()?;
        if key_type != b'K' && key_type != b'O' {
            return Err(CdcError::protocol(format!(
                "Unexpected tuple type in DELETE: '{}' (expected 'K' or 'O')",
                key_type as char
            )));
        }
        let old_tuple = Self::parse_tuple_data(reader)?;
        Ok(LogicalReplicationMessage::Delete {
            relation_id,
            key_type,
            old_tuple,
        })
    }

    fn parse_truncate(reader: &mut WireReader) -> Result<LogicalReplicationMessage> {
        let relation_count = reader.read_u32()?;
        let flags = reader.read_u8()?;
        let relation_ids = (0..relation_count)
            .map(|_| reader.read_u32())
            .collect::<Result<Vec<_>>>()?;
        Ok(LogicalReplicationMessage::Truncate {
            relation_ids,
            flags,
        })
    }

    fn parse_message(reader: &mut WireReader) -> Result<LogicalReplicationMessage> {
        let flags = reader.read_u8()?;
        let lsn = reader.read_u64()?;
        let prefix = reader.read_cstring()?;
        let length = reader.read_u32()?;
        let content = reader.read_bytes(length as usize)?;
        Ok(LogicalReplicationMessage::Message {
            transactional: flags & 0x01 != 0,
            lsn,
            prefix,
            content,
        })
    }

    fn parse_tuple_data(reader: &mut WireReader) -> Result<TupleData> {
        let column_count = reader.read_u16()?;
        let mut columns = Vec::with_capacity(column_count as usize);

        for _ in 0..column_count {
            let value = match reader.read_u8()? {
                b'n' => TupleValue::Null,
                b'u' => TupleValue::Unchanged,
                b't' => {
                    let length = reader.read_u32()?;
                    TupleValue::Text(reader.read_bytes(length as usize)?)
                }
                b'b' => {
                    let length = reader.read_u32()?;
                    TupleValue::Binary(reader.read_bytes(length as usize)?)
                }
                other => {
                    return Err(CdcError::protocol(format!(
                        "Unknown column data type: '{}'",
                        other as char
                    )));
                }
            };
            columns.push(value);
        }

        Ok(columns)
    }
}

/// Header of an XLogData frame plus its pgoutput payload
#[derive(Debug, Clone)]
pub struct XLogData {
    pub wal_start: Lsn,
    pub wal_end: Lsn,
    pub send_time: i64,
    pub payload: Bytes,
}

/// Keepalive message from the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveMessage {
    pub wal_end: Lsn,
    pub timestamp: i64,
    pub reply_requested: bool,
}

/// One CopyData frame of the replication stream
#[derive(Debug, Clone)]
pub enum ReplicationFrame {
    XLogData(XLogData),
    Keepalive(KeepaliveMessage),
}

impl ReplicationFrame {
    /// Split a raw CopyData frame into its envelope
    pub fn parse(frame: Bytes) -> Result<Self> {
        let mut reader = WireReader::from_bytes(frame);
        match reader.read_u8()? {
            message_types::XLOG_DATA => {
                let wal_start = reader.read_u64()?;
                let wal_end = reader.read_u64()?;
                let send_time = reader.read_i64()?;
                let payload = reader.read_bytes(reader.remaining())?;
                if payload.is_empty() {
                    return Err(CdcError::protocol("Empty WAL message"));
                }
                Ok(ReplicationFrame::XLogData(XLogData {
                    wal_start,
                    wal_end,
                    send_time,
                    payload,
                }))
            }
            message_types::PRIMARY_KEEPALIVE => {
                if reader.remaining() < 17 {
                    return Err(CdcError::protocol("Keepalive message too short"));
                }
                Ok(ReplicationFrame::Keepalive(KeepaliveMessage {
                    wal_end: reader.read_u64()?,
                    timestamp: reader.read_i64()?,
                    reply_requested: reader.read_u8()? != 0,
                }))
            }
            other => Err(CdcError::protocol(format!(
                "Unknown replication frame type: '{}'",
                other as char
            ))),
        }
    }
}

/// Positions reported to the server in a standby status update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StandbyStatus {
    pub received_lsn: Lsn,
    pub flushed_lsn: Lsn,
    pub applied_lsn: Lsn,
    pub reply_requested: bool,
}

impl StandbyStatus {
    /// Encode as an `r` CopyData frame; `now` is microseconds since the PostgreSQL epoch
    pub fn encode(&self, now: i64) -> Bytes {
        let mut writer = WireWriter::new();
        writer
            .u8(message_types::STANDBY_STATUS_UPDATE)
            .u64(self.received_lsn)
            .u64(self.flushed_lsn)
            .u64(self.applied_lsn)
            .i64(now)
            .u8(self.reply_requested as u8);
        writer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> LogicalReplicationParser {
        LogicalReplicationParser::with_protocol_version(1)
    }

    #[test]
    fn test_parse_begin_and_commit() {
        let mut w = WireWriter::new();
        w.u8(b'B').u64(0x3000).i64(1_000).u32(77);
        match parser().parse(w.finish()).unwrap() {
            LogicalReplicationMessage::Begin {
                final_lsn, xid, ..
            } => {
                assert_eq!(final_lsn, 0x3000);
                assert_eq!(xid, 77);
            }
            other => panic!("unexpected {:?}", other),
        }

        w.u8(b'C').u8(0).u64(0x3000).u64(0x3050).i64(1_000);
        assert!(matches!(
            parser().parse(w.finish()).unwrap(),
            LogicalReplicationMessage::Commit {
                commit_lsn: 0x3000,
                end_lsn: 0x3050,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_relation_with_key_flags() {
        let mut w = WireWriter::new();
        w.u8(b'R').u32(16384).cstring("public").cstring("users").u8(b'd').u16(2);
        w.u8(1).cstring("id").u32(23).i32(-1);
        w.u8(0).cstring("name").u32(25).i32(-1);

        match parser().parse(w.finish()).unwrap() {
            LogicalReplicationMessage::Relation {
                relation_id,
                namespace,
                relation_name,
                replica_identity,
                columns,
            } => {
                assert_eq!(relation_id, 16384);
                assert_eq!(namespace, "public");
                assert_eq!(relation_name, "users");
                assert_eq!(replica_identity, ReplicaIdentity::Default);
                assert!(columns[0].is_key());
                assert!(!columns[1].is_key());
                assert_eq!(columns[1].type_id, 25);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_update_with_old_key() {
        let mut w = WireWriter::new();
        w.u8(b'U').u32(1);
        w.u8(b'K').u16(1).u8(b't').u32(1).bytes(b"7");
        w.u8(b'N').u16(2).u8(b't').u32(1).bytes(b"8").u8(b'u');

        match parser().parse(w.finish()).unwrap() {
            LogicalReplicationMessage::Update {
                key_type,
                old_tuple,
                new_tuple,
                ..
            } => {
                assert_eq!(key_type, Some(b'K'));
                assert_eq!(
                    old_tuple.unwrap(),
                    vec![TupleValue::Text(Bytes::from_static(b"7"))]
                );
                assert_eq!(new_tuple[1], TupleValue::Unchanged);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_truncate_and_message() {
        let mut w = WireWriter::new();
        w.u8(b'T').u32(2).u8(0).u32(10).u32(11);
        assert_eq!(
            parser().parse(w.finish()).unwrap(),
            LogicalReplicationMessage::Truncate {
                relation_ids: vec![10, 11],
                flags: 0
            }
        );

        w.u8(b'M').u8(1).u64(5).cstring("pg2lake.ddl").u32(3).bytes(b"ddl");
        match parser().parse(w.finish()).unwrap() {
            LogicalReplicationMessage::Message {
                transactional,
                prefix,
                content,
                ..
            } => {
                assert!(transactional);
                assert_eq!(prefix, "pg2lake.ddl");
                assert_eq!(&content[..], b"ddl");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truncated_and_unknown_messages_are_errors() {
        let mut w = WireWriter::new();
        w.u8(b'I').u32(1).u8(b'N').u16(1).u8(b't').u32(10).bytes(b"abc");
        assert!(parser().parse(w.finish()).is_err());

        w.u8(b'Z');
        assert!(matches!(
            parser().parse(w.finish()).unwrap_err(),
            CdcError::Protocol(_)
        ));

        w.u8(b'S').u32(1).u8(1);
        assert!(matches!(
            parser().parse(w.finish()).unwrap_err(),
            CdcError::Unsupported(_)
        ));
    }

    #[test]
    fn test_frame_envelopes() {
        let mut w = WireWriter::new();
        w.u8(b'k').u64(0x99).i64(5).u8(1);
        match ReplicationFrame::parse(w.finish()).unwrap() {
            ReplicationFrame::Keepalive(k) => {
                assert_eq!(k.wal_end, 0x99);
                assert!(k.reply_requested);
            }
            other => panic!("unexpected {:?}", other),
        }

        w.u8(b'w').u64(1).u64(2).i64(3).u8(b'B');
        match ReplicationFrame::parse(w.finish()).unwrap() {
            ReplicationFrame::XLogData(x) => {
                assert_eq!(x.wal_start, 1);
                assert_eq!(&x.payload[..], b"B");
            }
            other => panic!("unexpected {:?}", other),
        }

        w.u8(b'k').u64(1);
        assert!(ReplicationFrame::parse(w.finish()).is_err());
    }

    #[test]
    fn test_standby_status_encoding() {
        let frame = StandbyStatus {
            received_lsn: 3,
            flushed_lsn: 2,
            applied_lsn: 1,
            reply_requested: false,
        }
        .encode(42);
        assert_eq!(frame.len(), 34);
        assert_eq!(frame[0], b'r');
        let mut reader = WireReader::from_bytes(frame.slice(1..));
        assert_eq!(reader.read_u64().unwrap(), 3);
        assert_eq!(reader.read_u64().unwrap(), 2);
        assert_eq!(reader.read_u64().unwrap(), 1);
        assert_eq!(reader.read_i64().unwrap(), 42);
        assert_eq!(reader.read_u8().unwrap(), 0);
    }
}
