//! The RPC operation family: one tagged variant per opcode over a shared
//! envelope record.
//!
//! Every op knows how to emit its request (`emit_request`), refine a parsed
//! response header bag into typed results (`parse_response`), and describe
//! itself for logs (`Display`). Idempotency and chunk access are orthogonal
//! to the opcode and ride as optional sub-records next to the variant
//! payload.

use std::fmt;

use crate::rpc::envelope::{parse_response as parse_response_props, RequestWriter};
use crate::rpc::Properties;
use crate::utils::{MetaError, ServerLocation};
use crate::vr::LogSeq;

use bytes::{Bytes, BytesMut};

/// Client-assigned request id value meaning "not idempotent-tracked".
pub const REQ_ID_NONE: i64 = -1;

/// Request/response content body with explicit ownership: either a buffer
/// this op owns and may grow, or a shared slice borrowed from the caller.
#[derive(Debug, Clone, Default)]
pub enum Buffer {
    /// No body attached.
    #[default]
    Empty,

    /// Owned, writable body bytes.
    Owned(BytesMut),

    /// Shared view over caller-provided bytes.
    Shared(Bytes),
}

impl Buffer {
    /// Body length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Buffer::Empty => 0,
            Buffer::Owned(b) => b.len(),
            Buffer::Shared(b) => b.len(),
        }
    }

    /// Whether no body bytes are attached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-only view of the body bytes.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Buffer::Empty => &[],
            Buffer::Owned(b) => b.as_ref(),
            Buffer::Shared(b) => b.as_ref(),
        }
    }

    /// Ensures an owned buffer with at least `len` capacity is in place and
    /// returns it for writing. A shared view is promoted to an owned copy;
    /// existing owned bytes are kept.
    pub fn ensure_capacity(&mut self, len: usize) -> &mut BytesMut {
        match self {
            Buffer::Owned(b) => {
                if b.capacity() < len {
                    b.reserve(len - b.capacity());
                }
            }
            Buffer::Shared(b) => {
                let mut owned = BytesMut::with_capacity(len.max(b.len()));
                owned.extend_from_slice(b);
                *self = Buffer::Owned(owned);
            }
            Buffer::Empty => {
                *self = Buffer::Owned(BytesMut::with_capacity(len));
            }
        }
        match self {
            Buffer::Owned(b) => b,
            _ => unreachable!(),
        }
    }

    /// Detaches and returns the current body, leaving `Empty` behind.
    pub fn take(&mut self) -> Buffer {
        std::mem::take(self)
    }
}

/// Idempotent-op sub-record: the client-assigned id the server dedups on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotentInfo {
    /// Client-assigned request id; `REQ_ID_NONE` disables dedup.
    pub req_id: i64,
}

/// Chunk-server access sub-record shared by all chunk ops: the access token
/// block and its request flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkAccessInfo {
    /// Target chunk handle.
    pub chunk_id: i64,

    /// Chunk version the caller believes current.
    pub chunk_version: i64,

    /// Access token presented to the chunk server; empty disables the block.
    pub access: String,

    /// Request issuing of a fresh chunk access token.
    pub create_chunk_access: bool,

    /// Request issuing of a fresh chunk *server* access token.
    pub create_chunk_server_access: bool,

    /// Optional delegation subject id.
    pub subject_id: Option<i64>,
}

impl ChunkAccessInfo {
    /// Creates the sub-record for one chunk handle.
    pub fn new(chunk_id: i64, chunk_version: i64) -> Self {
        ChunkAccessInfo {
            chunk_id,
            chunk_version,
            ..Default::default()
        }
    }

    // Access block header names are fixed by the wire format; the short
    // variants are two-letter tokens rather than the envelope-level ones.
    fn write_req(&self, w: &mut RequestWriter) {
        if self.access.is_empty() {
            return;
        }
        let short = w.is_short();
        if let Some(subject_id) = self.subject_id {
            w.raw(&format!(
                "{}{}\r\n",
                if short { "I:" } else { "Subject-id: " },
                subject_id
            ));
        }
        w.raw(&format!(
            "{}{}\r\n",
            if short { "C:" } else { "C-access: " },
            self.access
        ));
        if self.create_chunk_server_access {
            w.raw(if short { "SR:1\r\n" } else { "CS-access-req: 1\r\n" });
        } else if self.create_chunk_access {
            w.raw(if short { "CR:1\r\n" } else { "C-access-req: 1\r\n" });
        }
    }
}

/// Closed set of operation codes.
///
/// The chunk-map and chunk-to-server-map dumps intentionally share
/// `DumpChunkToServerMap`: the upstream protocol assigns both verbs one
/// opcode, and the collision is preserved here rather than papered over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Unknown,
    // metadata server ops
    Create,
    Mkdir,
    Remove,
    Rmdir,
    Rename,
    Link,
    Lookup,
    Readdir,
    ReaddirPlus,
    GetAlloc,
    GetLayout,
    Allocate,
    Truncate,
    CoalesceBlocks,
    SetMtime,
    ChangeFileReplication,
    GetPathName,
    Chmod,
    Chown,
    LeaseAcquire,
    LeaseRenew,
    LeaseRelinquish,
    // chunk server ops
    Close,
    Size,
    Read,
    WriteIdAlloc,
    WritePrepare,
    WriteSync,
    RecordAppend,
    ChunkSpaceReserve,
    ChunkSpaceRelease,
    GetChunkMetadata,
    // auth ops
    Authenticate,
    Delegate,
    DelegateCancel,
    // admin & stats ops
    MetaPing,
    MetaStats,
    ChunkPing,
    ChunkStats,
    RetireChunkserver,
    Fsck,
    ToggleWorm,
    DumpChunkToServerMap,
    ReadMetaData,
    // VR control ops
    VrHello,
    VrStartViewChange,
    VrDoViewChange,
    VrStartView,
    VrReconfiguration,
    VrGetStatus,
}

impl OpCode {
    /// The request verb written on the envelope's first line.
    pub fn verb(self) -> &'static str {
        match self {
            OpCode::Unknown => "UNKNOWN",
            OpCode::Create => "CREATE",
            OpCode::Mkdir => "MKDIR",
            OpCode::Remove => "REMOVE",
            OpCode::Rmdir => "RMDIR",
            OpCode::Rename => "RENAME",
            OpCode::Link => "LINK",
            OpCode::Lookup => "LOOKUP",
            OpCode::Readdir => "READDIR",
            OpCode::ReaddirPlus => "READDIRPLUS",
            OpCode::GetAlloc => "GETALLOC",
            OpCode::GetLayout => "GETLAYOUT",
            OpCode::Allocate => "ALLOCATE",
            OpCode::Truncate => "TRUNCATE",
            OpCode::CoalesceBlocks => "COALESCE_BLOCKS",
            OpCode::SetMtime => "SET_MTIME",
            OpCode::ChangeFileReplication => "CHANGE_FILE_REPLICATION",
            OpCode::GetPathName => "GETPATHNAME",
            OpCode::Chmod => "CHMOD",
            OpCode::Chown => "CHOWN",
            OpCode::LeaseAcquire => "LEASE_ACQUIRE",
            OpCode::LeaseRenew => "LEASE_RENEW",
            OpCode::LeaseRelinquish => "LEASE_RELINQUISH",
            OpCode::Close => "CLOSE",
            OpCode::Size => "SIZE",
            OpCode::Read => "READ",
            OpCode::WriteIdAlloc => "WRITE_ID_ALLOC",
            OpCode::WritePrepare => "WRITE_PREPARE",
            OpCode::WriteSync => "WRITE_SYNC",
            OpCode::RecordAppend => "RECORD_APPEND",
            OpCode::ChunkSpaceReserve => "CHUNK_SPACE_RESERVE",
            OpCode::ChunkSpaceRelease => "CHUNK_SPACE_RELEASE",
            OpCode::GetChunkMetadata => "GET_CHUNK_METADATA",
            OpCode::Authenticate => "AUTHENTICATE",
            OpCode::Delegate => "DELEGATE",
            OpCode::DelegateCancel => "DELEGATE_CANCEL",
            OpCode::MetaPing => "PING",
            OpCode::MetaStats => "STATS",
            OpCode::ChunkPing => "CHUNK_PING",
            OpCode::ChunkStats => "CHUNK_STATS",
            OpCode::RetireChunkserver => "RETIRE_CHUNKSERVER",
            OpCode::Fsck => "FSCK",
            OpCode::ToggleWorm => "TOGGLE_WORM",
            OpCode::DumpChunkToServerMap => "DUMP_CHUNKTOSERVERMAP",
            OpCode::ReadMetaData => "READ_META_DATA",
            OpCode::VrHello => "VR_HELLO",
            OpCode::VrStartViewChange => "VR_START_VIEW_CHANGE",
            OpCode::VrDoViewChange => "VR_DO_VIEW_CHANGE",
            OpCode::VrStartView => "VR_START_VIEW",
            OpCode::VrReconfiguration => "VR_RECONFIGURATION",
            OpCode::VrGetStatus => "VR_GET_STATUS",
        }
    }
}

/// Per-opcode request payload and typed results. Fields marked "result" are
/// filled by `parse_response`.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum OpRequest {
    /// Null op; stands in where no request is pending.
    #[default]
    None,

    Create {
        parent_fid: i64,
        name: String,
        num_replicas: i32,
        exclusive: bool,
        /// result
        file_id: i64,
    },
    Mkdir {
        parent_fid: i64,
        name: String,
        /// result
        file_id: i64,
    },
    Remove {
        parent_fid: i64,
        name: String,
        pathname: String,
    },
    Rmdir {
        parent_fid: i64,
        name: String,
        pathname: String,
    },
    Rename {
        parent_fid: i64,
        old_name: String,
        new_path: String,
        old_path: String,
        overwrite: bool,
    },
    Link {
        parent_fid: i64,
        name: String,
        target: String,
        /// result
        file_id: i64,
    },
    Lookup {
        parent_fid: i64,
        name: String,
        /// result
        file_id: i64,
        /// result
        is_directory: bool,
    },
    Readdir {
        fid: i64,
        /// result
        num_entries: i64,
        /// result
        has_more: bool,
    },
    ReaddirPlus {
        fid: i64,
        get_last_chunk_info: bool,
        /// result
        num_entries: i64,
        /// result
        has_more: bool,
    },
    GetAlloc {
        fid: i64,
        offset: i64,
        /// result
        chunk_id: i64,
        /// result
        chunk_version: i64,
        /// result
        servers: Vec<ServerLocation>,
    },
    GetLayout {
        fid: i64,
        /// result
        num_chunks: i64,
    },
    Allocate {
        fid: i64,
        offset: i64,
        pathname: String,
        append: bool,
        invalidate_all: bool,
        /// result
        chunk_id: i64,
        /// result
        chunk_version: i64,
        /// result
        master: Option<ServerLocation>,
        /// result
        servers: Vec<ServerLocation>,
    },
    Truncate {
        fid: i64,
        offset: i64,
        pathname: String,
    },
    CoalesceBlocks {
        src_path: String,
        dst_path: String,
        /// result
        dst_start_offset: i64,
    },
    SetMtime {
        fid: i64,
        mtime_sec: i64,
        mtime_usec: i64,
    },
    ChangeFileReplication {
        fid: i64,
        num_replicas: i32,
    },
    GetPathName {
        fid: i64,
        chunk_id: i64,
        /// result
        pathname: String,
    },
    Chmod {
        fid: i64,
        mode: u32,
    },
    Chown {
        fid: i64,
        user: i64,
        group: i64,
    },
    LeaseAcquire {
        pathname: String,
        chunk_id: i64,
        flush: bool,
        /// result
        lease_id: i64,
    },
    LeaseRenew {
        pathname: String,
        chunk_id: i64,
        lease_id: i64,
    },
    LeaseRelinquish {
        chunk_id: i64,
        lease_id: i64,
    },
    Close,
    Size {
        /// result
        size: i64,
    },
    Read {
        offset: i64,
        num_bytes: i64,
        /// result
        disk_io_time_usec: i64,
    },
    WriteIdAlloc {
        offset: i64,
        num_bytes: i64,
        for_record_append: bool,
        /// result
        write_id: String,
    },
    WritePrepare {
        offset: i64,
        num_bytes: i64,
        write_ids: String,
        body_checksum: u32,
    },
    WriteSync {
        offset: i64,
        num_bytes: i64,
        write_ids: String,
    },
    RecordAppend {
        num_bytes: i64,
        write_ids: String,
        /// result
        record_offset: i64,
    },
    ChunkSpaceReserve {
        num_bytes: i64,
        write_ids: String,
    },
    ChunkSpaceRelease {
        num_bytes: i64,
        write_ids: String,
    },
    GetChunkMetadata {
        read_verify: bool,
    },
    Authenticate {
        requested_auth_type: i32,
        /// result
        chosen_auth_type: i32,
        /// result
        use_ssl: bool,
    },
    Delegate {
        allow_delegation: bool,
        requested_valid_for: u32,
        /// result
        valid_for: u32,
        /// result
        issued_time: i64,
        /// result
        access: String,
    },
    DelegateCancel {
        token: String,
        key: String,
    },
    MetaPing {
        /// result
        up_servers: Vec<String>,
        /// result
        down_servers: Vec<String>,
    },
    MetaStats {
        /// result
        stats: Properties,
    },
    ChunkPing {
        /// result
        location: Option<ServerLocation>,
        /// result
        total_space: i64,
        /// result
        used_space: i64,
    },
    ChunkStats {
        /// result
        stats: Properties,
    },
    RetireChunkserver {
        location: ServerLocation,
        downtime: i64,
    },
    Fsck {
        report_abandoned_files: bool,
    },
    ToggleWorm {
        value: i32,
    },
    /// Dump of the chunk id -> chunk server mapping.
    DumpChunkToServerMap,
    /// Dump of the chunk id -> chunk info mapping; rides the same opcode as
    /// `DumpChunkToServerMap` (so assigned upstream).
    DumpChunkMap,
    ReadMetaData {
        fs_id: i64,
        start_log_seq: LogSeq,
        read_pos: i64,
        checkpoint: bool,
        allow_not_primary: bool,
        read_size: i32,
        /// result
        file_size: i64,
        /// result
        file_name: String,
        /// result
        checksum: u32,
    },
    VrHello {
        node_id: i64,
        last_log_seq: LogSeq,
        config_hash: u64,
    },
    VrStartViewChange {
        epoch: i64,
        view: i64,
        node_id: i64,
        last_log_seq: LogSeq,
        last_view_end_seq: LogSeq,
        config_hash: u64,
    },
    VrDoViewChange {
        epoch: i64,
        view: i64,
        node_id: i64,
        primary_id: i64,
        last_log_seq: LogSeq,
        last_view_end_seq: LogSeq,
    },
    VrStartView {
        epoch: i64,
        view: i64,
        primary_id: i64,
        start_seq: LogSeq,
        committed_seq: LogSeq,
    },
    VrReconfiguration {
        op_name: String,
        node_id: i64,
        args: String,
    },
    VrGetStatus {
        /// result
        state: String,
        /// result
        epoch: i64,
        /// result
        view: i64,
        /// result
        primary_id: i64,
    },
}

impl OpRequest {
    /// The opcode this payload belongs to.
    pub fn opcode(&self) -> OpCode {
        match self {
            OpRequest::None => OpCode::Unknown,
            OpRequest::Create { .. } => OpCode::Create,
            OpRequest::Mkdir { .. } => OpCode::Mkdir,
            OpRequest::Remove { .. } => OpCode::Remove,
            OpRequest::Rmdir { .. } => OpCode::Rmdir,
            OpRequest::Rename { .. } => OpCode::Rename,
            OpRequest::Link { .. } => OpCode::Link,
            OpRequest::Lookup { .. } => OpCode::Lookup,
            OpRequest::Readdir { .. } => OpCode::Readdir,
            OpRequest::ReaddirPlus { .. } => OpCode::ReaddirPlus,
            OpRequest::GetAlloc { .. } => OpCode::GetAlloc,
            OpRequest::GetLayout { .. } => OpCode::GetLayout,
            OpRequest::Allocate { .. } => OpCode::Allocate,
            OpRequest::Truncate { .. } => OpCode::Truncate,
            OpRequest::CoalesceBlocks { .. } => OpCode::CoalesceBlocks,
            OpRequest::SetMtime { .. } => OpCode::SetMtime,
            OpRequest::ChangeFileReplication { .. } => {
                OpCode::ChangeFileReplication
            }
            OpRequest::GetPathName { .. } => OpCode::GetPathName,
            OpRequest::Chmod { .. } => OpCode::Chmod,
            OpRequest::Chown { .. } => OpCode::Chown,
            OpRequest::LeaseAcquire { .. } => OpCode::LeaseAcquire,
            OpRequest::LeaseRenew { .. } => OpCode::LeaseRenew,
            OpRequest::LeaseRelinquish { .. } => OpCode::LeaseRelinquish,
            OpRequest::Close => OpCode::Close,
            OpRequest::Size { .. } => OpCode::Size,
            OpRequest::Read { .. } => OpCode::Read,
            OpRequest::WriteIdAlloc { .. } => OpCode::WriteIdAlloc,
            OpRequest::WritePrepare { .. } => OpCode::WritePrepare,
            OpRequest::WriteSync { .. } => OpCode::WriteSync,
            OpRequest::RecordAppend { .. } => OpCode::RecordAppend,
            OpRequest::ChunkSpaceReserve { .. } => OpCode::ChunkSpaceReserve,
            OpRequest::ChunkSpaceRelease { .. } => OpCode::ChunkSpaceRelease,
            OpRequest::GetChunkMetadata { .. } => OpCode::GetChunkMetadata,
            OpRequest::Authenticate { .. } => OpCode::Authenticate,
            OpRequest::Delegate { .. } => OpCode::Delegate,
            OpRequest::DelegateCancel { .. } => OpCode::DelegateCancel,
            OpRequest::MetaPing { .. } => OpCode::MetaPing,
            OpRequest::MetaStats { .. } => OpCode::MetaStats,
            OpRequest::ChunkPing { .. } => OpCode::ChunkPing,
            OpRequest::ChunkStats { .. } => OpCode::ChunkStats,
            OpRequest::RetireChunkserver { .. } => OpCode::RetireChunkserver,
            OpRequest::Fsck { .. } => OpCode::Fsck,
            OpRequest::ToggleWorm { .. } => OpCode::ToggleWorm,
            OpRequest::DumpChunkToServerMap | OpRequest::DumpChunkMap => {
                OpCode::DumpChunkToServerMap
            }
            OpRequest::ReadMetaData { .. } => OpCode::ReadMetaData,
            OpRequest::VrHello { .. } => OpCode::VrHello,
            OpRequest::VrStartViewChange { .. } => OpCode::VrStartViewChange,
            OpRequest::VrDoViewChange { .. } => OpCode::VrDoViewChange,
            OpRequest::VrStartView { .. } => OpCode::VrStartView,
            OpRequest::VrReconfiguration { .. } => OpCode::VrReconfiguration,
            OpRequest::VrGetStatus { .. } => OpCode::VrGetStatus,
        }
    }
}

/// One in-flight RPC operation: shared envelope state + tagged payload.
#[derive(Debug, Clone, Default)]
pub struct MetaOp {
    /// Monotonic client sequence number.
    pub seq: i64,

    /// Response status; negative on error.
    pub status: i32,

    /// Last transport-level error observed for this op.
    pub last_error: i32,

    /// Optional human-readable status message from the server.
    pub status_msg: String,

    /// Checksum over the content body (crc32c), zero when unused.
    pub checksum: u32,

    /// Declared body length of the pending response.
    pub content_length: usize,

    /// Content body, ownership-explicit.
    pub content: Buffer,

    /// Emit abbreviated envelope header names.
    pub short_format: bool,

    /// Preformatted default headers injected once per connection.
    pub extra_headers: Option<String>,

    /// Present on idempotent ops; carries the dedup request id.
    pub idempotent: Option<IdempotentInfo>,

    /// Present on chunk-server ops; carries the access token block.
    pub chunk_access: Option<ChunkAccessInfo>,

    /// The tagged request payload.
    pub req: OpRequest,
}

impl MetaOp {
    /// Creates a fresh op around a payload.
    pub fn new(seq: i64, req: OpRequest) -> Self {
        MetaOp {
            seq,
            req,
            ..Default::default()
        }
    }

    /// Creates an idempotent op carrying a dedup request id.
    pub fn new_idempotent(seq: i64, req_id: i64, req: OpRequest) -> Self {
        MetaOp {
            seq,
            req,
            idempotent: Some(IdempotentInfo { req_id }),
            ..Default::default()
        }
    }

    /// The null op value; constructed on demand where a placeholder op is
    /// needed.
    pub fn null() -> Self {
        MetaOp::default()
    }

    /// The opcode of the carried payload.
    pub fn opcode(&self) -> OpCode {
        self.req.opcode()
    }

    /// Emits the complete request envelope (headers only; the content body
    /// of `Content-length` bytes follows on the wire).
    pub fn emit_request(&self) -> String {
        let mut w = RequestWriter::new(self.short_format);
        w.verb(self.opcode().verb());
        w.header("Cseq", self.seq);
        if let Some(ref extra) = self.extra_headers {
            w.raw(extra);
        }
        if let Some(IdempotentInfo { req_id }) = self.idempotent {
            if req_id != REQ_ID_NONE {
                w.header("Rid", req_id);
            }
        }
        if let Some(ref ca) = self.chunk_access {
            w.header("Chunk-handle", ca.chunk_id);
            w.header("Chunk-version", ca.chunk_version);
            ca.write_req(&mut w);
        }

        self.emit_payload(&mut w);

        if !self.content.is_empty() {
            w.header("Content-length", self.content.len());
            if self.checksum != 0 {
                w.header("Checksum", self.checksum);
            }
        }
        w.finish()
    }

    // Op-specific request headers.
    fn emit_payload(&self, w: &mut RequestWriter) {
        match &self.req {
            OpRequest::None => {}

            OpRequest::Create {
                parent_fid,
                name,
                num_replicas,
                exclusive,
                ..
            } => {
                w.header("Parent-handle", parent_fid);
                w.header("Filename", name);
                w.header("Num-replicas", num_replicas);
                w.flag("Exclusive", *exclusive);
            }
            OpRequest::Mkdir {
                parent_fid, name, ..
            } => {
                w.header("Parent-handle", parent_fid);
                w.header("Directory", name);
            }
            OpRequest::Remove {
                parent_fid,
                name,
                pathname,
            } => {
                w.header("Parent-handle", parent_fid);
                w.header("Filename", name);
                w.header("Pathname", pathname);
            }
            OpRequest::Rmdir {
                parent_fid,
                name,
                pathname,
            } => {
                w.header("Parent-handle", parent_fid);
                w.header("Directory", name);
                w.header("Pathname", pathname);
            }
            OpRequest::Rename {
                parent_fid,
                old_name,
                new_path,
                old_path,
                overwrite,
            } => {
                w.header("Parent-handle", parent_fid);
                w.header("Old-name", old_name);
                w.header("New-path", new_path);
                w.header("Old-path", old_path);
                w.header("Overwrite", i32::from(*overwrite));
            }
            OpRequest::Link {
                parent_fid,
                name,
                target,
                ..
            } => {
                w.header("Parent-handle", parent_fid);
                w.header("Filename", name);
                w.header("Target", target);
            }
            OpRequest::Lookup {
                parent_fid, name, ..
            } => {
                w.header("Parent-handle", parent_fid);
                w.header("Filename", name);
            }
            OpRequest::Readdir { fid, .. } => {
                w.header("Directory-handle", fid);
            }
            OpRequest::ReaddirPlus {
                fid,
                get_last_chunk_info,
                ..
            } => {
                w.header("Directory-handle", fid);
                w.flag("GetLastChunkInfoOnly", *get_last_chunk_info);
            }
            OpRequest::GetAlloc { fid, offset, .. } => {
                w.header("File-handle", fid);
                w.header("Chunk-offset", offset);
            }
            OpRequest::GetLayout { fid, .. } => {
                w.header("File-handle", fid);
            }
            OpRequest::Allocate {
                fid,
                offset,
                pathname,
                append,
                invalidate_all,
                ..
            } => {
                w.header("File-handle", fid);
                w.header("Chunk-offset", offset);
                w.header("Pathname", pathname);
                w.flag("Chunk-append", *append);
                w.flag("Invalidate-all", *invalidate_all);
            }
            OpRequest::Truncate {
                fid,
                offset,
                pathname,
            } => {
                w.header("File-handle", fid);
                w.header("Offset", offset);
                w.header("Pathname", pathname);
            }
            OpRequest::CoalesceBlocks {
                src_path, dst_path, ..
            } => {
                w.header("Src-path", src_path);
                w.header("Dest-path", dst_path);
            }
            OpRequest::SetMtime {
                fid,
                mtime_sec,
                mtime_usec,
            } => {
                w.header("File-handle", fid);
                w.header("Mtime-sec", mtime_sec);
                w.header("Mtime-usec", mtime_usec);
            }
            OpRequest::ChangeFileReplication { fid, num_replicas } => {
                w.header("File-handle", fid);
                w.header("Num-replicas", num_replicas);
            }
            OpRequest::GetPathName { fid, chunk_id, .. } => {
                if *fid >= 0 {
                    w.header("File-handle", fid);
                }
                if *chunk_id >= 0 {
                    w.header("Chunk-handle", chunk_id);
                }
            }
            OpRequest::Chmod { fid, mode } => {
                w.header("File-handle", fid);
                w.header("Mode", mode);
            }
            OpRequest::Chown { fid, user, group } => {
                w.header("File-handle", fid);
                w.header("Owner", user);
                w.header("Group", group);
            }
            OpRequest::LeaseAcquire {
                pathname,
                chunk_id,
                flush,
                ..
            } => {
                w.header("Pathname", pathname);
                w.header("Chunk-handle", chunk_id);
                w.flag("Flush-write-lease", *flush);
            }
            OpRequest::LeaseRenew {
                pathname,
                chunk_id,
                lease_id,
            } => {
                w.header("Pathname", pathname);
                w.header("Chunk-handle", chunk_id);
                w.header("Lease-id", lease_id);
            }
            OpRequest::LeaseRelinquish { chunk_id, lease_id } => {
                w.header("Chunk-handle", chunk_id);
                w.header("Lease-id", lease_id);
            }
            OpRequest::Close => {}
            OpRequest::Size { .. } => {}
            OpRequest::Read {
                offset, num_bytes, ..
            } => {
                w.header("Offset", offset);
                w.header("Num-bytes", num_bytes);
            }
            OpRequest::WriteIdAlloc {
                offset,
                num_bytes,
                for_record_append,
                ..
            } => {
                w.header("Offset", offset);
                w.header("Num-bytes", num_bytes);
                w.header("For-record-append", i32::from(*for_record_append));
            }
            OpRequest::WritePrepare {
                offset,
                num_bytes,
                write_ids,
                body_checksum,
            } => {
                w.header("Offset", offset);
                w.header("Num-bytes", num_bytes);
                w.header("Checksum", body_checksum);
                w.header("Write-info", write_ids);
            }
            OpRequest::WriteSync {
                offset,
                num_bytes,
                write_ids,
            } => {
                w.header("Offset", offset);
                w.header("Num-bytes", num_bytes);
                w.header("Write-info", write_ids);
            }
            OpRequest::RecordAppend {
                num_bytes,
                write_ids,
                ..
            } => {
                w.header("Num-bytes", num_bytes);
                w.header("Write-info", write_ids);
            }
            OpRequest::ChunkSpaceReserve {
                num_bytes,
                write_ids,
            }
            | OpRequest::ChunkSpaceRelease {
                num_bytes,
                write_ids,
            } => {
                w.header("Num-bytes", num_bytes);
                w.header("Write-info", write_ids);
            }
            OpRequest::GetChunkMetadata { read_verify } => {
                w.header("Read-verify", i32::from(*read_verify));
            }
            OpRequest::Authenticate {
                requested_auth_type,
                ..
            } => {
                w.header("Auth-type", requested_auth_type);
            }
            OpRequest::Delegate {
                allow_delegation,
                requested_valid_for,
                ..
            } => {
                w.flag("Allow-delegation", *allow_delegation);
                w.header("Valid-for-time", requested_valid_for);
            }
            OpRequest::DelegateCancel { token, key } => {
                w.header("Token", token);
                w.header("Key", key);
            }
            OpRequest::MetaPing { .. } => {}
            OpRequest::MetaStats { .. } => {}
            OpRequest::ChunkPing { .. } => {}
            OpRequest::ChunkStats { .. } => {}
            OpRequest::RetireChunkserver { location, downtime } => {
                w.header("Chunk-server", location);
                w.header("Downtime", downtime);
            }
            OpRequest::Fsck {
                report_abandoned_files,
            } => {
                w.header(
                    "Report-Abandoned-Files",
                    i32::from(*report_abandoned_files),
                );
            }
            OpRequest::ToggleWorm { value } => {
                w.header("Toggle-WORM", value);
            }
            OpRequest::DumpChunkToServerMap | OpRequest::DumpChunkMap => {}
            OpRequest::ReadMetaData {
                fs_id,
                start_log_seq,
                read_pos,
                checkpoint,
                allow_not_primary,
                read_size,
                ..
            } => {
                w.header("FsId", fs_id);
                w.header("Start-log", start_log_seq);
                w.header("Read-pos", read_pos);
                w.header("Checkpoint", i32::from(*checkpoint));
                w.flag("Not-primary-ok", *allow_not_primary);
                w.header("Read-size", read_size);
            }
            OpRequest::VrHello {
                node_id,
                last_log_seq,
                config_hash,
            } => {
                w.header("Node-id", node_id);
                w.header("Last-log-seq", last_log_seq);
                w.header("Config-hash", config_hash);
            }
            OpRequest::VrStartViewChange {
                epoch,
                view,
                node_id,
                last_log_seq,
                last_view_end_seq,
                config_hash,
            } => {
                w.header("Epoch", epoch);
                w.header("View", view);
                w.header("Node-id", node_id);
                w.header("Last-log-seq", last_log_seq);
                w.header("View-end-seq", last_view_end_seq);
                w.header("Config-hash", config_hash);
            }
            OpRequest::VrDoViewChange {
                epoch,
                view,
                node_id,
                primary_id,
                last_log_seq,
                last_view_end_seq,
            } => {
                w.header("Epoch", epoch);
                w.header("View", view);
                w.header("Node-id", node_id);
                w.header("Primary-node-id", primary_id);
                w.header("Last-log-seq", last_log_seq);
                w.header("View-end-seq", last_view_end_seq);
            }
            OpRequest::VrStartView {
                epoch,
                view,
                primary_id,
                start_seq,
                committed_seq,
            } => {
                w.header("Epoch", epoch);
                w.header("View", view);
                w.header("Primary-node-id", primary_id);
                w.header("Start-seq", start_seq);
                w.header("Committed-seq", committed_seq);
            }
            OpRequest::VrReconfiguration {
                op_name,
                node_id,
                args,
            } => {
                w.header("Op-name", op_name);
                w.header("Node-id", node_id);
                if !args.is_empty() {
                    w.header("Args", args);
                }
            }
            OpRequest::VrGetStatus { .. } => {}
        }
    }

    /// Parses a raw response header block: runs the common envelope parse,
    /// then the op-specific refinement.
    pub fn parse_response_text(&mut self, text: &str) -> Result<(), MetaError> {
        let props = parse_response_props(text)?;
        self.parse_response(&props)
    }

    /// Refines a parsed response header bag into this op's typed results.
    /// The common envelope keys (`Cseq`, `Status`, `Status-message`,
    /// `Content-length`) are handled here; op-specific keys in the match.
    pub fn parse_response(
        &mut self,
        props: &Properties,
    ) -> Result<(), MetaError> {
        let cseq = props.get_i64("Cseq", -1);
        if cseq != self.seq {
            return Err(MetaError(format!(
                "response Cseq {} does not match op seq {}",
                cseq, self.seq
            )));
        }
        self.status = props.get_i32("Status", -1);
        self.status_msg = props.get_str("Status-message");
        self.content_length = props.get_i64("Content-length", 0) as usize;
        if self.status < 0 {
            self.last_error = self.status;
        }

        match &mut self.req {
            OpRequest::Create { file_id, .. }
            | OpRequest::Mkdir { file_id, .. }
            | OpRequest::Link { file_id, .. } => {
                *file_id = props.get_i64("File-handle", -1);
            }
            OpRequest::Lookup {
                file_id,
                is_directory,
                ..
            } => {
                *file_id = props.get_i64("File-handle", -1);
                *is_directory = props.get_bool("Type-dir", false);
            }
            OpRequest::Readdir {
                num_entries,
                has_more,
                ..
            }
            | OpRequest::ReaddirPlus {
                num_entries,
                has_more,
                ..
            } => {
                *num_entries = props.get_i64("Num-Entries", 0);
                *has_more = props.get_bool("Has-more-entries", false);
            }
            OpRequest::GetAlloc {
                chunk_id,
                chunk_version,
                servers,
                ..
            } => {
                *chunk_id = props.get_i64("Chunk-handle", -1);
                *chunk_version = props.get_i64("Chunk-version", -1);
                *servers = parse_locations(props.get_str("Replicas"));
            }
            OpRequest::GetLayout { num_chunks, .. } => {
                *num_chunks = props.get_i64("Num-chunks", 0);
            }
            OpRequest::Allocate {
                chunk_id,
                chunk_version,
                master,
                servers,
                ..
            } => {
                *chunk_id = props.get_i64("Chunk-handle", -1);
                *chunk_version = props.get_i64("Chunk-version", -1);
                *master = props
                    .get("Master")
                    .and_then(|v| v.parse::<ServerLocation>().ok());
                *servers = parse_locations(props.get_str("Replicas"));
            }
            OpRequest::CoalesceBlocks {
                dst_start_offset, ..
            } => {
                *dst_start_offset = props.get_i64("Dst-start-offset", -1);
            }
            OpRequest::GetPathName { pathname, .. } => {
                *pathname = props.get_str("Path-name");
            }
            OpRequest::LeaseAcquire { lease_id, .. } => {
                *lease_id = props.get_i64("Lease-id", -1);
            }
            OpRequest::Size { size } => {
                *size = props.get_i64("Size", -1);
            }
            OpRequest::Read {
                disk_io_time_usec, ..
            } => {
                *disk_io_time_usec = props.get_i64("DiskIOtime", 0);
            }
            OpRequest::WriteIdAlloc { write_id, .. } => {
                *write_id = props.get_str("Write-id");
            }
            OpRequest::RecordAppend { record_offset, .. } => {
                *record_offset = props.get_i64("File-offset", -1);
            }
            OpRequest::Authenticate {
                chosen_auth_type,
                use_ssl,
                ..
            } => {
                *chosen_auth_type = props.get_i32("Auth-type", 0);
                *use_ssl = props.get_bool("Use-ssl", false);
            }
            OpRequest::Delegate {
                valid_for,
                issued_time,
                access,
                ..
            } => {
                *valid_for = props.get_i64("Valid-for-time", 0) as u32;
                *issued_time = props.get_i64("Issued-time", 0);
                *access = props.get_str("Access");
            }
            OpRequest::MetaPing {
                up_servers,
                down_servers,
            } => {
                *up_servers = parse_server_list(props.get_str("Servers"));
                *down_servers =
                    parse_server_list(props.get_str("Down Servers"));
            }
            OpRequest::MetaStats { stats }
            | OpRequest::ChunkStats { stats } => {
                *stats = props.clone();
            }
            OpRequest::ChunkPing {
                location,
                total_space,
                used_space,
            } => {
                *location = props
                    .get("Meta-server-location")
                    .and_then(|v| v.parse::<ServerLocation>().ok());
                *total_space = props.get_i64("Total-space", -1);
                *used_space = props.get_i64("Used-space", -1);
            }
            OpRequest::ReadMetaData {
                file_size,
                file_name,
                checksum,
                ..
            } => {
                *file_size = props.get_i64("Size", -1);
                *file_name = props.get_str("Filename");
                *checksum = props.get_i64("Crc32", 0) as u32;
            }
            OpRequest::VrGetStatus {
                state,
                epoch,
                view,
                primary_id,
            } => {
                *state = props.get_str("State");
                *epoch = props.get_i64("Epoch", -1);
                *view = props.get_i64("View", -1);
                *primary_id = props.get_i64("Primary-node-id", -1);
            }
            // remaining ops carry no op-specific result headers
            _ => {}
        }

        if let Some(ref mut ca) = self.chunk_access {
            if let Some(access) = props.get("C-access") {
                ca.access = access.to_string();
            }
        }
        Ok(())
    }
}

// Parses a space-separated `host port host port ...` replica list.
fn parse_locations(text: String) -> Vec<ServerLocation> {
    let mut out = Vec::new();
    let mut tokens = text.split_ascii_whitespace();
    while let (Some(host), Some(port)) = (tokens.next(), tokens.next()) {
        if let Ok(port) = port.parse() {
            out.push(ServerLocation::new(host, port));
        }
    }
    out
}

fn parse_server_list(text: String) -> Vec<String> {
    text.split('\t')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// Log-facing description of an op; mirrors what the request says without
// reproducing the whole envelope.
impl fmt::Display for MetaOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.req {
            OpRequest::None => write!(f, "NULL op"),
            OpRequest::Create {
                parent_fid, name, ..
            } => {
                write!(f, "create: {} parent: {}", name, parent_fid)?;
                if let Some(IdempotentInfo { req_id }) = self.idempotent {
                    write!(f, " reqId: {}", req_id)?;
                }
                Ok(())
            }
            OpRequest::Mkdir {
                parent_fid, name, ..
            } => write!(f, "mkdir: {} parent: {}", name, parent_fid),
            OpRequest::Remove {
                parent_fid, name, ..
            } => write!(f, "remove: {} parent: {}", name, parent_fid),
            OpRequest::Rmdir {
                parent_fid, name, ..
            } => write!(f, "rmdir: {} parent: {}", name, parent_fid),
            OpRequest::Rename {
                old_path, new_path, ..
            } => write!(f, "rename: {} -> {}", old_path, new_path),
            OpRequest::Link { name, target, .. } => {
                write!(f, "link: {} -> {}", name, target)
            }
            OpRequest::Lookup {
                parent_fid, name, ..
            } => write!(f, "lookup: {} parent: {}", name, parent_fid),
            OpRequest::Readdir { fid, .. } => write!(f, "readdir: {}", fid),
            OpRequest::ReaddirPlus { fid, .. } => {
                write!(f, "readdirplus: {}", fid)
            }
            OpRequest::GetAlloc { fid, offset, .. } => {
                write!(f, "getalloc: fid: {} offset: {}", fid, offset)
            }
            OpRequest::GetLayout { fid, .. } => {
                write!(f, "getlayout: fid: {}", fid)
            }
            OpRequest::Allocate { fid, offset, .. } => {
                write!(f, "allocate: fid: {} offset: {}", fid, offset)
            }
            OpRequest::Truncate { fid, offset, .. } => {
                write!(f, "truncate: fid: {} offset: {}", fid, offset)
            }
            OpRequest::CoalesceBlocks {
                src_path, dst_path, ..
            } => write!(f, "coalesce blocks: {} -> {}", src_path, dst_path),
            OpRequest::SetMtime { fid, .. } => {
                write!(f, "set mtime: fid: {}", fid)
            }
            OpRequest::ChangeFileReplication {
                fid, num_replicas, ..
            } => write!(
                f,
                "change file replication: fid: {} replicas: {}",
                fid, num_replicas
            ),
            OpRequest::GetPathName { fid, chunk_id, .. } => write!(
                f,
                "getpathname: fid: {} chunk: {}",
                fid, chunk_id
            ),
            OpRequest::Chmod { fid, mode } => {
                write!(f, "chmod: fid: {} mode: {:o}", fid, mode)
            }
            OpRequest::Chown {
                fid, user, group, ..
            } => write!(f, "chown: fid: {} uid: {} gid: {}", fid, user, group),
            OpRequest::LeaseAcquire {
                pathname, chunk_id, ..
            } => write!(
                f,
                "lease acquire: {} chunk: {}",
                pathname, chunk_id
            ),
            OpRequest::LeaseRenew {
                chunk_id, lease_id, ..
            } => write!(
                f,
                "lease renew: chunk: {} lease: {}",
                chunk_id, lease_id
            ),
            OpRequest::LeaseRelinquish {
                chunk_id, lease_id, ..
            } => write!(
                f,
                "lease relinquish: chunk: {} lease: {}",
                chunk_id, lease_id
            ),
            OpRequest::Close => describe_chunk_op(f, "close", self),
            OpRequest::Size { .. } => describe_chunk_op(f, "size", self),
            OpRequest::Read {
                offset, num_bytes, ..
            } => {
                describe_chunk_op(f, "read", self)?;
                write!(f, " offset: {} bytes: {}", offset, num_bytes)
            }
            OpRequest::WriteIdAlloc { num_bytes, .. } => {
                describe_chunk_op(f, "write id alloc", self)?;
                write!(f, " bytes: {}", num_bytes)
            }
            OpRequest::WritePrepare {
                offset, num_bytes, ..
            } => {
                describe_chunk_op(f, "write prepare", self)?;
                write!(f, " offset: {} bytes: {}", offset, num_bytes)
            }
            OpRequest::WriteSync { num_bytes, .. } => {
                describe_chunk_op(f, "write sync", self)?;
                write!(f, " bytes: {}", num_bytes)
            }
            OpRequest::RecordAppend { num_bytes, .. } => {
                describe_chunk_op(f, "record append", self)?;
                write!(f, " bytes: {}", num_bytes)
            }
            OpRequest::ChunkSpaceReserve { num_bytes, .. } => {
                describe_chunk_op(f, "space reserve", self)?;
                write!(f, " bytes: {}", num_bytes)
            }
            OpRequest::ChunkSpaceRelease { num_bytes, .. } => {
                describe_chunk_op(f, "space release", self)?;
                write!(f, " bytes: {}", num_bytes)
            }
            OpRequest::GetChunkMetadata { .. } => {
                describe_chunk_op(f, "get chunk metadata", self)
            }
            OpRequest::Authenticate {
                requested_auth_type,
                chosen_auth_type,
                ..
            } => write!(
                f,
                "authenticate: requested: {} chosen: {} status: {}",
                requested_auth_type, chosen_auth_type, self.status
            ),
            OpRequest::Delegate { valid_for, .. } => {
                write!(f, "delegate: valid for: {}", valid_for)
            }
            OpRequest::DelegateCancel { .. } => write!(f, "delegate cancel"),
            OpRequest::MetaPing { .. } => write!(f, "meta ping"),
            OpRequest::MetaStats { .. } => write!(f, "meta stats"),
            OpRequest::ChunkPing { .. } => write!(f, "chunk server ping"),
            OpRequest::ChunkStats { .. } => write!(f, "chunk stats"),
            OpRequest::RetireChunkserver {
                location, downtime, ..
            } => write!(
                f,
                "retire chunk server: {} down time: {}",
                location, downtime
            ),
            OpRequest::Fsck { .. } => write!(f, "fsck"),
            OpRequest::ToggleWorm { value } => {
                write!(f, "toggle worm: {}", value)
            }
            OpRequest::DumpChunkToServerMap => {
                write!(f, "dump chunk to server map")
            }
            OpRequest::DumpChunkMap => write!(f, "dump chunk map"),
            OpRequest::ReadMetaData {
                fs_id,
                start_log_seq,
                checkpoint,
                ..
            } => write!(
                f,
                "read meta data: fs: {} log start: {} checkpoint: {}",
                fs_id, start_log_seq, checkpoint
            ),
            OpRequest::VrHello {
                node_id,
                last_log_seq,
                ..
            } => write!(
                f,
                "vr hello: node: {} last log: {}",
                node_id, last_log_seq
            ),
            OpRequest::VrStartViewChange {
                epoch,
                view,
                node_id,
                ..
            } => write!(
                f,
                "vr start view change: epoch: {} view: {} node: {}",
                epoch, view, node_id
            ),
            OpRequest::VrDoViewChange {
                epoch,
                view,
                primary_id,
                ..
            } => write!(
                f,
                "vr do view change: epoch: {} view: {} primary: {}",
                epoch, view, primary_id
            ),
            OpRequest::VrStartView {
                epoch,
                view,
                primary_id,
                ..
            } => write!(
                f,
                "vr start view: epoch: {} view: {} primary: {}",
                epoch, view, primary_id
            ),
            OpRequest::VrReconfiguration {
                op_name, node_id, ..
            } => write!(
                f,
                "vr reconfiguration: {} node: {}",
                op_name, node_id
            ),
            OpRequest::VrGetStatus { .. } => write!(f, "vr get status"),
        }
    }
}

fn describe_chunk_op(
    f: &mut fmt::Formatter,
    what: &str,
    op: &MetaOp,
) -> fmt::Result {
    match op.chunk_access {
        Some(ref ca) => write!(
            f,
            "{}: chunkId: {} version: {}",
            what, ca.chunk_id, ca.chunk_version
        ),
        None => write!(f, "{}:", what),
    }
}

#[cfg(test)]
mod ops_tests {
    use super::*;
    use crate::rpc::envelope::parse_request;

    fn sample_ops() -> Vec<MetaOp> {
        vec![
            MetaOp::new_idempotent(
                1,
                900,
                OpRequest::Create {
                    parent_fid: 2,
                    name: "data.bin".into(),
                    num_replicas: 3,
                    exclusive: true,
                    file_id: -1,
                },
            ),
            MetaOp::new(
                2,
                OpRequest::Rename {
                    parent_fid: 2,
                    old_name: "a".into(),
                    new_path: "/d/b".into(),
                    old_path: "/d/a".into(),
                    overwrite: false,
                },
            ),
            MetaOp::new(
                3,
                OpRequest::Allocate {
                    fid: 11,
                    offset: 1 << 26,
                    pathname: "/d/b".into(),
                    append: true,
                    invalidate_all: false,
                    chunk_id: -1,
                    chunk_version: -1,
                    master: None,
                    servers: vec![],
                },
            ),
            MetaOp::new(
                4,
                OpRequest::VrStartViewChange {
                    epoch: 0,
                    view: 1,
                    node_id: 2,
                    last_log_seq: LogSeq::new(0, 0, 50),
                    last_view_end_seq: LogSeq::new(0, 0, 50),
                    config_hash: 0xfeed,
                },
            ),
            {
                let mut op = MetaOp::new(5, OpRequest::Size { size: -1 });
                op.chunk_access = Some(ChunkAccessInfo::new(77, 3));
                op
            },
        ]
    }

    #[test]
    fn emit_short_long_parity() -> Result<(), MetaError> {
        // parity modulo header name normalization: both formats must parse
        // into identical property bags
        for mut op in sample_ops() {
            op.short_format = false;
            let (verb_l, props_l) = parse_request(&op.emit_request())?;
            op.short_format = true;
            let (verb_s, props_s) = parse_request(&op.emit_request())?;
            assert_eq!(verb_l, verb_s);
            assert_eq!(props_l, props_s, "op {} formats disagree", op);
        }
        Ok(())
    }

    #[test]
    fn emit_chunk_access_block() {
        let mut op = MetaOp::new(9, OpRequest::Close);
        let mut ca = ChunkAccessInfo::new(123, 7);
        ca.access = "tok".into();
        ca.create_chunk_server_access = true;
        ca.subject_id = Some(42);
        op.chunk_access = Some(ca);

        op.short_format = false;
        let long = op.emit_request();
        assert!(long.contains("Subject-id: 42\r\n"));
        assert!(long.contains("C-access: tok\r\n"));
        assert!(long.contains("CS-access-req: 1\r\n"));

        op.short_format = true;
        let short = op.emit_request();
        assert!(short.contains("I:42\r\n"));
        assert!(short.contains("C:tok\r\n"));
        assert!(short.contains("SR:1\r\n"));
    }

    #[test]
    fn parse_create_response() -> Result<(), MetaError> {
        let mut op = MetaOp::new_idempotent(
            12,
            55,
            OpRequest::Create {
                parent_fid: 2,
                name: "f".into(),
                num_replicas: 3,
                exclusive: false,
                file_id: -1,
            },
        );
        op.parse_response_text(
            "OK 12 0\r\nContent-length: 0\r\nFile-handle: 1234\r\n\r\n",
        )?;
        assert_eq!(op.status, 0);
        assert!(matches!(
            op.req,
            OpRequest::Create { file_id: 1234, .. }
        ));
        Ok(())
    }

    #[test]
    fn parse_error_response() -> Result<(), MetaError> {
        let mut op = MetaOp::new(
            13,
            OpRequest::Lookup {
                parent_fid: 2,
                name: "missing".into(),
                file_id: -1,
                is_directory: false,
            },
        );
        op.parse_response_text(
            "OK 13 -2\r\nl: 0\r\nm: no such entry\r\n\r\n",
        )?;
        assert_eq!(op.status, -2);
        assert_eq!(op.last_error, -2);
        assert_eq!(op.status_msg, "no such entry");
        Ok(())
    }

    #[test]
    fn parse_cseq_mismatch() {
        let mut op = MetaOp::new(14, OpRequest::MetaPing {
            up_servers: vec![],
            down_servers: vec![],
        });
        assert!(op
            .parse_response_text("OK 15 0\r\nl: 0\r\n\r\n")
            .is_err());
    }

    #[test]
    fn parse_getalloc_replicas() -> Result<(), MetaError> {
        let mut op = MetaOp::new(
            21,
            OpRequest::GetAlloc {
                fid: 5,
                offset: 0,
                chunk_id: -1,
                chunk_version: -1,
                servers: vec![],
            },
        );
        op.parse_response_text(
            "OK 21 0\r\nl: 0\r\nChunk-handle: 88\r\nChunk-version: 2\r\n\
             Replicas: h1 20000 h2 20001\r\n\r\n",
        )?;
        if let OpRequest::GetAlloc {
            chunk_id,
            chunk_version,
            servers,
            ..
        } = &op.req
        {
            assert_eq!(*chunk_id, 88);
            assert_eq!(*chunk_version, 2);
            assert_eq!(
                servers,
                &vec![
                    ServerLocation::new("h1", 20000),
                    ServerLocation::new("h2", 20001),
                ]
            );
        } else {
            unreachable!();
        }
        Ok(())
    }

    #[test]
    fn buffer_ownership_promote() {
        let shared = Bytes::from_static(b"abc");
        let mut buf = Buffer::Shared(shared);
        assert_eq!(buf.as_slice(), b"abc");

        // writing promotes the shared view into an owned copy
        let owned = buf.ensure_capacity(8);
        owned.extend_from_slice(b"def");
        assert!(matches!(buf, Buffer::Owned(_)));
        assert_eq!(buf.as_slice(), b"abcdef");

        assert!(matches!(buf.take(), Buffer::Owned(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn null_op_on_demand() {
        let op = MetaOp::null();
        assert_eq!(op.opcode(), OpCode::Unknown);
        assert_eq!(format!("{}", op), "NULL op");
    }

    #[test]
    fn dump_verbs_share_opcode() {
        // both dump requests ride the same opcode (upstream collision kept)
        let a = MetaOp::new(1, OpRequest::DumpChunkToServerMap);
        let b = MetaOp::new(2, OpRequest::DumpChunkMap);
        assert_eq!(a.opcode(), b.opcode());
    }
}
