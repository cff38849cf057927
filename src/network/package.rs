//! Request and response packages
//!
//! Every request carries a 16-bit sequence id chosen by the client; the
//! server echoes it in the response so the client can complete the right
//! future. Packages are encoded with bincode. A frame holds either a single
//! package or a snappy-compressed batch of responses.

use crate::config::TupleStoreConfiguration;
use crate::types::{Hyperrectangle, Tuple, TupleStoreName};
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type SequenceId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    CreateTable,
    DeleteTable,
    InsertTuple,
    DeleteTuple,
    QueryKey,
    QueryBoundingBox,
    NextPage,
    CancelQuery,
    LockTuple,
    UnlockTuple,
    Keepalive,
}

impl RequestKind {
    pub const ALL: [RequestKind; 11] = [
        RequestKind::CreateTable,
        RequestKind::DeleteTable,
        RequestKind::InsertTuple,
        RequestKind::DeleteTuple,
        RequestKind::QueryKey,
        RequestKind::QueryBoundingBox,
        RequestKind::NextPage,
        RequestKind::CancelQuery,
        RequestKind::LockTuple,
        RequestKind::UnlockTuple,
        RequestKind::Keepalive,
    ];

    /// Queries run on the connection's query pool
    pub fn is_query(self) -> bool {
        matches!(
            self,
            RequestKind::QueryKey | RequestKind::QueryBoundingBox | RequestKind::NextPage
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    CreateTable {
        table: TupleStoreName,
        configuration: TupleStoreConfiguration,
    },
    DeleteTable {
        table: TupleStoreName,
    },
    /// `table` names the region store the tuple goes to
    InsertTuple {
        table: TupleStoreName,
        tuple: Tuple,
    },
    DeleteTuple {
        table: TupleStoreName,
        key: String,
        version: i64,
    },
    QueryKey {
        table: TupleStoreName,
        key: String,
    },
    QueryBoundingBox {
        table: TupleStoreName,
        bbox: Hyperrectangle,
        paging: bool,
    },
    /// Next page of the query started by request `query`
    NextPage {
        query: SequenceId,
    },
    CancelQuery {
        query: SequenceId,
    },
    LockTuple {
        table: TupleStoreName,
        key: String,
        version: i64,
    },
    UnlockTuple {
        table: TupleStoreName,
        key: String,
    },
    Keepalive,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::CreateTable { .. } => RequestKind::CreateTable,
            Request::DeleteTable { .. } => RequestKind::DeleteTable,
            Request::InsertTuple { .. } => RequestKind::InsertTuple,
            Request::DeleteTuple { .. } => RequestKind::DeleteTuple,
            Request::QueryKey { .. } => RequestKind::QueryKey,
            Request::QueryBoundingBox { .. } => RequestKind::QueryBoundingBox,
            Request::NextPage { .. } => RequestKind::NextPage,
            Request::CancelQuery { .. } => RequestKind::CancelQuery,
            Request::LockTuple { .. } => RequestKind::LockTuple,
            Request::UnlockTuple { .. } => RequestKind::UnlockTuple,
            Request::Keepalive => RequestKind::Keepalive,
        }
    }
}

/// Machine readable failure reason of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Generic,
    TableNotFound,
    TableExists,
    ReadOnly,
    LockFailed,
    OutdatedVersion,
    TooManyQueries,
    UnknownRequest,
    UnknownQuery,
    InvalidRequest,
}

impl ErrorCode {
    /// Conflicts a client resolves by retrying with fresh data
    pub fn is_conflict(self) -> bool {
        matches!(self, ErrorCode::LockFailed | ErrorCode::OutdatedVersion)
    }
}

impl From<&StorageError> for ErrorCode {
    fn from(err: &StorageError) -> Self {
        match err {
            StorageError::TableNotFound(_) => ErrorCode::TableNotFound,
            StorageError::TableExists(_) => ErrorCode::TableExists,
            StorageError::ReadOnly(_) => ErrorCode::ReadOnly,
            StorageError::Lock(_) => ErrorCode::LockFailed,
            StorageError::Outdated(_) => ErrorCode::OutdatedVersion,
            StorageError::ResourceExhausted(_) => ErrorCode::TooManyQueries,
            StorageError::InvalidArgument(_) => ErrorCode::InvalidRequest,
            _ => ErrorCode::Generic,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Success,
    /// One page of a query result
    Tuples { tuples: Vec<Tuple>, complete: bool },
    Error { code: ErrorCode, message: String },
}

impl Response {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }

    pub fn from_error(err: &StorageError) -> Self {
        Response::error(ErrorCode::from(err), err.to_string())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPackage {
    pub sequence: SequenceId,
    /// Ask the server to batch the response into a compressed frame
    pub compress_response: bool,
    pub body: Request,
}

impl RequestPackage {
    pub fn new(sequence: SequenceId, body: Request) -> Self {
        Self {
            sequence,
            compress_response: false,
            body,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePackage {
    pub sequence: SequenceId,
    pub body: Response,
}

impl ResponsePackage {
    pub fn new(sequence: SequenceId, body: Response) -> Self {
        Self { sequence, body }
    }
}

/// Unit written to a connection by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseFrame {
    Single(ResponsePackage),
    /// Snappy-compressed bincode `Vec<ResponsePackage>`
    Compressed(Vec<u8>),
}

impl ResponseFrame {
    pub fn compress(packages: &[ResponsePackage]) -> Result<Self> {
        let raw = bincode::serialize(packages)?;
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&raw)
            .map_err(|e| StorageError::Serialization(format!("snappy: {}", e)))?;
        Ok(ResponseFrame::Compressed(compressed))
    }

    /// The packages carried by this frame
    pub fn into_packages(self) -> Result<Vec<ResponsePackage>> {
        match self {
            ResponseFrame::Single(package) => Ok(vec![package]),
            ResponseFrame::Compressed(bytes) => {
                let raw = snap::raw::Decoder::new()
                    .decompress_vec(&bytes)
                    .map_err(|e| StorageError::Corruption(format!("snappy: {}", e)))?;
                Ok(bincode::deserialize(&raw)?)
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
