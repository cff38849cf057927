//! Client side networking: packages, connections and futures

pub mod connection;
pub mod future;
pub mod loopback;
pub mod package;

pub use connection::{ClientConnection, PendingCalls, ResponseListener};
pub use loopback::LoopbackConnection;
pub use package::{ErrorCode, Request, RequestKind, RequestPackage, Response, ResponseFrame, ResponsePackage, SequenceId};
