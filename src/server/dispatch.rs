//! Request dispatch
//!
//! The table maps every [`RequestKind`] to a plain function. It is built
//! once when the server context is created and never changes afterwards.
//! A kind without handler is answered with `UnknownRequest`.

use super::handler::ClientConnectionHandler;
use super::query::PagedQuery;
use crate::network::package::{ErrorCode, Request, RequestKind, SequenceId};
use crate::network::Response;
use crate::types::Tuple;
use crate::{Result, StorageError};
use std::collections::HashMap;

pub type RequestHandler = fn(&ClientConnectionHandler, SequenceId, Request) -> Result<Response>;

pub struct DispatchTable {
    handlers: HashMap<RequestKind, RequestHandler>,
}

impl DispatchTable {
    /// Table with a handler for every request kind
    pub fn standard() -> Self {
        Self::builder()
            .register(RequestKind::CreateTable, handle_create_table)
            .register(RequestKind::DeleteTable, handle_delete_table)
            .register(RequestKind::InsertTuple, handle_insert_tuple)
            .register(RequestKind::DeleteTuple, handle_delete_tuple)
            .register(RequestKind::QueryKey, handle_query_key)
            .register(RequestKind::QueryBoundingBox, handle_query_bbox)
            .register(RequestKind::NextPage, handle_next_page)
            .register(RequestKind::CancelQuery, handle_cancel_query)
            .register(RequestKind::LockTuple, handle_lock_tuple)
            .register(RequestKind::UnlockTuple, handle_unlock_tuple)
            .register(RequestKind::Keepalive, handle_keepalive)
            .build()
    }

    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder {
            handlers: HashMap::new(),
        }
    }

    pub fn handles(&self, kind: RequestKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn dispatch(&self, connection: &ClientConnectionHandler, sequence: SequenceId, request: Request) -> Response {
        let kind = request.kind();
        let Some(handler) = self.handlers.get(&kind) else {
            tracing::warn!(?kind, sequence, "no handler for request");
            return Response::error(ErrorCode::UnknownRequest, format!("unsupported request {:?}", kind));
        };

        match handler(connection, sequence, request) {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(?kind, sequence, error = %e, "request failed");
                Response::from_error(&e)
            }
        }
    }
}

pub struct DispatchTableBuilder {
    handlers: HashMap<RequestKind, RequestHandler>,
}

impl DispatchTableBuilder {
    pub fn register(mut self, kind: RequestKind, handler: RequestHandler) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn build(self) -> DispatchTable {
        DispatchTable {
            handlers: self.handlers,
        }
    }
}

fn invalid(expected: RequestKind) -> StorageError {
    StorageError::InvalidArgument(format!("request is not a {:?}", expected))
}

fn handle_create_table(connection: &ClientConnectionHandler, _: SequenceId, request: Request) -> Result<Response> {
    let Request::CreateTable { table, configuration } = request else {
        return Err(invalid(RequestKind::CreateTable));
    };
    connection.context().create_table(&table, configuration)?;
    Ok(Response::Success)
}

fn handle_delete_table(connection: &ClientConnectionHandler, _: SequenceId, request: Request) -> Result<Response> {
    let Request::DeleteTable { table } = request else {
        return Err(invalid(RequestKind::DeleteTable));
    };
    connection.context().delete_table(&table)?;
    Ok(Response::Success)
}

fn handle_insert_tuple(connection: &ClientConnectionHandler, _: SequenceId, request: Request) -> Result<Response> {
    let Request::InsertTuple { table, tuple } = request else {
        return Err(invalid(RequestKind::InsertTuple));
    };
    tuple.bounding_box().validate()?;
    connection.context().writable_store(&table)?.put(tuple)?;
    Ok(Response::Success)
}

fn handle_delete_tuple(connection: &ClientConnectionHandler, _: SequenceId, request: Request) -> Result<Response> {
    let Request::DeleteTuple { table, key, version } = request else {
        return Err(invalid(RequestKind::DeleteTuple));
    };
    connection.context().writable_store(&table)?.delete(&key, version)?;
    Ok(Response::Success)
}

fn handle_query_key(connection: &ClientConnectionHandler, _: SequenceId, request: Request) -> Result<Response> {
    let Request::QueryKey { table, key } = request else {
        return Err(invalid(RequestKind::QueryKey));
    };

    let mut tuples = Vec::new();
    for store in connection.context().readable_stores(&table)? {
        tuples.extend(store.get(&key)?);
    }
    Ok(Response::Tuples {
        tuples: sorted(tuples),
        complete: true,
    })
}

fn handle_query_bbox(connection: &ClientConnectionHandler, sequence: SequenceId, request: Request) -> Result<Response> {
    let Request::QueryBoundingBox { table, bbox, paging } = request else {
        return Err(invalid(RequestKind::QueryBoundingBox));
    };
    bbox.validate()?;

    let context = connection.context();
    let mut tuples = Vec::new();
    for store in context.readable_stores(&table)? {
        tuples.extend(store.query_box(&bbox)?);
    }

    let page_size = if paging { context.config().tuples_per_page } else { 0 };
    Ok(connection.queries().start(sequence, PagedQuery::new(sorted(tuples), page_size)))
}

fn handle_next_page(connection: &ClientConnectionHandler, _: SequenceId, request: Request) -> Result<Response> {
    let Request::NextPage { query } = request else {
        return Err(invalid(RequestKind::NextPage));
    };
    Ok(connection
        .queries()
        .next_page(query)
        .unwrap_or_else(|| Response::error(ErrorCode::UnknownQuery, format!("no open query {}", query))))
}

fn handle_cancel_query(connection: &ClientConnectionHandler, _: SequenceId, request: Request) -> Result<Response> {
    let Request::CancelQuery { query } = request else {
        return Err(invalid(RequestKind::CancelQuery));
    };
    if connection.queries().cancel(query) {
        Ok(Response::Success)
    } else {
        Ok(Response::error(ErrorCode::UnknownQuery, format!("no open query {}", query)))
    }
}

fn handle_lock_tuple(connection: &ClientConnectionHandler, sequence: SequenceId, request: Request) -> Result<Response> {
    let Request::LockTuple { table, key, version } = request else {
        return Err(invalid(RequestKind::LockTuple));
    };

    let context = connection.context();
    let mut newest = None;
    for store in context.readable_stores(&table)? {
        let stored = store.get(&key)?.iter().map(|t| t.version()).max();
        newest = newest.max(stored);
    }

    context.locks().lock_tuple(
        connection.id(),
        sequence,
        &table.without_region().to_string(),
        &key,
        version,
        newest,
    )?;
    Ok(Response::Success)
}

fn handle_unlock_tuple(connection: &ClientConnectionHandler, _: SequenceId, request: Request) -> Result<Response> {
    let Request::UnlockTuple { table, key } = request else {
        return Err(invalid(RequestKind::UnlockTuple));
    };
    let table = table.without_region().to_string();
    if connection.context().locks().unlock_tuple(connection.id(), &table, &key) {
        Ok(Response::Success)
    } else {
        Err(StorageError::Lock(format!("{}/{} is not locked by this connection", table, key)))
    }
}

fn handle_keepalive(_: &ClientConnectionHandler, _: SequenceId, _: Request) -> Result<Response> {
    Ok(Response::Success)
}

fn sorted(mut tuples: Vec<Tuple>) -> Vec<Tuple> {
    tuples.sort_by(|a, b| a.storage_order(b));
    tuples
}
