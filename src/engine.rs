//! Boundary to the analytical query engine.
//!
//! The server hands each QUERY to a [`QueryEngine`] as one synchronous call and relays
//! whatever comes back. An error outcome is a normal answer, reported to the client as
//! an ERROR message; it never affects the connection.
//!
//! [`Catalog`] is a dispatcher that routes query types to registered functions.
use std::collections::BTreeMap;

use crate::protocol::{Payload, Value};

/// Metadata kind every [`Catalog`] answers with its own query list.
pub const QUERY_TYPES_METADATA: &str = "query_types";

/// Successful result of a query. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub title: Option<String>,
    pub data: Option<Value>,
    pub headers: Option<Vec<String>>,
    /// Encoded image bytes (e.g. PNG).
    pub plot: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Ok(QueryResult),
    Error(String),
}

impl QueryOutcome {
    pub fn data(data: impl Into<Value>) -> Self {
        QueryOutcome::Ok(QueryResult {
            data: Some(data.into()),
            ..Default::default()
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        QueryOutcome::Error(message.into())
    }
}

pub trait QueryEngine: Send + Sync {
    fn process(&self, query_type: &str, parameters: &Payload) -> QueryOutcome;

    /// Lookup data used by clients to build queries (e.g. the list of areas).
    fn metadata(&self, kind: &str) -> QueryOutcome {
        QueryOutcome::Error(format!("Unknown metadata type requested: {kind}"))
    }

    /// Human readable description of a query type, if known.
    fn describe(&self, _query_type: &str) -> Option<String> {
        None
    }
}

type QueryFn = Box<dyn Fn(&Payload) -> QueryOutcome + Send + Sync>;
type MetadataFn = Box<dyn Fn() -> QueryOutcome + Send + Sync>;

struct Entry {
    description: String,
    run: QueryFn,
}

/// Routes query types and metadata kinds to registered functions.
#[derive(Default)]
pub struct Catalog {
    queries: BTreeMap<String, Entry>,
    metadata: BTreeMap<String, MetadataFn>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query<F>(mut self, name: &str, description: &str, run: F) -> Self
    where
        F: Fn(&Payload) -> QueryOutcome + Send + Sync + 'static,
    {
        self.queries.insert(
            name.to_string(),
            Entry {
                description: description.to_string(),
                run: Box::new(run),
            },
        );
        self
    }

    pub fn with_metadata<F>(mut self, kind: &str, provide: F) -> Self
    where
        F: Fn() -> QueryOutcome + Send + Sync + 'static,
    {
        self.metadata.insert(kind.to_string(), Box::new(provide));
        self
    }

    /// Registered `(name, description)` pairs in name order.
    pub fn query_types(&self) -> Vec<(&str, &str)> {
        self.queries
            .iter()
            .map(|(name, entry)| (name.as_str(), entry.description.as_str()))
            .collect()
    }
}

impl QueryEngine for Catalog {
    fn process(&self, query_type: &str, parameters: &Payload) -> QueryOutcome {
        match self.queries.get(query_type) {
            Some(entry) => (entry.run)(parameters),
            None => QueryOutcome::Error(format!("Unknown query type identifier: {query_type}")),
        }
    }

    fn metadata(&self, kind: &str) -> QueryOutcome {
        if let Some(provide) = self.metadata.get(kind) {
            return provide();
        }
        if kind == QUERY_TYPES_METADATA {
            let list = self
                .query_types()
                .into_iter()
                .map(|(name, description)| {
                    let mut item = Payload::new();
                    item.insert("name".to_string(), name.into());
                    item.insert("description".to_string(), description.into());
                    Value::Map(item)
                })
                .collect::<Vec<_>>();
            return QueryOutcome::data(list);
        }
        QueryOutcome::Error(format!("Unknown metadata type requested: {kind}"))
    }

    fn describe(&self, query_type: &str) -> Option<String> {
        self.queries
            .get(query_type)
            .map(|entry| entry.description.clone())
    }
}
