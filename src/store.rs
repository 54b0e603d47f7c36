use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{NestError, Result},
    index::SkipList,
    schema::BodyValidator,
};

pub type DocumentIndex = Arc<SkipList<String, Document>>;
pub type CollectionIndex = Arc<SkipList<String, Collection>>;

/// Creation/modification bookkeeping carried by every document.
/// `created_by`/`created_at` are write-once; the `last_modified` pair only
/// moves forward.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub created_by: String,
    pub created_at: i64,
    pub last_modified_by: String,
    pub last_modified_at: i64,
}

impl Metadata {
    pub(crate) fn new(user: &str, now: i64) -> Self {
        Self {
            created_by: user.to_string(),
            created_at: now,
            last_modified_by: user.to_string(),
            last_modified_at: now,
        }
    }

    pub(crate) fn touched(&self, user: &str, now: i64) -> Self {
        Self {
            created_by: self.created_by.clone(),
            created_at: self.created_at,
            last_modified_by: user.to_string(),
            last_modified_at: now.max(self.last_modified_at),
        }
    }
}

/// A JSON document plus its nested collections. Bodies are immutable once
/// stored; every write publishes a fresh `Arc`.
#[derive(Clone, Debug)]
pub struct Document {
    pub name: String,
    /// Absolute resource path, e.g. `/v1/db/doc`.
    pub path: String,
    pub body: Arc<Value>,
    pub metadata: Metadata,
    pub collections: CollectionIndex,
}

#[derive(Clone, Debug)]
pub struct Collection {
    pub name: String,
    pub documents: DocumentIndex,
}

#[derive(Clone, Debug)]
pub struct Database {
    pub name: String,
    pub documents: DocumentIndex,
}

/// Top-level state: the set of databases. Built once at startup, shared by
/// every request handler.
#[derive(Default)]
pub struct Root {
    databases: SkipList<String, Database>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Overwrite,
    NoOverwrite,
}

impl WriteMode {
    /// Only `nooverwrite` changes behavior; everything else overwrites.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("nooverwrite") => Self::NoOverwrite,
            _ => Self::Overwrite,
        }
    }
}

impl Root {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create-only; a second put of the same name is a conflict.
    pub fn put_database(&self, name: &str) -> Result<()> {
        self.databases.upsert(name.to_string(), |key, current| {
            if current.is_some() {
                return Err(NestError::Conflict(format!("database {key}")));
            }
            Ok(Database {
                name: key.clone(),
                documents: Arc::new(SkipList::new()),
            })
        })?;
        Ok(())
    }

    pub fn get_database(&self, name: &str) -> Result<Database> {
        self.databases
            .find(&name.to_string())
            .ok_or(NestError::DatabaseNotFound)
    }

    /// Removes the database and, with it, the whole subtree it owns.
    pub fn delete_database(&self, name: &str) -> Result<Database> {
        self.databases
            .remove(&name.to_string())
            .ok_or(NestError::DatabaseNotFound)
    }
}

pub fn get_document(documents: &SkipList<String, Document>, name: &str) -> Result<Document> {
    documents
        .find(&name.to_string())
        .ok_or(NestError::DocumentNotFound)
}

/// Validate, then create or overwrite. On overwrite the original
/// `created_by`/`created_at` pair and the collection index survive; only
/// the body and the `last_modified` pair change. Returns `true` when the
/// document did not exist before.
pub fn put_document(
    documents: &SkipList<String, Document>,
    name: &str,
    path: &str,
    body: Value,
    user: &str,
    mode: WriteMode,
    validator: &dyn BodyValidator,
) -> Result<bool> {
    let bytes = serde_json::to_vec(&body)?;
    validator.validate(&bytes)?;

    let now = Utc::now().timestamp();
    let body = Arc::new(body);
    let created = documents.upsert(name.to_string(), |key, current| match current {
        Some(existing) => {
            if mode == WriteMode::NoOverwrite {
                return Err(NestError::Conflict(format!("document {key}")));
            }
            Ok(Document {
                name: existing.name.clone(),
                path: path.to_string(),
                body: Arc::clone(&body),
                metadata: existing.metadata.touched(user, now),
                collections: Arc::clone(&existing.collections),
            })
        }
        None => Ok(Document {
            name: key.clone(),
            path: path.to_string(),
            body: Arc::clone(&body),
            metadata: Metadata::new(user, now),
            collections: Arc::new(SkipList::new()),
        }),
    })?;
    Ok(created)
}

pub fn delete_document(documents: &SkipList<String, Document>, name: &str) -> Result<Document> {
    documents
        .remove(&name.to_string())
        .ok_or(NestError::DocumentNotFound)
}

pub fn get_collection(collections: &SkipList<String, Collection>, name: &str) -> Result<Collection> {
    collections
        .find(&name.to_string())
        .ok_or(NestError::CollectionNotFound)
}

/// Create-only, like databases.
pub fn put_collection(collections: &SkipList<String, Collection>, name: &str) -> Result<()> {
    collections.upsert(name.to_string(), |key, current| {
        if current.is_some() {
            return Err(NestError::Conflict(format!("collection {key}")));
        }
        Ok(Collection {
            name: key.clone(),
            documents: Arc::new(SkipList::new()),
        })
    })?;
    Ok(())
}

pub fn delete_collection(
    collections: &SkipList<String, Collection>,
    name: &str,
) -> Result<Collection> {
    collections
        .remove(&name.to_string())
        .ok_or(NestError::CollectionNotFound)
}

/// Container-level retrieval: every document with `low <= name <= high`,
/// ascending. Open bounds when `None`.
pub fn list_documents(
    documents: &SkipList<String, Document>,
    cancel: &CancellationToken,
    low: Option<&String>,
    high: Option<&String>,
) -> Result<Vec<Document>> {
    documents.query(cancel, low, high)
}
