#![forbid(unsafe_code)]

//! Collection and document catalog.
//!
//! Three trees make up the catalog: collection paths to [`CollectionRecord`],
//! `collection id ++ document name` to [`DocumentRecord`], and the node index
//! owned by the [`NodeFile`]. Every mutation goes through a [`WriteLog`], so
//! the caller's transaction journals it; locking is the caller's business.

mod records;

use std::ops::ControlFlow;
use std::sync::Arc;

use tracing::{debug, info};

use crate::primitives::pager::{PageStore, WriteLog};
use crate::storage::btree::{BTree, IndexQuery};
use crate::storage::dom::NodeFile;
use crate::types::{ArbolError, CollectionId, DocId, NodeId, Result};

pub use records::{
    normalize_collection_path, parent_collection, split_document_path, Collection,
    CollectionRecord, Document, DocumentRecord, ROOT_COLLECTION,
};

use records::{document_key, unix_now};

/// Catalog trees over one page store.
pub struct Catalog {
    store: Arc<PageStore>,
    collections: BTree,
    documents: BTree,
    nodes: NodeFile,
}

impl Catalog {
    /// Whether the store already carries catalog roots.
    pub fn is_initialized(store: &PageStore) -> Result<bool> {
        Ok(!store.meta()?.collections_root.is_none())
    }

    /// Builds empty catalog trees, records their roots in the meta page and
    /// creates the root collection.
    pub fn create(store: Arc<PageStore>, log: &mut dyn WriteLog) -> Result<Self> {
        let collections = BTree::create(store.clone(), log, "collections")?;
        let documents = BTree::create(store.clone(), log, "documents")?;
        let index = BTree::create(store.clone(), log, "nodes")?;
        let roots = (collections.root(), documents.root(), index.root());
        store.update_meta(log, |meta| {
            meta.collections_root = roots.0;
            meta.documents_root = roots.1;
            meta.node_index_root = roots.2;
        })?;
        let catalog = Self {
            nodes: NodeFile::new(store.clone(), index),
            store,
            collections,
            documents,
        };
        catalog.insert_collection(log, ROOT_COLLECTION)?;
        info!(
            collections = roots.0 .0,
            documents = roots.1 .0,
            nodes = roots.2 .0,
            "catalog.create"
        );
        Ok(catalog)
    }

    /// Opens the catalog trees recorded in the meta page.
    pub fn open(store: Arc<PageStore>) -> Result<Self> {
        let meta = store.meta()?;
        let roots = [meta.collections_root, meta.documents_root, meta.node_index_root];
        if roots.iter().any(|root| root.is_none()) {
            return Err(ArbolError::Corruption("catalog roots missing from meta page"));
        }
        Ok(Self {
            collections: BTree::open(store.clone(), roots[0], "collections"),
            documents: BTree::open(store.clone(), roots[1], "documents"),
            nodes: NodeFile::new(store.clone(), BTree::open(store.clone(), roots[2], "nodes")),
            store,
        })
    }

    /// Collections tree.
    pub fn collections_tree(&self) -> &BTree {
        &self.collections
    }

    /// Documents tree.
    pub fn documents_tree(&self) -> &BTree {
        &self.documents
    }

    /// Node payload storage.
    pub fn nodes(&self) -> &NodeFile {
        &self.nodes
    }

    /// Creates a collection and any missing ancestors.
    ///
    /// Fails with `AlreadyExists` when the collection itself exists.
    pub fn create_collection(&self, log: &mut dyn WriteLog, path: &str) -> Result<Collection> {
        let path = normalize_collection_path(path)?;
        if self.get_collection(&path)?.is_some() {
            return Err(ArbolError::AlreadyExists(path));
        }
        let mut missing = Vec::new();
        let mut cursor = parent_collection(&path);
        while let Some(ancestor) = cursor {
            if self.get_collection(ancestor)?.is_some() {
                break;
            }
            missing.push(ancestor.to_string());
            cursor = parent_collection(ancestor);
        }
        for ancestor in missing.iter().rev() {
            self.insert_collection(log, ancestor)?;
        }
        self.insert_collection(log, &path)
    }

    /// Looks up a collection.
    pub fn get_collection(&self, path: &str) -> Result<Option<Collection>> {
        let path = normalize_collection_path(path)?;
        match self.collections.get(path.as_bytes())? {
            Some(value) => Ok(Some(Collection {
                record: CollectionRecord::decode(&value)?,
                path,
            })),
            None => Ok(None),
        }
    }

    /// Paths of the direct children of a collection, in path order.
    pub fn list_collections(&self, path: &str) -> Result<Vec<String>> {
        let parent = self.require_collection(path)?;
        let prefix = format!("{}/", parent.path);
        let mut children = Vec::new();
        self.collections
            .query(&IndexQuery::TruncRight(prefix.clone().into_bytes()), |key, _| {
                if let Ok(child) = std::str::from_utf8(key) {
                    if !child[prefix.len()..].contains('/') {
                        children.push(child.to_string());
                    }
                }
                ControlFlow::Continue(())
            })?;
        Ok(children)
    }

    /// Removes a collection with every sub-collection and document below it.
    /// Returns the number of documents removed.
    pub fn remove_collection(&self, log: &mut dyn WriteLog, path: &str) -> Result<usize> {
        let target = self.require_collection(path)?;
        if target.path == ROOT_COLLECTION {
            return Err(ArbolError::Invalid("the root collection cannot be removed"));
        }
        let mut doomed = vec![target];
        doomed.extend(self.descendants(&doomed[0].path)?);
        let mut documents = 0;
        for collection in doomed.iter().rev() {
            for name in self.list_documents(&collection.path)? {
                self.delete_document(log, collection.record.id, &name)?;
                documents += 1;
            }
            self.collections.remove(log, collection.path.as_bytes())?;
        }
        info!(path = %doomed[0].path, collections = doomed.len(), documents, "catalog.collection.remove");
        Ok(documents)
    }

    /// Renames a collection and its whole subtree. Collection ids are kept,
    /// so documents follow without being rewritten.
    pub fn move_collection(&self, log: &mut dyn WriteLog, from: &str, to: &str) -> Result<Collection> {
        let source = self.require_collection(from)?;
        let to = normalize_collection_path(to)?;
        if source.path == ROOT_COLLECTION {
            return Err(ArbolError::Invalid("the root collection cannot be moved"));
        }
        if to == source.path || to.starts_with(&format!("{}/", source.path)) {
            return Err(ArbolError::InvalidOwned(format!(
                "cannot move {} into itself",
                source.path
            )));
        }
        if self.get_collection(&to)?.is_some() {
            return Err(ArbolError::AlreadyExists(to));
        }
        if let Some(parent) = parent_collection(&to) {
            self.require_collection(parent)?;
        }
        let mut moving = vec![source.clone()];
        moving.extend(self.descendants(&source.path)?);
        for collection in &moving {
            let renamed = format!("{to}{}", &collection.path[source.path.len()..]);
            self.collections.remove(log, collection.path.as_bytes())?;
            self.collections
                .insert(log, renamed.as_bytes(), &collection.record.encode())?;
        }
        debug!(from = %source.path, to = %to, collections = moving.len(), "catalog.collection.move");
        Ok(Collection {
            path: to,
            record: source.record,
        })
    }

    /// Stores a document as a sequence of node payloads with ids `1..=n`.
    /// An existing document at `path` is replaced and keeps its id.
    pub fn store_document(&self, log: &mut dyn WriteLog, path: &str, nodes: &[Vec<u8>]) -> Result<Document> {
        let (collection, name) = split_document_path(path)?;
        let parent = self.require_collection(&collection)?;
        let key = document_key(parent.record.id, &name);
        let record = match self.documents.get(&key)? {
            Some(value) => {
                let mut record = DocumentRecord::decode(&value)?;
                self.nodes.remove_all(log, record.id)?;
                record.nodes = 0;
                record.next_node = 1;
                record.modified = unix_now();
                record
            }
            None => DocumentRecord::new(self.next_doc_id(log)?),
        };
        let mut record = record;
        for data in nodes {
            self.nodes.put(log, record.id, NodeId(record.next_node), data)?;
            record.next_node += 1;
            record.nodes += 1;
        }
        self.documents.insert(log, &key, &record.encode())?;
        debug!(path, doc = record.id.0, nodes = record.nodes, "catalog.document.store");
        Ok(Document {
            collection,
            name,
            record,
        })
    }

    /// Looks up a document.
    pub fn get_document(&self, path: &str) -> Result<Option<Document>> {
        let (collection, name) = split_document_path(path)?;
        let Some(parent) = self.get_collection(&collection)? else {
            return Ok(None);
        };
        match self.documents.get(&document_key(parent.record.id, &name))? {
            Some(value) => Ok(Some(Document {
                collection,
                name,
                record: DocumentRecord::decode(&value)?,
            })),
            None => Ok(None),
        }
    }

    /// Node payloads of a document in node id order.
    pub fn read_document(&self, path: &str) -> Result<Option<Vec<(NodeId, Vec<u8>)>>> {
        let Some(doc) = self.get_document(path)? else {
            return Ok(None);
        };
        let mut nodes = Vec::with_capacity(doc.record.nodes as usize);
        self.nodes.scan_document(doc.record.id, |node, data| {
            nodes.push((node, data.to_vec()));
            ControlFlow::Continue(())
        })?;
        Ok(Some(nodes))
    }

    /// Adds a node after the document's last one and returns its id.
    pub fn append_node(&self, log: &mut dyn WriteLog, path: &str, data: &[u8]) -> Result<NodeId> {
        let (key, mut record) = self.require_document(path)?;
        let node = NodeId(record.next_node);
        self.nodes.put(log, record.id, node, data)?;
        record.next_node += 1;
        record.nodes += 1;
        record.modified = unix_now();
        self.documents.insert(log, &key, &record.encode())?;
        Ok(node)
    }

    /// Appends bytes to an existing node payload.
    pub fn extend_node(&self, log: &mut dyn WriteLog, path: &str, node: NodeId, more: &[u8]) -> Result<()> {
        let (key, mut record) = self.require_document(path)?;
        self.nodes.append(log, record.id, node, more)?;
        record.modified = unix_now();
        self.documents.insert(log, &key, &record.encode())
    }

    /// Payload of one node.
    pub fn read_node(&self, path: &str, node: NodeId) -> Result<Option<Vec<u8>>> {
        match self.get_document(path)? {
            Some(doc) => self.nodes.get(doc.record.id, node),
            None => Ok(None),
        }
    }

    /// Removes one node. Returns whether it existed.
    pub fn remove_node(&self, log: &mut dyn WriteLog, path: &str, node: NodeId) -> Result<bool> {
        let (key, mut record) = self.require_document(path)?;
        if !self.nodes.remove(log, record.id, node)? {
            return Ok(false);
        }
        record.nodes = record.nodes.saturating_sub(1);
        record.modified = unix_now();
        self.documents.insert(log, &key, &record.encode())?;
        Ok(true)
    }

    /// Removes a document with all its nodes. Returns whether it existed.
    pub fn remove_document(&self, log: &mut dyn WriteLog, path: &str) -> Result<bool> {
        let (collection, name) = split_document_path(path)?;
        let parent = self.require_collection(&collection)?;
        self.delete_document(log, parent.record.id, &name)
    }

    /// Moves a document to a new path. The node data stays in place.
    pub fn move_document(&self, log: &mut dyn WriteLog, from: &str, to: &str) -> Result<Document> {
        let (from_key, record) = self.require_document(from)?;
        let (collection, name) = split_document_path(to)?;
        let target = self.require_collection(&collection)?;
        let to_key = document_key(target.record.id, &name);
        if to_key == from_key {
            return Err(ArbolError::InvalidOwned(format!("cannot move {from} onto itself")));
        }
        if self.documents.get(&to_key)?.is_some() {
            return Err(ArbolError::AlreadyExists(to.to_string()));
        }
        self.documents.remove(log, &from_key)?;
        self.documents.insert(log, &to_key, &record.encode())?;
        debug!(from, to, doc = record.id.0, "catalog.document.move");
        Ok(Document {
            collection,
            name,
            record,
        })
    }

    /// Copies a document under a new id, node by node.
    pub fn copy_document(&self, log: &mut dyn WriteLog, from: &str, to: &str) -> Result<Document> {
        let (_, source) = self.require_document(from)?;
        let (collection, name) = split_document_path(to)?;
        let target = self.require_collection(&collection)?;
        let to_key = document_key(target.record.id, &name);
        if self.documents.get(&to_key)?.is_some() {
            return Err(ArbolError::AlreadyExists(to.to_string()));
        }
        let record = self.clone_document(log, &source, &to_key)?;
        debug!(from, to, doc = record.id.0, nodes = record.nodes, "catalog.document.copy");
        Ok(Document {
            collection,
            name,
            record,
        })
    }

    /// Copies a collection with its whole subtree to `to`. Every copied
    /// collection and document gets a fresh id; node ids are kept.
    pub fn copy_collection(&self, log: &mut dyn WriteLog, from: &str, to: &str) -> Result<Collection> {
        let source = self.require_collection(from)?;
        let to = normalize_collection_path(to)?;
        if source.path == ROOT_COLLECTION {
            return Err(ArbolError::Invalid("the root collection cannot be copied"));
        }
        if to == source.path || to.starts_with(&format!("{}/", source.path)) {
            return Err(ArbolError::InvalidOwned(format!(
                "cannot copy {} into itself",
                source.path
            )));
        }
        if self.get_collection(&to)?.is_some() {
            return Err(ArbolError::AlreadyExists(to));
        }
        if let Some(parent) = parent_collection(&to) {
            self.require_collection(parent)?;
        }
        let mut copying = vec![source.clone()];
        copying.extend(self.descendants(&source.path)?);
        let mut documents = 0;
        let mut created = None;
        for collection in &copying {
            let renamed = format!("{to}{}", &collection.path[source.path.len()..]);
            let copy = self.insert_collection(log, &renamed)?;
            let mut entries = Vec::new();
            self.documents.query(
                &IndexQuery::TruncRight(collection.record.id.0.to_be_bytes().to_vec()),
                |key, value| {
                    entries.push((String::from_utf8_lossy(&key[4..]).into_owned(), value.to_vec()));
                    ControlFlow::Continue(())
                },
            )?;
            for (name, value) in entries {
                let key = document_key(copy.record.id, &name);
                self.clone_document(log, &DocumentRecord::decode(&value)?, &key)?;
                documents += 1;
            }
            created.get_or_insert(copy);
        }
        info!(from = %source.path, to = %to, collections = copying.len(), documents, "catalog.collection.copy");
        created.ok_or(ArbolError::Corruption("collection copy produced nothing"))
    }

    /// Names of the documents in a collection, in name order.
    pub fn list_documents(&self, path: &str) -> Result<Vec<String>> {
        let collection = self.require_collection(path)?;
        let prefix = collection.record.id.0.to_be_bytes().to_vec();
        let mut names = Vec::new();
        self.documents.query(&IndexQuery::TruncRight(prefix), |key, _| {
            names.push(String::from_utf8_lossy(&key[4..]).into_owned());
            ControlFlow::Continue(())
        })?;
        Ok(names)
    }

    fn insert_collection(&self, log: &mut dyn WriteLog, path: &str) -> Result<Collection> {
        let id = self.store.update_meta(log, |meta| {
            let id = meta.next_collection_id;
            meta.next_collection_id += 1;
            id
        })?;
        let record = CollectionRecord {
            id: CollectionId(id),
            created: unix_now(),
        };
        self.collections.insert(log, path.as_bytes(), &record.encode())?;
        debug!(path, id, "catalog.collection.create");
        Ok(Collection {
            path: path.to_string(),
            record,
        })
    }

    fn next_doc_id(&self, log: &mut dyn WriteLog) -> Result<DocId> {
        let id = self.store.update_meta(log, |meta| {
            let id = meta.next_doc_id;
            meta.next_doc_id += 1;
            id
        })?;
        Ok(DocId(id))
    }

    /// Writes a copy of `source` under a new id at `key`.
    fn clone_document(&self, log: &mut dyn WriteLog, source: &DocumentRecord, key: &[u8]) -> Result<DocumentRecord> {
        let mut nodes = Vec::with_capacity(source.nodes as usize);
        self.nodes.scan_document(source.id, |node, data| {
            nodes.push((node, data.to_vec()));
            ControlFlow::Continue(())
        })?;
        let mut record = DocumentRecord::new(self.next_doc_id(log)?);
        record.nodes = source.nodes;
        record.next_node = source.next_node;
        for (node, data) in &nodes {
            self.nodes.put(log, record.id, *node, data)?;
        }
        self.documents.insert(log, key, &record.encode())?;
        Ok(record)
    }

    fn delete_document(&self, log: &mut dyn WriteLog, collection: CollectionId, name: &str) -> Result<bool> {
        let Some(value) = self.documents.remove(log, &document_key(collection, name))? else {
            return Ok(false);
        };
        let record = DocumentRecord::decode(&value)?;
        let pages = self.nodes.remove_all(log, record.id)?;
        debug!(doc = record.id.0, pages, "catalog.document.remove");
        Ok(true)
    }

    fn require_collection(&self, path: &str) -> Result<Collection> {
        self.get_collection(path)?
            .ok_or_else(|| ArbolError::NotFound(format!("collection {path}")))
    }

    fn require_document(&self, path: &str) -> Result<(Vec<u8>, DocumentRecord)> {
        let (collection, name) = split_document_path(path)?;
        let parent = self.require_collection(&collection)?;
        let key = document_key(parent.record.id, &name);
        match self.documents.get(&key)? {
            Some(value) => Ok((key, DocumentRecord::decode(&value)?)),
            None => Err(ArbolError::NotFound(format!("document {path}"))),
        }
    }

    /// Every collection strictly below `path`, in path order.
    fn descendants(&self, path: &str) -> Result<Vec<Collection>> {
        let mut found = Vec::new();
        let prefix = format!("{path}/").into_bytes();
        self.collections
            .query(&IndexQuery::TruncRight(prefix), |key, value| {
                found.push((key.to_vec(), value.to_vec()));
                ControlFlow::Continue(())
            })?;
        found
            .into_iter()
            .map(|(key, value)| {
                Ok(Collection {
                    path: String::from_utf8(key)
                        .map_err(|_| ArbolError::Corruption("collection path is not UTF-8"))?,
                    record: CollectionRecord::decode(&value)?,
                })
            })
            .collect()
    }
}
