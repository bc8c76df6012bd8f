//! Core data types for dms-search.
//!
//! These types flow between the node repository, the field projector,
//! the text index and the secured query engine.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored kind of an indexable node.
///
/// Attachments are documents whose parent is a mail; they are told apart
/// when a result is assembled, not when the node is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Document,
    Folder,
    Mail,
}

impl NodeKind {
    pub const ALL: [NodeKind; 3] = [NodeKind::Document, NodeKind::Folder, NodeKind::Mail];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Document => "document",
            NodeKind::Folder => "folder",
            NodeKind::Mail => "mail",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "document" | "doc" => Ok(NodeKind::Document),
            "folder" | "fld" => Ok(NodeKind::Folder),
            "mail" => Ok(NodeKind::Mail),
            other => Err(format!(
                "unknown node kind '{}'; expected document, folder or mail",
                other
            )),
        }
    }
}

/// Permission bits stored in user/role permission maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    Write,
    Delete,
    Security,
}

impl Permission {
    pub const fn bit(self) -> u32 {
        match self {
            Permission::Read => 1,
            Permission::Write => 2,
            Permission::Delete => 4,
            Permission::Security => 8,
        }
    }

    pub const fn is_set(self, mask: u32) -> bool {
        mask & self.bit() != 0
    }
}

/// Bitmask granting every permission.
pub const ALL_PERMISSIONS: u32 = 1 | 2 | 4 | 8;

/// Content attached to a node before text extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContentSource {
    /// Already plain text (mail bodies, text files).
    Text(String),
    /// Binary payload that needs the text extractor.
    Binary { data: Vec<u8>, mime_type: String },
}

/// One value of a dynamic property group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeProperty {
    /// Property group name (e.g. `okg:consulting`).
    pub group: String,
    /// Property name (e.g. `okp:consulting.date`).
    pub name: String,
    /// Raw stored value; dates are `yyyyMMddHHmmss...`, selects a JSON array.
    pub value: String,
}

/// Any entity that can appear in the text index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexableNode {
    pub uuid: String,
    /// `None` only for the root folder.
    pub parent: Option<String>,
    pub name: String,
    pub kind: NodeKind,
    pub author: Option<String>,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub title: Option<String>,
    pub mime_type: Option<String>,
    /// Mail subject.
    pub subject: Option<String>,
    /// Mail sender.
    pub from: Option<String>,
    /// Mail recipients.
    pub to: BTreeSet<String>,
    pub user_permissions: BTreeMap<String, u32>,
    pub role_permissions: BTreeMap<String, u32>,
    pub keywords: BTreeSet<String>,
    pub categories: BTreeSet<String>,
    pub subscriptors: BTreeSet<String>,
    pub properties: Vec<NodeProperty>,
    /// Full content; repositories leave this empty unless asked to load it.
    #[serde(skip)]
    pub content: Option<ContentSource>,
}

impl IndexableNode {
    /// A node with empty permission maps and classification sets.
    pub fn new(uuid: impl Into<String>, kind: NodeKind, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            uuid: uuid.into(),
            parent: None,
            name: name.into(),
            kind,
            author: None,
            created: now,
            last_modified: now,
            title: None,
            mime_type: None,
            subject: None,
            from: None,
            to: BTreeSet::new(),
            user_permissions: BTreeMap::new(),
            role_permissions: BTreeMap::new(),
            keywords: BTreeSet::new(),
            categories: BTreeSet::new(),
            subscriptors: BTreeSet::new(),
            properties: Vec::new(),
            content: None,
        }
    }
}

/// The subject on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub user: String,
    pub roles: BTreeSet<String>,
}

impl Principal {
    pub fn new<I, S>(user: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user: user.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// The node carried by a [`QueryResult`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "node", rename_all = "lowercase")]
pub enum NodePayload {
    Document(IndexableNode),
    /// A document whose parent is a mail.
    Attachment(IndexableNode),
    Folder(IndexableNode),
    Mail(IndexableNode),
}

impl NodePayload {
    pub fn node(&self) -> &IndexableNode {
        match self {
            NodePayload::Document(n)
            | NodePayload::Attachment(n)
            | NodePayload::Folder(n)
            | NodePayload::Mail(n) => n,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            NodePayload::Document(_) => "document",
            NodePayload::Attachment(_) => "attachment",
            NodePayload::Folder(_) => "folder",
            NodePayload::Mail(_) => "mail",
        }
    }
}

/// One matched, access-checked, highlighted node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub score: f64,
    pub excerpt: Option<String>,
    #[serde(flatten)]
    pub payload: NodePayload,
}

/// A page of results plus the strategy-dependent total estimate.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultPage {
    pub results: Vec<QueryResult>,
    pub total: u64,
}

impl ResultPage {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn uuids(&self) -> Vec<&str> {
        self.results
            .iter()
            .map(|r| r.payload.node().uuid.as_str())
            .collect()
    }
}
