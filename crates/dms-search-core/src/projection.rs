//! Field projection: one [`IndexableNode`] in, one [`IndexDocument`] out.
//!
//! The set of projected attributes and the shape of each one are fixed when
//! the [`IndexSchema`] is built. Projection then walks the rules in order;
//! no runtime type inspection happens per document.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::collaborators::TextExtractor;
use crate::error::{SearchError, SearchResult};
use crate::models::{ContentSource, IndexableNode, NodeKind, NodeProperty, Permission};
use crate::query::{FieldCatalog, FieldKind};

/// Field names shared by the projector, the query engine and the read filter.
pub mod fields {
    pub const UUID: &str = "uuid";
    pub const PARENT: &str = "parent";
    pub const KIND: &str = "kind";
    pub const NAME: &str = "name";
    pub const AUTHOR: &str = "author";
    pub const CREATED: &str = "created";
    pub const LAST_MODIFIED: &str = "lastModified";
    pub const TITLE: &str = "title";
    pub const MIME_TYPE: &str = "mimeType";
    pub const SUBJECT: &str = "subject";
    pub const FROM: &str = "from";
    pub const TO: &str = "to";
    pub const TEXT: &str = "text";
    pub const CONTENT: &str = "content";
    pub const USER_PERMISSION: &str = "userPermission";
    pub const ROLE_PERMISSION: &str = "rolePermission";
    pub const KEYWORD: &str = "keyword";
    pub const CATEGORY: &str = "category";
    pub const SUBSCRIPTOR: &str = "subscriptor";
}

/// Fixed-width date prefix kept for date-typed properties (`yyyyMMdd`).
pub const DATE_PREFIX_LEN: usize = 8;

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// One named field of an [`IndexDocument`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexField {
    /// Analyzed fields are tokenized; the rest match whole values.
    pub analyzed: bool,
    pub values: Vec<String>,
}

/// The per-node projection stored in the text index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub uuid: String,
    pub kind: NodeKind,
    pub fields: BTreeMap<String, IndexField>,
}

impl IndexDocument {
    pub fn new(uuid: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            uuid: uuid.into(),
            kind,
            fields: BTreeMap::new(),
        }
    }

    /// Append a value; empty values are never stored.
    pub fn add(&mut self, field: &str, analyzed: bool, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            return;
        }
        self.fields
            .entry(field.to_string())
            .or_insert_with(|| IndexField {
                analyzed,
                values: Vec::new(),
            })
            .values
            .push(value);
    }

    pub fn values(&self, field: &str) -> &[String] {
        self.fields
            .get(field)
            .map(|f| f.values.as_slice())
            .unwrap_or(&[])
    }

    pub fn first(&self, field: &str) -> Option<&str> {
        self.values(field).first().map(String::as_str)
    }

    /// The full-text field used for excerpts and term listing.
    pub fn content_field(&self) -> Option<&'static str> {
        content_field_for(self.kind)
    }

    /// Full text of the content field, if the node has one.
    pub fn content_text(&self) -> Option<String> {
        let field = self.content_field()?;
        let values = self.values(field);
        if values.is_empty() {
            None
        } else {
            Some(values.join("\n"))
        }
    }
}

/// Which field carries the full text of a node kind.
pub fn content_field_for(kind: NodeKind) -> Option<&'static str> {
    match kind {
        NodeKind::Document => Some(fields::TEXT),
        NodeKind::Mail => Some(fields::CONTENT),
        NodeKind::Folder => None,
    }
}

/// Source attribute of an [`IndexableNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceAttr {
    Uuid,
    Parent,
    Kind,
    Name,
    Author,
    Created,
    LastModified,
    Title,
    MimeType,
    Subject,
    From,
    To,
    Keywords,
    Categories,
    Subscriptors,
    UserPermissions,
    RolePermissions,
    Properties,
    Content,
}

impl SourceAttr {
    /// Attribute name as declared on the entity.
    pub fn attribute_name(&self) -> &'static str {
        match self {
            SourceAttr::Uuid => "uuid",
            SourceAttr::Parent => "parent",
            SourceAttr::Kind => "kind",
            SourceAttr::Name => "name",
            SourceAttr::Author => "author",
            SourceAttr::Created => "created",
            SourceAttr::LastModified => "lastModified",
            SourceAttr::Title => "title",
            SourceAttr::MimeType => "mimeType",
            SourceAttr::Subject => "subject",
            SourceAttr::From => "from",
            SourceAttr::To => "to",
            SourceAttr::Keywords => "keywords",
            SourceAttr::Categories => "categories",
            SourceAttr::Subscriptors => "subscriptors",
            SourceAttr::UserPermissions => "userPermissions",
            SourceAttr::RolePermissions => "rolePermissions",
            SourceAttr::Properties => "properties",
            SourceAttr::Content => "content",
        }
    }
}

/// Canonical index field name for a plural collection attribute.
pub fn canonical_field_name(attribute: &str) -> String {
    match attribute {
        "keywords" => fields::KEYWORD.to_string(),
        "categories" => fields::CATEGORY.to_string(),
        "subscriptors" => fields::SUBSCRIPTOR.to_string(),
        "userPermissions" => fields::USER_PERMISSION.to_string(),
        "rolePermissions" => fields::ROLE_PERMISSION.to_string(),
        other => other.to_string(),
    }
}

/// Closed set of ways an attribute becomes index fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyShape {
    /// Single value; lower-cased when the kind says so.
    Scalar { field: String, kind: FieldKind },
    /// One value per set member.
    MultiValued { field: String },
    /// One subject per entry whose mask has the READ bit.
    PermissionMap { field: String },
    /// Per-deployment property groups.
    DynamicForm,
    /// Extracted text, resolved on first access.
    LazyContent { field: String, kinds: Vec<NodeKind> },
}

/// One projection rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRule {
    pub source: SourceAttr,
    pub shape: PropertyShape,
}

/// Declared type of a dynamic property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Text,
    Date,
    Select,
    Checkbox,
}

/// Raw property definition, as read from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// A property group with its property definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyGroupDefinition {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
}

/// Resolved property definitions. Malformed definitions are kept as errors
/// so only the affected property fails to project.
#[derive(Debug, Clone, Default)]
pub struct PropertyForms {
    by_name: HashMap<String, Result<PropertyType, String>>,
}

impl PropertyForms {
    pub fn from_groups(groups: &[PropertyGroupDefinition]) -> Self {
        let mut by_name = HashMap::new();
        for group in groups {
            for prop in &group.properties {
                let resolved = match prop.kind.trim().to_ascii_lowercase().as_str() {
                    "text" | "input" | "textarea" => Ok(PropertyType::Text),
                    "date" => Ok(PropertyType::Date),
                    "select" => Ok(PropertyType::Select),
                    "checkbox" => Ok(PropertyType::Checkbox),
                    other => Err(format!(
                        "property '{}' in group '{}' has unknown type '{}'",
                        prop.name, group.name, other
                    )),
                };
                by_name.insert(prop.name.clone(), resolved);
            }
        }
        Self { by_name }
    }

    fn lookup(&self, name: &str) -> Option<&Result<PropertyType, String>> {
        self.by_name.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }
}

/// Ordered projection rules plus dynamic property forms.
#[derive(Debug, Clone)]
pub struct IndexSchema {
    rules: Vec<FieldRule>,
    kinds: HashMap<String, FieldKind>,
    forms: PropertyForms,
}

impl IndexSchema {
    /// The node schema used by the document store.
    pub fn standard(forms: PropertyForms) -> Self {
        let mut schema = Self {
            rules: Vec::new(),
            kinds: HashMap::new(),
            forms,
        };

        use SourceAttr::*;
        schema.scalar(Uuid, FieldKind::Exact);
        schema.scalar(Parent, FieldKind::Exact);
        schema.scalar(Kind, FieldKind::Exact);
        schema.scalar(Name, FieldKind::LowercaseExact);
        schema.scalar(Author, FieldKind::Exact);
        schema.scalar(Created, FieldKind::Exact);
        schema.scalar(LastModified, FieldKind::Exact);
        schema.scalar(Title, FieldKind::Analyzed);
        schema.scalar(MimeType, FieldKind::Exact);
        schema.scalar(Subject, FieldKind::Analyzed);
        schema.scalar(From, FieldKind::Exact);
        schema.multi(To);
        schema.multi(Keywords);
        schema.multi(Categories);
        schema.multi(Subscriptors);
        schema.permissions(UserPermissions);
        schema.permissions(RolePermissions);
        schema.register(Properties, PropertyShape::DynamicForm);
        schema.lazy(fields::TEXT, vec![NodeKind::Document]);
        schema.lazy(fields::CONTENT, vec![NodeKind::Mail]);
        schema
    }

    fn register(&mut self, source: SourceAttr, shape: PropertyShape) {
        match &shape {
            PropertyShape::Scalar { field, kind } => {
                self.kinds.insert(field.clone(), *kind);
            }
            PropertyShape::MultiValued { field } | PropertyShape::PermissionMap { field } => {
                self.kinds.insert(field.clone(), FieldKind::Exact);
            }
            PropertyShape::LazyContent { field, .. } => {
                self.kinds.insert(field.clone(), FieldKind::Analyzed);
            }
            PropertyShape::DynamicForm => {}
        }
        self.rules.push(FieldRule { source, shape });
    }

    fn scalar(&mut self, source: SourceAttr, kind: FieldKind) {
        let field = canonical_field_name(source.attribute_name());
        self.register(source, PropertyShape::Scalar { field, kind });
    }

    fn multi(&mut self, source: SourceAttr) {
        let field = canonical_field_name(source.attribute_name());
        self.register(source, PropertyShape::MultiValued { field });
    }

    fn permissions(&mut self, source: SourceAttr) {
        let field = canonical_field_name(source.attribute_name());
        self.register(source, PropertyShape::PermissionMap { field });
    }

    fn lazy(&mut self, field: &str, kinds: Vec<NodeKind>) {
        self.register(
            SourceAttr::Content,
            PropertyShape::LazyContent {
                field: field.to_string(),
                kinds,
            },
        );
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    pub fn forms(&self) -> &PropertyForms {
        &self.forms
    }

    pub fn is_analyzed(&self, field: &str) -> bool {
        self.field_kind(field) == FieldKind::Analyzed
    }
}

impl FieldCatalog for IndexSchema {
    fn field_kind(&self, field: &str) -> FieldKind {
        self.kinds.get(field).copied().unwrap_or(FieldKind::Exact)
    }
}

/// Text that is extracted at most once, on first access.
pub struct LazyText<'a> {
    uuid: &'a str,
    source: Option<&'a ContentSource>,
    extractor: &'a dyn TextExtractor,
    cell: OnceLock<String>,
}

impl<'a> LazyText<'a> {
    pub fn new(
        uuid: &'a str,
        source: Option<&'a ContentSource>,
        extractor: &'a dyn TextExtractor,
    ) -> Self {
        Self {
            uuid,
            source,
            extractor,
            cell: OnceLock::new(),
        }
    }

    /// Resolve the text. Extraction failures degrade to an empty string.
    pub fn get(&self) -> &str {
        self.cell.get_or_init(|| match self.source {
            None => String::new(),
            Some(ContentSource::Text(text)) => text.clone(),
            Some(ContentSource::Binary { data, mime_type }) => {
                match self.extractor.extract(data, mime_type) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(uuid = self.uuid, mime_type = %mime_type, error = %e, "text extraction failed, indexing empty text");
                        String::new()
                    }
                }
            }
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }
}

/// Maps nodes to index documents according to an [`IndexSchema`].
pub struct FieldProjector {
    schema: Arc<IndexSchema>,
    extractor: Arc<dyn TextExtractor>,
}

impl FieldProjector {
    pub fn new(schema: Arc<IndexSchema>, extractor: Arc<dyn TextExtractor>) -> Self {
        Self { schema, extractor }
    }

    pub fn schema(&self) -> &Arc<IndexSchema> {
        &self.schema
    }

    pub fn extractor(&self) -> &dyn TextExtractor {
        self.extractor.as_ref()
    }

    /// Project `node`. Never fails as a whole: extraction errors yield empty
    /// text and malformed properties are skipped individually.
    pub fn project(&self, node: &IndexableNode) -> IndexDocument {
        let mut doc = IndexDocument::new(&node.uuid, node.kind);
        let content = LazyText::new(&node.uuid, node.content.as_ref(), self.extractor.as_ref());

        for rule in self.schema.rules() {
            match &rule.shape {
                PropertyShape::Scalar { field, kind } => {
                    if let Some(value) = scalar_value(node, rule.source) {
                        let value = match kind {
                            FieldKind::LowercaseExact => value.to_lowercase(),
                            _ => value,
                        };
                        doc.add(field, *kind == FieldKind::Analyzed, value);
                    }
                }
                PropertyShape::MultiValued { field } => {
                    for value in set_values(node, rule.source) {
                        doc.add(field, false, value.as_str());
                    }
                }
                PropertyShape::PermissionMap { field } => {
                    let map = match rule.source {
                        SourceAttr::RolePermissions => &node.role_permissions,
                        _ => &node.user_permissions,
                    };
                    for (subject, mask) in map {
                        if Permission::Read.is_set(*mask) {
                            doc.add(field, false, subject.as_str());
                        }
                    }
                }
                PropertyShape::DynamicForm => {
                    for prop in &node.properties {
                        match self.project_property(prop) {
                            Ok(values) => {
                                for value in values {
                                    doc.add(&prop.name, false, value);
                                }
                            }
                            Err(e) => {
                                tracing::warn!(uuid = %node.uuid, property = %prop.name, error = %e, "skipping malformed property");
                            }
                        }
                    }
                }
                PropertyShape::LazyContent { field, kinds } => {
                    if kinds.contains(&node.kind) {
                        doc.add(field, true, content.get());
                    }
                }
            }
        }

        doc
    }

    /// Values for one dynamic property.
    pub fn project_property(&self, prop: &NodeProperty) -> SearchResult<Vec<String>> {
        if prop.value.is_empty() {
            return Ok(Vec::new());
        }

        let kind = match self.schema.forms().lookup(&prop.name) {
            None => PropertyType::Text,
            Some(Ok(kind)) => *kind,
            Some(Err(message)) => return Err(SearchError::parse(message.clone(), 0)),
        };

        match kind {
            PropertyType::Date => {
                let prefix: String = prop.value.chars().take(DATE_PREFIX_LEN).collect();
                if prefix.chars().count() < DATE_PREFIX_LEN
                    || !prefix.chars().all(|c| c.is_ascii_digit())
                {
                    return Err(SearchError::parse(
                        format!("'{}' is not a yyyyMMdd date", prop.value),
                        0,
                    ));
                }
                Ok(vec![prefix])
            }
            PropertyType::Select => serde_json::from_str::<Vec<String>>(&prop.value)
                .map_err(|e| SearchError::parse(e.to_string(), e.column())),
            PropertyType::Text | PropertyType::Checkbox => Ok(vec![prop.value.clone()]),
        }
    }
}

fn format_timestamp(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn scalar_value(node: &IndexableNode, source: SourceAttr) -> Option<String> {
    match source {
        SourceAttr::Uuid => Some(node.uuid.clone()),
        SourceAttr::Parent => node.parent.clone(),
        SourceAttr::Kind => Some(node.kind.as_str().to_string()),
        SourceAttr::Name => Some(node.name.clone()),
        SourceAttr::Author => node.author.clone(),
        SourceAttr::Created => Some(format_timestamp(&node.created)),
        SourceAttr::LastModified => Some(format_timestamp(&node.last_modified)),
        SourceAttr::Title => node.title.clone(),
        SourceAttr::MimeType => node.mime_type.clone(),
        SourceAttr::Subject => node.subject.clone(),
        SourceAttr::From => node.from.clone(),
        _ => None,
    }
}

fn set_values(node: &IndexableNode, source: SourceAttr) -> impl Iterator<Item = &String> {
    let set = match source {
        SourceAttr::To => Some(&node.to),
        SourceAttr::Keywords => Some(&node.keywords),
        SourceAttr::Categories => Some(&node.categories),
        SourceAttr::Subscriptors => Some(&node.subscriptors),
        _ => None,
    };
    set.into_iter().flatten()
}
