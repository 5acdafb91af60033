//! Immutable cluster schema tree.
//!
//! The tree is built once (programmatically or from JSON), named datatype references are
//! resolved at construction, and afterwards it is only read - it is shared between all
//! exchanges through an `Arc` without locking.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::report::{AttributePathFilter, ConcreteAttributePath, ConcreteEventPath, EventPathFilter};
use crate::status::StatusCode;

const MAX_REFERENCE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metatype {
    Integer,
    Float,
    Boolean,
    Bytes,
    String,
    Enum,
    Bitmap,
    Object,
    Array,
    Any,
    /// Points to a named cluster datatype through `base`; never seen after resolution.
    Reference,
}

impl std::fmt::Display for Metatype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Metatype::Integer => "integer",
            Metatype::Float => "float",
            Metatype::Boolean => "boolean",
            Metatype::Bytes => "bytes",
            Metatype::String => "string",
            Metatype::Enum => "enum",
            Metatype::Bitmap => "bitmap",
            Metatype::Object => "object",
            Metatype::Array => "array",
            Metatype::Any => "any",
            Metatype::Reference => "reference",
        };
        write!(f, "{}", s)
    }
}

/// One typed element: a field, an attribute value, a command payload, ...
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaNode {
    /// Context tag when the node is a field of an object.
    #[serde(default)]
    pub id: u32,
    pub name: String,
    pub metatype: Metatype,
    #[serde(default)]
    pub byte_width: Option<u8>,
    #[serde(default)]
    pub signed: bool,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub optional: bool,
    /// Name of the referenced datatype for [Metatype::Reference].
    #[serde(default)]
    pub base: Option<String>,
    /// Fields of an object, or the single element type of an array.
    #[serde(default)]
    pub children: Vec<SchemaNode>,
}

impl SchemaNode {
    pub fn new(name: &str, metatype: Metatype) -> Self {
        Self {
            id: 0,
            name: name.to_owned(),
            metatype,
            byte_width: None,
            signed: false,
            nullable: false,
            optional: false,
            base: None,
            children: Vec::new(),
        }
    }
    pub fn uint(name: &str, byte_width: u8) -> Self {
        Self {
            byte_width: Some(byte_width),
            ..Self::new(name, Metatype::Integer)
        }
    }
    pub fn int(name: &str, byte_width: u8) -> Self {
        Self {
            byte_width: Some(byte_width),
            signed: true,
            ..Self::new(name, Metatype::Integer)
        }
    }
    pub fn enumeration(name: &str) -> Self {
        Self {
            byte_width: Some(1),
            ..Self::new(name, Metatype::Enum)
        }
    }
    pub fn boolean(name: &str) -> Self {
        Self::new(name, Metatype::Boolean)
    }
    pub fn string(name: &str) -> Self {
        Self::new(name, Metatype::String)
    }
    pub fn bytes(name: &str) -> Self {
        Self::new(name, Metatype::Bytes)
    }
    pub fn object(name: &str, fields: Vec<SchemaNode>) -> Self {
        Self {
            children: fields,
            ..Self::new(name, Metatype::Object)
        }
    }
    pub fn array(name: &str, element: SchemaNode) -> Self {
        Self {
            children: vec![element],
            ..Self::new(name, Metatype::Array)
        }
    }
    pub fn reference(name: &str, base: &str) -> Self {
        Self {
            base: Some(base.to_owned()),
            ..Self::new(name, Metatype::Reference)
        }
    }
    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    fn resolve(&self, datatypes: &[SchemaNode], depth: usize) -> Result<SchemaNode> {
        if depth > MAX_REFERENCE_DEPTH {
            anyhow::bail!("datatype reference chain too deep at '{}'", self.name);
        }
        if self.metatype == Metatype::Reference {
            let base = self
                .base
                .as_deref()
                .context(format!("reference '{}' has no base", self.name))?;
            let target = datatypes
                .iter()
                .find(|d| d.name == base)
                .context(format!("unresolved datatype '{}' referenced by '{}'", base, self.name))?;
            let mut resolved = target.resolve(datatypes, depth + 1)?;
            resolved.id = self.id;
            resolved.name = self.name.clone();
            resolved.optional = self.optional;
            resolved.nullable = self.nullable || resolved.nullable;
            return Ok(resolved);
        }
        let mut out = self.clone();
        out.children = self
            .children
            .iter()
            .map(|c| c.resolve(datatypes, depth + 1))
            .collect::<Result<Vec<_>>>()?;
        Ok(out)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeSchema {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub writable: bool,
    pub value: SchemaNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSchema {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub priority: u8,
    pub value: SchemaNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSchema {
    pub id: u32,
    pub name: String,
    pub request: SchemaNode,
    #[serde(default)]
    pub response_id: Option<u32>,
    #[serde(default)]
    pub response: Option<SchemaNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSchema {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<AttributeSchema>,
    #[serde(default)]
    pub events: Vec<EventSchema>,
    #[serde(default)]
    pub commands: Vec<CommandSchema>,
    /// Named datatypes referenced by [Metatype::Reference] nodes of this cluster.
    #[serde(default)]
    pub datatypes: Vec<SchemaNode>,
}

impl ClusterSchema {
    pub fn attribute(&self, id: u32) -> Option<&AttributeSchema> {
        self.attributes
            .binary_search_by_key(&id, |a| a.id)
            .ok()
            .map(|i| &self.attributes[i])
    }
    pub fn event(&self, id: u32) -> Option<&EventSchema> {
        self.events
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|i| &self.events[i])
    }
    pub fn command(&self, id: u32) -> Option<&CommandSchema> {
        self.commands
            .binary_search_by_key(&id, |c| c.id)
            .ok()
            .map(|i| &self.commands[i])
    }
    /// Command schema whose response carries the given response command id.
    pub fn command_by_response(&self, response_id: u32) -> Option<&CommandSchema> {
        self.commands.iter().find(|c| c.response_id == Some(response_id))
    }

    fn resolved(mut self) -> Result<Self> {
        let datatypes = std::mem::take(&mut self.datatypes);
        for a in self.attributes.iter_mut() {
            a.value = a.value.resolve(&datatypes, 0)?;
        }
        for e in self.events.iter_mut() {
            e.value = e.value.resolve(&datatypes, 0)?;
        }
        for c in self.commands.iter_mut() {
            c.request = c.request.resolve(&datatypes, 0)?;
            if let Some(r) = &c.response {
                c.response = Some(r.resolve(&datatypes, 0)?);
            }
        }
        self.attributes.sort_by_key(|a| a.id);
        self.events.sort_by_key(|e| e.id);
        self.commands.sort_by_key(|c| c.id);
        self.datatypes = datatypes;
        Ok(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSchema {
    pub id: u16,
    pub clusters: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SchemaDocument {
    clusters: Vec<ClusterSchema>,
    endpoints: Vec<EndpointSchema>,
}

/// Endpoint composition plus cluster definitions of one node.
#[derive(Debug, Clone)]
pub struct SchemaTree {
    clusters: BTreeMap<u32, ClusterSchema>,
    endpoints: BTreeMap<u16, BTreeSet<u32>>,
}

impl SchemaTree {
    pub fn new(clusters: Vec<ClusterSchema>, endpoints: Vec<EndpointSchema>) -> Result<Self> {
        let mut cmap = BTreeMap::new();
        for c in clusters {
            let id = c.id;
            let c = c.resolved().context(format!("resolving cluster 0x{:x}", id))?;
            cmap.insert(id, c);
        }
        let mut emap = BTreeMap::new();
        for e in endpoints {
            for c in &e.clusters {
                if !cmap.contains_key(c) {
                    anyhow::bail!("endpoint {} uses undefined cluster 0x{:x}", e.id, c);
                }
            }
            emap.insert(e.id, e.clusters.into_iter().collect());
        }
        Ok(Self {
            clusters: cmap,
            endpoints: emap,
        })
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let doc: SchemaDocument = serde_json::from_str(data).context("parsing schema json")?;
        Self::new(doc.clusters, doc.endpoints)
    }

    pub fn load(path: &str) -> Result<Self> {
        let data = std::fs::read_to_string(path).context(format!("reading schema from {}", path))?;
        Self::from_json(&data)
    }

    pub fn cluster(&self, id: u32) -> Option<&ClusterSchema> {
        self.clusters.get(&id)
    }

    pub fn has_cluster(&self, endpoint: u16, cluster: u32) -> bool {
        self.endpoints
            .get(&endpoint)
            .is_some_and(|c| c.contains(&cluster))
    }

    /// Cluster definition when the endpoint hosts the cluster.
    pub fn endpoint_cluster(&self, endpoint: u16, cluster: u32) -> Result<&ClusterSchema, StatusCode> {
        let clusters = self.endpoints.get(&endpoint).ok_or(StatusCode::UnsupportedEndpoint)?;
        if !clusters.contains(&cluster) {
            return Err(StatusCode::UnsupportedCluster);
        }
        self.clusters.get(&cluster).ok_or(StatusCode::UnsupportedCluster)
    }

    pub fn attribute(&self, path: &ConcreteAttributePath) -> Result<&AttributeSchema, StatusCode> {
        self.endpoint_cluster(path.endpoint_id, path.cluster_id)?
            .attribute(path.attribute_id)
            .ok_or(StatusCode::UnsupportedAttribute)
    }

    pub fn event(&self, path: &ConcreteEventPath) -> Result<&EventSchema, StatusCode> {
        self.endpoint_cluster(path.endpoint_id, path.cluster_id)?
            .event(path.event_id)
            .ok_or(StatusCode::UnsupportedEvent)
    }

    pub fn command(&self, endpoint: u16, cluster: u32, command: u32) -> Result<&CommandSchema, StatusCode> {
        self.endpoint_cluster(endpoint, cluster)?
            .command(command)
            .ok_or(StatusCode::UnsupportedCommand)
    }

    fn matching_clusters<'a>(
        &'a self,
        endpoint: Option<u16>,
        cluster: Option<u32>,
    ) -> impl Iterator<Item = (u16, &'a ClusterSchema)> + 'a {
        self.endpoints
            .iter()
            .filter(move |(ep, _)| endpoint.map_or(true, |e| e == **ep))
            .flat_map(move |(ep, clusters)| {
                clusters
                    .iter()
                    .filter(move |c| cluster.map_or(true, |f| f == **c))
                    .filter_map(move |c| self.clusters.get(c).map(|cs| (*ep, cs)))
            })
    }

    /// Expands attribute filters into concrete paths in endpoint/cluster/attribute order.
    ///
    /// Paths that are fully specified but do not exist map to the status to report for them;
    /// wildcard expansion only yields existing paths. A path named by several filters appears once.
    pub fn expand_attributes(
        &self,
        filters: &[AttributePathFilter],
    ) -> BTreeMap<ConcreteAttributePath, Option<StatusCode>> {
        let mut out = BTreeMap::new();
        for f in filters {
            if let Some(path) = f.as_concrete() {
                let status = self.attribute(&path).err();
                let entry = out.entry(path).or_insert(status);
                if status.is_none() {
                    *entry = None;
                }
                continue;
            }
            for (ep, cluster) in self.matching_clusters(f.endpoint_id, f.cluster_id) {
                for a in &cluster.attributes {
                    if f.attribute_id.map_or(true, |id| id == a.id) {
                        let path = ConcreteAttributePath::new(ep, cluster.id, a.id);
                        out.insert(path, None);
                    }
                }
            }
        }
        out
    }

    /// Same as [SchemaTree::expand_attributes] for event paths.
    pub fn expand_events(&self, filters: &[EventPathFilter]) -> BTreeMap<ConcreteEventPath, Option<StatusCode>> {
        let mut out = BTreeMap::new();
        for f in filters {
            if let Some(path) = f.as_concrete() {
                let status = self.event(&path).err();
                let entry = out.entry(path).or_insert(status);
                if status.is_none() {
                    *entry = None;
                }
                continue;
            }
            for (ep, cluster) in self.matching_clusters(f.endpoint_id, f.cluster_id) {
                for e in &cluster.events {
                    if f.event_id.map_or(true, |id| id == e.id) {
                        out.insert(ConcreteEventPath::new(ep, cluster.id, e.id), None);
                    }
                }
            }
        }
        out
    }
}
