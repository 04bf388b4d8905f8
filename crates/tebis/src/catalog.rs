//! Point metadata: measurement points, reductions, groups and the optional
//! hierarchy tree.
//!
//! Points and reductions come from the server's `GetConfig` tables. The
//! hierarchy tree and its tree-to-group mapping live in a separate relational
//! store that this crate does not talk to; hosts that have them can attach
//! them with [`PointCatalog::set_tree`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;

use crate::TebisError;
use crate::decode::text::decode_text;
use crate::decode::{ColumnSpec, ColumnTable};
use crate::request::{ConfigObject, Procedure, Request};
use crate::transport::{Transport, send};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Unknown point: {0}")]
    UnknownPoint(PointRef),
    #[error("Point '{0}' requested more than once")]
    DuplicatePoint(String),
    #[error("{0} is unavailable: no hierarchy catalog attached")]
    MetadataUnavailable(&'static str),
    #[error("Point {0} has no non-NaN sample in the lookback window")]
    NoRecentSamples(i64),
}

// ============ Points ============

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PointKind {
    Real,
    Virtual {
        rate_ms: i64,
        formula: String,
        recalculation: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementPoint {
    pub id: i64,
    pub name: String,
    pub unit: String,
    #[serde(rename = "desc")]
    pub description: String,
    #[serde(flatten)]
    pub kind: PointKind,
}

impl MeasurementPoint {
    pub fn real(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            unit: String::new(),
            description: String::new(),
            kind: PointKind::Real,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, PointKind::Virtual { .. })
    }
}

/// How a caller names a point
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PointRef {
    Id(i64),
    Name(String),
}

impl fmt::Display for PointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "#{id}"),
            Self::Name(name) => write!(f, "'{name}'"),
        }
    }
}

impl From<i64> for PointRef {
    fn from(id: i64) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for PointRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for PointRef {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<&MeasurementPoint> for PointRef {
    fn from(point: &MeasurementPoint) -> Self {
        Self::Id(point.id)
    }
}

/// Integers are ids, anything else is a name.
impl FromStr for PointRef {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().parse() {
            Ok(id) => Self::Id(id),
            Err(_) => Self::Name(s.to_string()),
        })
    }
}

// ============ Reductions ============

/// Resolutions (ms) the server keeps reduced data for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReductionCatalog(BTreeSet<i64>);

impl ReductionCatalog {
    pub fn new(resolutions: impl IntoIterator<Item = i64>) -> Self {
        Self(resolutions.into_iter().collect())
    }

    pub fn contains(&self, resolution_ms: i64) -> bool {
        self.0.contains(&resolution_ms)
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What the planner needs to know about points and resolutions.
pub trait MetadataCatalog {
    fn lookup_point(&self, point: &PointRef) -> Option<MeasurementPoint>;
    fn reduction_catalog(&self) -> &ReductionCatalog;
}

// ============ Groups & tree ============

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    #[serde(rename = "desc")]
    pub description: String,
    /// Free-form classification column (`Group1`)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub category: String,
    /// Member point ids; empty for groups loaded from the server tables
    pub members: Vec<i64>,
}

/// Node of the plant hierarchy, serialized as `{id, text, nodes}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    pub id: i64,
    pub text: String,
    pub nodes: Vec<TreeNode>,
}

impl TreeNode {
    pub fn new(id: i64, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            nodes: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: TreeNode) -> Self {
        self.nodes.push(child);
        self
    }

    /// Depth-first search by node id
    pub fn find(&self, id: i64) -> Option<&TreeNode> {
        if self.id == id {
            return Some(self);
        }
        self.nodes.iter().find_map(|node| node.find(id))
    }
}

// ============ Catalog ============

/// In-memory catalog, read-only once loaded
#[derive(Debug, Clone, Default)]
pub struct PointCatalog {
    points: IndexMap<i64, MeasurementPoint>,
    by_name: HashMap<String, i64>,
    reductions: ReductionCatalog,
    groups: Vec<Group>,
    tree: Option<TreeNode>,
    tree_groups: HashMap<i64, Vec<Group>>,
}

impl PointCatalog {
    pub fn new(reductions: ReductionCatalog) -> Self {
        Self {
            reductions,
            ..Self::default()
        }
    }

    pub fn with_points(mut self, points: impl IntoIterator<Item = MeasurementPoint>) -> Self {
        for point in points {
            self.insert(point);
        }
        self
    }

    /// Add or replace a point; a name reused by another id moves to the new point.
    pub fn insert(&mut self, point: MeasurementPoint) {
        if let Some(previous) = self.by_name.insert(point.name.clone(), point.id) {
            if previous != point.id {
                log::warn!(
                    "Point name '{}' is used by ids {previous} and {}; keeping {}",
                    point.name,
                    point.id,
                    point.id
                );
            }
        }
        self.points.insert(point.id, point);
    }

    /// Attach a hierarchy tree and the groups hanging off each tree node.
    pub fn set_tree(&mut self, tree: TreeNode, tree_groups: HashMap<i64, Vec<Group>>) {
        self.tree = Some(tree);
        self.tree_groups = tree_groups;
    }

    pub fn point(&self, point: &PointRef) -> Option<&MeasurementPoint> {
        match point {
            PointRef::Id(id) => self.points.get(id),
            PointRef::Name(name) => self.by_name.get(name).and_then(|id| self.points.get(id)),
        }
    }

    /// Points in load order
    pub fn points(&self) -> impl Iterator<Item = &MeasurementPoint> {
        self.points.values()
    }

    /// Points whose name contains `needle`, ignoring case
    pub fn search<'a>(&'a self, needle: &str) -> impl Iterator<Item = &'a MeasurementPoint> + 'a {
        let needle = needle.to_lowercase();
        self.points
            .values()
            .filter(move |p| p.name.to_lowercase().contains(&needle))
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn reductions(&self) -> &ReductionCatalog {
        &self.reductions
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn tree(&self) -> Result<&TreeNode, CatalogError> {
        self.tree
            .as_ref()
            .ok_or(CatalogError::MetadataUnavailable("hierarchy tree"))
    }

    pub fn tree_json(&self) -> Result<String, TebisError> {
        Ok(serde_json::to_string(self.tree()?)?)
    }

    /// Groups attached to a tree node; empty for nodes without groups.
    pub fn groups_by_tree_id(&self, id: i64) -> Result<&[Group], CatalogError> {
        if self.tree.is_none() {
            return Err(CatalogError::MetadataUnavailable("tree-to-group mapping"));
        }
        Ok(self.tree_groups.get(&id).map_or(&[], Vec::as_slice))
    }

    /// Load reductions, points, virtual points and groups from the server.
    pub fn load<T: Transport + ?Sized>(
        transport: &T,
        config_file: &str,
    ) -> Result<Self, TebisError> {
        let fetch = |object: ConfigObject, columns: &[ColumnSpec]| -> Result<ColumnTable, TebisError> {
            let request = Request::new(config_file, Procedure::GetConfig(object));
            let raw = send(transport, &request)?;
            Ok(decode_text(&raw, columns)?)
        };

        let reductions = fetch(ConfigObject::Reductions, &reduction_columns())?;
        let reductions = ReductionCatalog::new(Rows(&reductions).ints(1));
        let mut catalog = Self::new(reductions);

        let real = fetch(ConfigObject::Points, &point_columns())?;
        let rows = Rows(&real);
        for row in 0..real.rows() {
            catalog.insert(MeasurementPoint {
                id: rows.int(0, row),
                name: rows.text(1, row),
                unit: rows.text(2, row),
                description: rows.text(3, row),
                kind: PointKind::Real,
            });
        }

        let virtuals = fetch(ConfigObject::VirtualPoints, &virtual_point_columns())?;
        let rows = Rows(&virtuals);
        for row in 0..virtuals.rows() {
            catalog.insert(MeasurementPoint {
                id: rows.int(0, row),
                name: rows.text(1, row),
                unit: rows.text(2, row),
                description: rows.text(3, row),
                kind: PointKind::Virtual {
                    rate_ms: rows.int(4, row),
                    formula: rows.text(5, row),
                    recalculation: rows.int(6, row) != 0,
                },
            });
        }

        let groups = fetch(ConfigObject::Groups, &group_columns())?;
        let rows = Rows(&groups);
        catalog.groups = (0..groups.rows())
            .map(|row| Group {
                id: rows.int(0, row),
                name: rows.text(1, row),
                description: rows.text(2, row),
                category: rows.text(3, row),
                members: Vec::new(),
            })
            .collect();

        log::info!(
            "Loaded catalog: {} points ({} virtual), {} groups, reductions {:?}",
            catalog.len(),
            virtuals.rows(),
            catalog.groups.len(),
            catalog.reductions.iter().collect::<Vec<_>>()
        );
        Ok(catalog)
    }
}

impl MetadataCatalog for PointCatalog {
    fn lookup_point(&self, point: &PointRef) -> Option<MeasurementPoint> {
        self.point(point).cloned()
    }

    fn reduction_catalog(&self) -> &ReductionCatalog {
        &self.reductions
    }
}

// ============ GetConfig layouts ============

pub(crate) fn reduction_columns() -> Vec<ColumnSpec> {
    vec![ColumnSpec::integer("ID"), ColumnSpec::integer("Reduction")]
}

pub(crate) fn point_columns() -> Vec<ColumnSpec> {
    let mut columns = vec![
        ColumnSpec::integer("ID"),
        ColumnSpec::text("MSTName"),
        ColumnSpec::text("UNIT"),
        ColumnSpec::text("MSTDesc"),
    ];
    columns.extend((1..=5).map(|i| ColumnSpec::value(format!("Val{i}"))));
    columns
}

pub(crate) fn virtual_point_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::integer("ID"),
        ColumnSpec::text("MSTName"),
        ColumnSpec::text("UNIT"),
        ColumnSpec::text("MSTDesc"),
        ColumnSpec::integer("Rate"),
        ColumnSpec::text("Formula"),
        ColumnSpec::integer("refresh"),
    ]
}

pub(crate) fn group_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::integer("ID"),
        ColumnSpec::text("GrpName"),
        ColumnSpec::text("GroupDesc"),
        ColumnSpec::text("Group1"),
    ]
}

/// Row-wise reads over a decoded metadata table
struct Rows<'t>(&'t ColumnTable);

impl<'t> Rows<'t> {
    fn int(&self, column: usize, row: usize) -> i64 {
        self.0
            .ints(column)
            .and_then(|c| c.get(row))
            .copied()
            .unwrap_or_default()
    }

    fn ints(&self, column: usize) -> impl Iterator<Item = i64> + 't {
        self.0.ints(column).unwrap_or_default().iter().copied()
    }

    fn text(&self, column: usize, row: usize) -> String {
        self.0
            .texts(column)
            .and_then(|c| c.get(row))
            .cloned()
            .unwrap_or_default()
    }
}
