//! Property relations
//!
//! Every mapped property of a prototype is described by one [`Relation`]:
//! a plain column, a reference to another object, or a collection of child
//! objects. The kind is a closed set, see [`RelationKind`].

use crate::core::{MappingError, Result};
use crate::mapping::properties::TypeProperties;

/// Placeholder for "the id column of the mapping on this side"
pub const ID_PLACEHOLDER: &str = "$id";

/// What a property is mapped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    /// Value stored in a column of the own table
    Primitive,
    /// Reference to another object through a single local column
    Reference,
    /// Reference that can't be resolved from a single own column; fetched
    /// with a separate query
    ComplexReference,
    /// Ordered child collection
    Collection,
    /// Child collection partitioned into virtual group nodes
    GroupBy,
}

impl RelationKind {
    /// Rank in the column ownership table, lower wins. Kinds that don't
    /// claim a column of the own table have no rank.
    ///
    /// | kind             | rank |
    /// |------------------|------|
    /// | Primitive        | 0    |
    /// | Reference        | 1    |
    /// | ComplexReference | -    |
    /// | Collection       | -    |
    /// | GroupBy          | -    |
    pub fn column_rank(self) -> Option<u8> {
        match self {
            RelationKind::Primitive => Some(0),
            RelationKind::Reference => Some(1),
            RelationKind::ComplexReference | RelationKind::Collection | RelationKind::GroupBy => {
                None
            }
        }
    }

    pub fn is_primitive(self) -> bool {
        self == RelationKind::Primitive
    }

    /// Reference of either flavor
    pub fn is_reference(self) -> bool {
        matches!(self, RelationKind::Reference | RelationKind::ComplexReference)
    }

    /// Collection, grouped or not
    pub fn is_collection(self) -> bool {
        matches!(self, RelationKind::Collection | RelationKind::GroupBy)
    }
}

/// Join condition between the home table and the other table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    /// Column on the home side, or [`ID_PLACEHOLDER`]
    pub local: String,
    /// Column on the other side, or [`ID_PLACEHOLDER`]
    pub foreign: String,
}

impl Constraint {
    pub fn new(local: impl Into<String>, foreign: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            foreign: foreign.into(),
        }
    }

    /// Whether the local side is the home id column
    pub fn local_is_id(&self) -> bool {
        is_id_placeholder(&self.local)
    }

    /// Whether the foreign side is the other id column
    pub fn foreign_is_id(&self) -> bool {
        is_id_placeholder(&self.foreign)
    }
}

/// Check for the id placeholder, accepting the `_id` spelling too
pub fn is_id_placeholder(column: &str) -> bool {
    column == ID_PLACEHOLDER || column.eq_ignore_ascii_case("_id")
}

/// Grouping of a collection into virtual group nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupBy {
    /// Column whose distinct values name the groups
    pub column: String,
    /// Ordering of the groups
    pub order: Option<String>,
    /// Prototype of the group nodes
    pub prototype: Option<String>,
}

/// Mapping rule of one property
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub prop_name: String,
    /// Column in the own table, for primitives and simple references
    pub column_name: Option<String>,
    pub kind: RelationKind,
    /// Prototype of referenced or child objects
    pub target: Option<String>,
    /// Collection that is a virtual mount point rather than stored rows
    pub mountpoint: bool,
    pub readonly: bool,
    pub private: bool,
    /// Reference fetched through an outer join of the owner's select
    pub aggressive: bool,
    pub constraints: Vec<Constraint>,
    /// Column whose value names children for by-name access
    pub accessname: Option<String>,
    pub filter: Option<String>,
    pub additional_tables: Option<String>,
    pub order: Option<String>,
    pub group: Option<GroupBy>,
    /// Restriction to one group: (group column, group value)
    pub group_value: Option<(String, String)>,
    pub max_size: Option<usize>,
    pub offset: usize,
    pub query_hints: Option<String>,
}

impl Relation {
    fn base(prop_name: &str, kind: RelationKind) -> Self {
        Self {
            prop_name: prop_name.to_string(),
            column_name: None,
            kind,
            target: None,
            mountpoint: false,
            readonly: false,
            private: false,
            aggressive: false,
            constraints: Vec::new(),
            accessname: None,
            filter: None,
            additional_tables: None,
            order: None,
            group: None,
            group_value: None,
            max_size: None,
            offset: 0,
            query_hints: None,
        }
    }

    /// Primitive relation of `prop_name` to `column`
    pub fn primitive(prop_name: &str, column: &str) -> Self {
        let mut rel = Self::base(prop_name, RelationKind::Primitive);
        rel.column_name = Some(column.to_string());
        rel
    }

    /// Parse the declaration `prop_name = value` of `prototype`, reading
    /// sub-keys (`prop_name.local`, ...) from `props`
    pub fn parse(
        prototype: &str,
        prop_name: &str,
        value: &str,
        props: &TypeProperties,
    ) -> Result<Relation> {
        let value = value.trim();
        let invalid = |reason: String| MappingError::InvalidRelation {
            prototype: prototype.to_string(),
            property: prop_name.to_string(),
            reason,
        };
        let sub = |suffix: &str| props.get(&format!("{}.{}", prop_name, suffix));

        let mut rel = if let Some(target) = wrapped(value, "object") {
            let mut rel = Self::base(prop_name, RelationKind::Reference);
            rel.target = Some(target.to_string());
            rel
        } else if let Some(target) = wrapped(value, "collection") {
            let mut rel = Self::base(prop_name, RelationKind::Collection);
            rel.target = Some(target.to_string());
            rel
        } else if let Some(target) = wrapped(value, "mountpoint") {
            let mut rel = Self::base(prop_name, RelationKind::Collection);
            rel.target = Some(target.to_string());
            rel.mountpoint = true;
            rel
        } else if value.is_empty() || value.contains(|c: char| c == '(' || c == ')' || c.is_whitespace()) {
            return Err(invalid(format!("can't interpret {:?}", value)).into());
        } else {
            Self::primitive(prop_name, value)
        };

        if rel.target.as_deref().map_or(false, |t| t.trim().is_empty()) {
            return Err(invalid("missing prototype".to_string()).into());
        }

        rel.readonly = props.flag(&format!("{}.readonly", prop_name));
        rel.private = props.flag(&format!("{}.private", prop_name));
        rel.aggressive = matches!(sub("loadmode"), Some(m) if m.eq_ignore_ascii_case("aggressive"));

        if rel.kind == RelationKind::Primitive {
            return Ok(rel);
        }

        rel.constraints = parse_constraints(props, prop_name).map_err(invalid)?;

        if rel.kind == RelationKind::Reference {
            match rel.constraints.len() {
                0 => return Err(invalid("reference without .local constraint".to_string()).into()),
                1 if !rel.constraints[0].local_is_id() => {
                    rel.column_name = Some(rel.constraints[0].local.clone());
                }
                _ => rel.kind = RelationKind::ComplexReference,
            }
            return Ok(rel);
        }

        rel.accessname = sub("accessname").map(str::to_string);
        rel.filter = sub("filter").map(str::to_string);
        rel.additional_tables = sub("filter.additionalTables").map(str::to_string);
        rel.order = sub("order").map(str::to_string);
        rel.query_hints = sub("hints").map(str::to_string);
        rel.max_size = match sub("maxsize") {
            Some(text) => Some(
                text.parse()
                    .map_err(|_| invalid(format!("invalid maxsize {:?}", text)))?,
            ),
            None => None,
        };

        if let Some(column) = sub("group") {
            rel.kind = RelationKind::GroupBy;
            rel.group = Some(GroupBy {
                column: column.to_string(),
                order: sub("group.order").map(str::to_string),
                prototype: sub("group.prototype").map(str::to_string),
            });
        }

        Ok(rel)
    }

    /// Collection of the children in group `value`
    pub fn for_group(&self, value: &str) -> Relation {
        let mut rel = self.clone();
        if let Some(group) = rel.group.take() {
            rel.group_value = Some((group.column, value.to_string()));
        }
        rel.kind = RelationKind::Collection;
        rel
    }

    /// Same relation restricted to `length` rows starting at `offset`
    pub fn window(&self, offset: usize, length: usize) -> Relation {
        let mut rel = self.clone();
        rel.offset = offset;
        rel.max_size = Some(length);
        rel
    }

    /// Whether this relation claims `column` of the own table
    pub fn claims_column(&self) -> bool {
        self.column_name.is_some() && self.kind.column_rank().is_some()
    }
}

fn wrapped<'a>(value: &'a str, function: &str) -> Option<&'a str> {
    let lower = value.to_ascii_lowercase();
    if lower.starts_with(&format!("{}(", function)) && value.ends_with(')') {
        Some(value[function.len() + 1..value.len() - 1].trim())
    } else {
        None
    }
}

fn parse_constraints(
    props: &TypeProperties,
    prop_name: &str,
) -> std::result::Result<Vec<Constraint>, String> {
    let mut constraints = Vec::new();

    let local = props.get(&format!("{}.local", prop_name));
    let foreign = props.get(&format!("{}.foreign", prop_name));
    if local.is_some() || foreign.is_some() {
        constraints.push(Constraint::new(
            local.unwrap_or(ID_PLACEHOLDER),
            foreign.unwrap_or(ID_PLACEHOLDER),
        ));
    }

    for n in 1.. {
        let local = props.get(&format!("{}.local.{}", prop_name, n));
        let foreign = props.get(&format!("{}.foreign.{}", prop_name, n));
        match (local, foreign) {
            (Some(l), Some(f)) => constraints.push(Constraint::new(l, f)),
            (None, None) => break,
            _ => return Err(format!("constraint {} needs both .local and .foreign", n)),
        }
    }

    Ok(constraints)
}
