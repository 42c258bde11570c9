//! Coordinator table of contents (`gpbackup_<ts>_toc.yaml`).
//!
//! Metadata entries are byte ranges into the metadata SQL file; data entries
//! describe the tables whose rows were copied out during the backup.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::error::{RestoreError, Result};

/// Catalog object type of a metadata statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ObjectType {
    Schema,
    Table,
    View,
    Sequence,
    SequenceOwner,
    Index,
    Rule,
    Trigger,
    EventTrigger,
    Constraint,
    DefaultPrivileges,
    SessionGucs,
    DatabaseGuc,
    Database,
    Role,
    Statistics,
    Other(String),
}

impl ObjectType {
    pub fn as_str(&self) -> &str {
        match self {
            ObjectType::Schema => "SCHEMA",
            ObjectType::Table => "TABLE",
            ObjectType::View => "VIEW",
            ObjectType::Sequence => "SEQUENCE",
            ObjectType::SequenceOwner => "SEQUENCE OWNER",
            ObjectType::Index => "INDEX",
            ObjectType::Rule => "RULE",
            ObjectType::Trigger => "TRIGGER",
            ObjectType::EventTrigger => "EVENT TRIGGER",
            ObjectType::Constraint => "CONSTRAINT",
            ObjectType::DefaultPrivileges => "DEFAULT PRIVILEGES",
            ObjectType::SessionGucs => "SESSION GUCS",
            ObjectType::DatabaseGuc => "DATABASE GUC",
            ObjectType::Database => "DATABASE",
            ObjectType::Role => "ROLE",
            ObjectType::Statistics => "STATISTICS",
            ObjectType::Other(s) => s,
        }
    }

    /// Tables, views and sequences are matched against relation filters by their own name.
    pub fn is_relation(&self) -> bool {
        matches!(
            self,
            ObjectType::Table | ObjectType::View | ObjectType::Sequence
        )
    }
}

impl From<&str> for ObjectType {
    fn from(s: &str) -> Self {
        match s {
            "SCHEMA" => ObjectType::Schema,
            "TABLE" => ObjectType::Table,
            "VIEW" => ObjectType::View,
            "SEQUENCE" => ObjectType::Sequence,
            "SEQUENCE OWNER" => ObjectType::SequenceOwner,
            "INDEX" => ObjectType::Index,
            "RULE" => ObjectType::Rule,
            "TRIGGER" => ObjectType::Trigger,
            "EVENT TRIGGER" => ObjectType::EventTrigger,
            "CONSTRAINT" => ObjectType::Constraint,
            "DEFAULT PRIVILEGES" => ObjectType::DefaultPrivileges,
            "SESSION GUCS" => ObjectType::SessionGucs,
            "DATABASE GUC" => ObjectType::DatabaseGuc,
            "DATABASE" => ObjectType::Database,
            "ROLE" => ObjectType::Role,
            "STATISTICS" => ObjectType::Statistics,
            other => ObjectType::Other(other.to_string()),
        }
    }
}

impl From<String> for ObjectType {
    fn from(s: String) -> Self {
        ObjectType::from(s.as_str())
    }
}

impl From<ObjectType> for String {
    fn from(t: ObjectType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Global,
    Predata,
    Postdata,
    Statistics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "objecttype")]
    pub object_type: ObjectType,
    #[serde(rename = "referenceobject", default)]
    pub reference_object: String,
    #[serde(rename = "startbyte")]
    pub start_byte: u64,
    #[serde(rename = "endbyte")]
    pub end_byte: u64,
}

/// One table's data as recorded by the backup coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorDataEntry {
    pub schema: String,
    pub name: String,
    pub oid: u32,
    #[serde(rename = "attributestring", default)]
    pub attribute_string: String,
    #[serde(rename = "rowscopied", default)]
    pub rows_copied: i64,
    #[serde(rename = "partitionroot", default)]
    pub partition_root: String,
    #[serde(rename = "distributionpolicy", default)]
    pub distribution_policy: String,
}

impl CoordinatorDataEntry {
    pub fn fqn(&self) -> String {
        make_fqn(&self.schema, &self.name)
    }

    /// Target table name, with the schema replaced when restoring into another schema.
    pub fn target_fqn(&self, redirect_schema: Option<&str>) -> String {
        match redirect_schema {
            Some(schema) if !schema.is_empty() => make_fqn(schema, &self.name),
            _ => self.fqn(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AoEntry {
    pub modcount: i64,
    #[serde(rename = "lastddltimestamp", default)]
    pub last_ddl_timestamp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalEntries {
    #[serde(default)]
    pub ao: BTreeMap<String, AoEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toc {
    #[serde(rename = "globalentries")]
    pub global_entries: Vec<MetadataEntry>,
    #[serde(rename = "predataentries")]
    pub predata_entries: Vec<MetadataEntry>,
    #[serde(rename = "postdataentries")]
    pub postdata_entries: Vec<MetadataEntry>,
    #[serde(rename = "statisticsentries")]
    pub statistics_entries: Vec<MetadataEntry>,
    #[serde(rename = "dataentries")]
    pub data_entries: Vec<CoordinatorDataEntry>,
    #[serde(rename = "incrementalmetadata")]
    pub incremental_metadata: IncrementalEntries,
}

/// A DDL statement sliced out of the metadata file, with the TOC fields that
/// filters and the postdata batcher look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementWithType {
    pub schema: String,
    pub name: String,
    pub object_type: ObjectType,
    pub reference_object: String,
    pub statement: String,
}

impl StatementWithType {
    pub fn fqn(&self) -> String {
        make_fqn(&self.schema, &self.name)
    }
}

/// Include or exclude list; an empty list matches everything.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    set: HashSet<String>,
    is_exclude: bool,
}

impl FilterSet {
    pub fn include<S: AsRef<str>>(items: &[S]) -> Self {
        Self {
            set: items.iter().map(|s| s.as_ref().to_string()).collect(),
            is_exclude: false,
        }
    }

    pub fn exclude<S: AsRef<str>>(items: &[S]) -> Self {
        Self {
            set: items.iter().map(|s| s.as_ref().to_string()).collect(),
            is_exclude: true,
        }
    }

    /// Include set when `include` is non-empty, otherwise exclude set.
    pub fn from_lists<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Self {
        if include.is_empty() {
            Self::exclude(exclude)
        } else {
            Self::include(include)
        }
    }

    pub fn is_exclude(&self) -> bool {
        self.is_exclude
    }

    pub fn matches(&self, item: &str) -> bool {
        if self.set.is_empty() {
            return true;
        }
        self.set.contains(item) != self.is_exclude
    }
}

/// User filters applied to metadata statements and data entries.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    pub include_object_types: Vec<ObjectType>,
    pub exclude_object_types: Vec<ObjectType>,
    pub include_schemas: Vec<String>,
    pub exclude_schemas: Vec<String>,
    pub include_relations: Vec<String>,
    pub exclude_relations: Vec<String>,
}

impl Filters {
    pub fn object_types(include: Vec<ObjectType>, exclude: Vec<ObjectType>) -> Self {
        Self {
            include_object_types: include,
            exclude_object_types: exclude,
            ..Default::default()
        }
    }

    fn object_set(&self) -> FilterSet {
        let include: Vec<&str> = self.include_object_types.iter().map(|t| t.as_str()).collect();
        let exclude: Vec<&str> = self.exclude_object_types.iter().map(|t| t.as_str()).collect();
        FilterSet::from_lists(&include, &exclude)
    }

    fn should_include(
        entry: &MetadataEntry,
        objects: &FilterSet,
        schemas: &FilterSet,
        relations: &FilterSet,
    ) -> bool {
        let fqn = make_fqn(&entry.schema, &entry.name);
        let reference = entry.reference_object.as_str();
        let is_sequence_owner = entry.object_type == ObjectType::SequenceOwner;

        let relation_ok = (relations.is_exclude()
            && !entry.object_type.is_relation()
            && reference.is_empty())
            || (entry.object_type.is_relation() && relations.matches(&fqn) && reference.is_empty())
            || (!is_sequence_owner && !reference.is_empty() && relations.matches(reference))
            || (is_sequence_owner && relations.matches(&fqn) && relations.matches(reference));

        objects.matches(entry.object_type.as_str()) && schemas.matches(&entry.schema) && relation_ok
    }
}

pub fn make_fqn(schema: &str, name: &str) -> String {
    format!("{}.{}", schema, name)
}

impl Toc {
    pub fn read_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RestoreError::InvalidManifest(format!("Cannot read TOC {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&contents)
            .map_err(|e| RestoreError::InvalidManifest(format!("{}: {}", path.display(), e)))
    }

    pub fn entries(&self, section: Section) -> &[MetadataEntry] {
        match section {
            Section::Global => &self.global_entries,
            Section::Predata => &self.predata_entries,
            Section::Postdata => &self.postdata_entries,
            Section::Statistics => &self.statistics_entries,
        }
    }

    /// Reads the statements of `section` from `metadata_file`, keeping those
    /// that pass `filters`.
    pub fn statements_for_section(
        &self,
        section: Section,
        metadata_file: &Path,
        filters: &Filters,
    ) -> Result<Vec<StatementWithType>> {
        let file = std::fs::File::open(metadata_file)?;
        let file_len = file.metadata()?.len();
        let objects = filters.object_set();
        let schemas = FilterSet::from_lists(&filters.include_schemas, &filters.exclude_schemas);
        let relations =
            FilterSet::from_lists(&filters.include_relations, &filters.exclude_relations);

        let mut statements = Vec::new();
        for entry in self.entries(section) {
            if !Filters::should_include(entry, &objects, &schemas, &relations) {
                continue;
            }
            if entry.end_byte < entry.start_byte {
                return Err(RestoreError::InvalidManifest(format!(
                    "metadata entry {} has end byte {} before start byte {}",
                    make_fqn(&entry.schema, &entry.name),
                    entry.end_byte,
                    entry.start_byte
                )));
            }
            if entry.end_byte > file_len {
                return Err(RestoreError::InvalidManifest(format!(
                    "metadata entry {} ends at byte {} past the end of {} ({} bytes)",
                    make_fqn(&entry.schema, &entry.name),
                    entry.end_byte,
                    metadata_file.display(),
                    file_len
                )));
            }
            let mut contents = vec![0u8; (entry.end_byte - entry.start_byte) as usize];
            file.read_exact_at(&mut contents, entry.start_byte)
                .map_err(|e| {
                    RestoreError::InvalidManifest(format!(
                        "Cannot read {} bytes at offset {} of {}: {}",
                        contents.len(),
                        entry.start_byte,
                        metadata_file.display(),
                        e
                    ))
                })?;
            statements.push(StatementWithType {
                schema: entry.schema.clone(),
                name: entry.name.clone(),
                object_type: entry.object_type.clone(),
                reference_object: entry.reference_object.clone(),
                statement: String::from_utf8_lossy(&contents).into_owned(),
            });
        }
        Ok(statements)
    }

    /// Leaves whose partition root is one of `table_fqns`.
    fn leaf_partitions(&self, table_fqns: &[String]) -> Vec<String> {
        let tables = FilterSet::include(table_fqns);
        self.data_entries
            .iter()
            .filter(|e| !e.partition_root.is_empty())
            .filter(|e| tables.matches(&make_fqn(&e.schema, &e.partition_root)))
            .map(CoordinatorDataEntry::fqn)
            .collect()
    }

    /// Data entries passing the schema and relation filters and belonging to
    /// `restore_plan_fqns` (an empty plan list admits every table).
    pub fn data_entries_matching(
        &self,
        filters: &Filters,
        restore_plan_fqns: &[String],
    ) -> Vec<CoordinatorDataEntry> {
        let schemas = FilterSet::from_lists(&filters.include_schemas, &filters.exclude_schemas);
        let tables = if !filters.include_relations.is_empty() {
            let mut fqns = filters.include_relations.clone();
            fqns.extend(self.leaf_partitions(&filters.include_relations));
            FilterSet::include(&fqns)
        } else {
            let mut fqns = filters.exclude_relations.clone();
            fqns.extend(self.leaf_partitions(&filters.exclude_relations));
            FilterSet::exclude(&fqns)
        };
        let plan = FilterSet::include(restore_plan_fqns);

        self.data_entries
            .iter()
            .filter(|e| {
                let fqn = e.fqn();
                schemas.matches(&e.schema) && tables.matches(&fqn) && plan.matches(&fqn)
            })
            .cloned()
            .collect()
    }

    /// Partition roots of the included leaf tables, so their DDL is restored too.
    pub fn included_partition_roots(&self, include_relations: &[String]) -> Vec<String> {
        if include_relations.is_empty() {
            return Vec::new();
        }
        let roots: BTreeMap<String, String> = self
            .data_entries
            .iter()
            .filter(|e| !e.partition_root.is_empty())
            .map(|e| (e.fqn(), make_fqn(&e.schema, &e.partition_root)))
            .collect();
        include_relations
            .iter()
            .filter_map(|fqn| roots.get(fqn).cloned())
            .collect()
    }

    /// AO incremental metadata as seen by a database of `db_major` version.
    ///
    /// From version 7 partition roots hold no storage of their own and are
    /// left out unless `include_partition_root` is set.
    pub fn ao_incremental_metadata(
        &self,
        db_major: u32,
        include_partition_root: bool,
    ) -> BTreeMap<String, AoEntry> {
        let ao = &self.incremental_metadata.ao;
        if db_major < 7 || include_partition_root {
            return ao.clone();
        }
        let roots: HashSet<String> = self
            .data_entries
            .iter()
            .filter(|e| !e.partition_root.is_empty())
            .map(|e| make_fqn(&e.schema, &e.partition_root))
            .collect();
        ao.iter()
            .filter(|(fqn, _)| !roots.contains(*fqn))
            .map(|(fqn, entry)| (fqn.clone(), entry.clone()))
            .collect()
    }
}
