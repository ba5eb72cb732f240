//! Extracted records and the identifiers used to correlate them.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Field holding the record's display name.
pub const NAME_FIELD: &str = "name";

/// Field holding the record's stable id.
pub const STABLE_ID_FIELD: &str = "alterID";

/// Kind of accounting master carried by a record batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityType {
    /// Account group.
    Group,
    /// Ledger account.
    Ledger,
    /// Inventory stock item.
    StockItem,
    /// Stock group.
    StockGroup,
    /// Stock category.
    StockCategory,
    /// Voucher type.
    VoucherType,
    /// Unit of measure.
    Unit,
    /// Cost center.
    CostCenter,
    /// Cost category.
    CostCategory,
    /// Currency.
    Currency,
    /// Warehouse.
    Godown,
    /// Tax unit.
    TaxUnit,
    /// Any entity type without dedicated handling.
    Other(String),
}

impl EntityType {
    /// Returns the canonical name of this entity type.
    pub fn as_str(&self) -> &str {
        match self {
            EntityType::Group => "Group",
            EntityType::Ledger => "Ledger",
            EntityType::StockItem => "StockItem",
            EntityType::StockGroup => "StockGroup",
            EntityType::StockCategory => "StockCategory",
            EntityType::VoucherType => "VoucherType",
            EntityType::Unit => "Unit",
            EntityType::CostCenter => "CostCenter",
            EntityType::CostCategory => "CostCategory",
            EntityType::Currency => "Currency",
            EntityType::Godown => "Godown",
            EntityType::TaxUnit => "TaxUnit",
            EntityType::Other(name) => name,
        }
    }

    /// Returns the backend ingestion endpoint for this entity type.
    pub fn endpoint(&self) -> String {
        let path = match self {
            EntityType::Group => "groups",
            EntityType::Ledger => "ledgers",
            EntityType::StockItem => "stock-items",
            EntityType::StockGroup => "stock-groups",
            EntityType::StockCategory => "stock-categories",
            EntityType::VoucherType => "voucher-types",
            EntityType::Unit => "units",
            EntityType::CostCenter => "cost-centers",
            EntityType::CostCategory => "cost-categories",
            EntityType::Currency => "currencies",
            EntityType::Godown => "godowns",
            EntityType::TaxUnit => "tax-units",
            EntityType::Other(name) => return format!("/sync/{}", name.to_lowercase()),
        };
        format!("/sync/{path}")
    }

    /// Returns the key under which records travel in an ingestion payload.
    pub fn payload_key(&self) -> String {
        self.as_str().to_lowercase()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Group" => EntityType::Group,
            "Ledger" => EntityType::Ledger,
            "StockItem" => EntityType::StockItem,
            "StockGroup" | "STOCKGROUP" => EntityType::StockGroup,
            "StockCategory" => EntityType::StockCategory,
            "VoucherType" => EntityType::VoucherType,
            "Unit" => EntityType::Unit,
            "CostCenter" => EntityType::CostCenter,
            "CostCategory" => EntityType::CostCategory,
            "Currency" => EntityType::Currency,
            "Godown" => EntityType::Godown,
            "TaxUnit" => EntityType::TaxUnit,
            other => EntityType::Other(other.to_string()),
        })
    }
}

impl From<String> for EntityType {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(entity_type) => entity_type,
            Err(never) => match never {},
        }
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        value.as_str().to_string()
    }
}

/// Identifier assumed persistent across extractions.
///
/// Numeric and textual ids normalize to the same textual form, so `7` and
/// `"7"` correlate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableId(String);

impl StableId {
    /// Creates a stable id from its textual form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Extracts a stable id from a JSON value. Null, bool, arrays and
    /// objects carry no id.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(Self(n.to_string())),
            Value::String(s) => Some(Self(s.clone())),
            _ => None,
        }
    }

    /// Returns the textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for StableId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for StableId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A single extracted record: a JSON object with entity-specific fields.
///
/// Keys are kept sorted, so the serialized form is canonical and
/// [`Record::content_hash`] is independent of field insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Creates a record carrying a stable id and a name.
    pub fn named(stable_id: impl Into<Value>, name: impl Into<String>) -> Self {
        Self::new()
            .with(STABLE_ID_FIELD, stable_id)
            .with(NAME_FIELD, name.into())
    }

    /// Creates a record from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> ProtocolResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(ProtocolError::invalid_structure(format!(
                "expected object for record, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Parses a JSON array of record objects.
    pub fn parse_batch(json: &str) -> ProtocolResult<Vec<Record>> {
        let value: Value = serde_json::from_str(json)?;
        match value {
            Value::Array(items) => items.into_iter().map(Record::from_value).collect(),
            other => Err(ProtocolError::invalid_structure(format!(
                "expected array of records, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Sets a field, returning the record.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Sets a field in place.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    /// Removes a field.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Returns a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Returns true if the field is present and not null.
    pub fn has_field(&self, field: &str) -> bool {
        self.0.get(field).is_some_and(|v| !v.is_null())
    }

    /// Returns the record's name, if it is a string.
    pub fn name(&self) -> Option<&str> {
        self.0.get(NAME_FIELD).and_then(Value::as_str)
    }

    /// Returns the record's stable id.
    pub fn stable_id(&self) -> Option<StableId> {
        self.0.get(STABLE_ID_FIELD).and_then(StableId::from_value)
    }

    /// Returns the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Returns the number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// SHA-256 over the canonical JSON encoding.
    pub fn content_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        // Serializing a string-keyed map cannot fail.
        let bytes = serde_json::to_vec(&self.0).unwrap_or_default();
        hasher.update(&bytes);
        hasher.finalize().into()
    }

    /// Lowercase hex form of [`Record::content_hash`].
    pub fn content_hash_hex(&self) -> String {
        self.content_hash()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Extracted records keyed by entity type, in deterministic order.
pub type MasterData = BTreeMap<EntityType, Vec<Record>>;

/// All records extracted for one tenant in one pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantRecordSet {
    /// Tenant label the records were extracted for.
    pub tenant: String,
    /// Records per entity type.
    pub batches: MasterData,
}

impl TenantRecordSet {
    /// Creates an empty record set for a tenant.
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            batches: MasterData::new(),
        }
    }

    /// Creates a record set from extracted master data.
    pub fn from_master_data(tenant: impl Into<String>, batches: MasterData) -> Self {
        Self {
            tenant: tenant.into(),
            batches,
        }
    }

    /// Adds a batch, returning the set.
    pub fn with_batch(mut self, entity_type: EntityType, records: Vec<Record>) -> Self {
        self.batches.insert(entity_type, records);
        self
    }

    /// Returns the records of one entity type.
    pub fn records(&self, entity_type: &EntityType) -> &[Record] {
        self.batches
            .get(entity_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Total number of records across all entity types.
    pub fn total_records(&self) -> usize {
        self.batches.values().map(Vec::len).sum()
    }

    /// Returns true if no batch holds any record.
    pub fn is_empty(&self) -> bool {
        self.total_records() == 0
    }
}

/// A tenant as listed by the tenant directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    /// Backend identifier.
    #[serde(deserialize_with = "id_from_any")]
    pub id: String,
    /// Tenant label as known to the accounting engine.
    pub name: String,
    /// When the tenant was last synced, if ever.
    #[serde(default)]
    pub last_sync_date: Option<String>,
    /// Backend-reported sync status.
    #[serde(default)]
    pub sync_status: Option<String>,
}

impl Tenant {
    /// Creates a tenant that has never been synced.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            last_sync_date: None,
            sync_status: None,
        }
    }

    /// Sets the last sync date.
    pub fn with_last_sync_date(mut self, date: impl Into<String>) -> Self {
        self.last_sync_date = Some(date.into());
        self
    }
}

fn id_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    StableId::from_value(&value)
        .map(|id| id.0)
        .ok_or_else(|| serde::de::Error::custom("tenant id must be a string or number"))
}
