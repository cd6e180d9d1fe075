//! Sales domain events and the queue/key names they travel under.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Queue carrying sales domain events.
pub const SALES_EVENTS_QUEUE: &str = "sales_events";

/// Coarse cache key for the sales listing. Any write event evicts it.
pub const SALES_LIST_KEY: &str = "sales:list";

/// Key for one cached listing page.
///
/// The invalidation pipeline never evicts these; they age out by TTL.
pub fn sales_page_key(page: u32, limit: u32) -> String {
    format!("{}:{}:{}", SALES_LIST_KEY, page, limit)
}

/// Recognized sales event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaleEventKind {
    SaleAdded,
    SaleUpdated,
    SaleDeleted,
}

impl SaleEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaleEventKind::SaleAdded => "sale_added",
            SaleEventKind::SaleUpdated => "sale_updated",
            SaleEventKind::SaleDeleted => "sale_deleted",
        }
    }

    pub fn parse(event_type: &str) -> Option<Self> {
        match event_type {
            "sale_added" => Some(SaleEventKind::SaleAdded),
            "sale_updated" => Some(SaleEventKind::SaleUpdated),
            "sale_deleted" => Some(SaleEventKind::SaleDeleted),
            _ => None,
        }
    }
}

/// `{"type": ..., ...fields}` as carried on the wire.
///
/// The type is kept as a string so events of unknown types still parse;
/// everything besides `type` is opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl DomainEvent {
    pub fn new(kind: SaleEventKind) -> Self {
        Self {
            event_type: kind.as_str().to_string(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn sale_added(sale: Value) -> Self {
        Self::new(SaleEventKind::SaleAdded).with_field("sale", sale)
    }

    pub fn sale_updated(sale: Value) -> Self {
        Self::new(SaleEventKind::SaleUpdated).with_field("sale", sale)
    }

    pub fn sale_deleted(sale_id: Value) -> Self {
        Self::new(SaleEventKind::SaleDeleted).with_field("saleId", sale_id)
    }
}

/// Recognized kind of a raw event payload.
///
/// Only invalid JSON is an error. Any JSON value without a recognized string
/// `type` yields `None`.
pub fn event_kind(payload: &[u8]) -> serde_json::Result<Option<SaleEventKind>> {
    let value: Value = serde_json::from_slice(payload)?;
    Ok(value
        .get("type")
        .and_then(Value::as_str)
        .and_then(SaleEventKind::parse))
}
