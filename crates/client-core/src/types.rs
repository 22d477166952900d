use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::error::ClientError;

/// Server-owned entity kinds tracked by the cache.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Post,
    UserProfile,
    Message,
    Conversation,
}

/// Field-delta map applied to or captured from an entity.
pub type FieldDeltas = Map<String, Value>;

/// Coerce a JSON value into a field map; non-objects yield an empty map.
pub fn field_map(value: Value) -> FieldDeltas {
    match value {
        Value::Object(map) => map,
        _ => FieldDeltas::new(),
    }
}

/// Cache entry: latest known fields of one server-owned entity.
///
/// Fields are a flat JSON object so shallow merges and inverse deltas
/// work uniformly across kinds; typed accessors convert through serde.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    pub fields: FieldDeltas,
}

impl Entity {
    pub fn new(id: impl Into<String>, kind: EntityKind, fields: FieldDeltas) -> Self {
        Self {
            id: id.into(),
            kind,
            fields,
        }
    }

    /// Build an entity from a typed value; the value's `id` field is
    /// mirrored as the entity id.
    pub fn from_typed<T: Serialize>(
        id: impl Into<String>,
        kind: EntityKind,
        value: &T,
    ) -> Result<Self, ClientError> {
        let fields = serde_json::to_value(value)
            .map_err(|err| ClientError::internal("encode_entity", err.to_string()))?;
        Ok(Self::new(id, kind, field_map(fields)))
    }

    /// Deserialize the field map into a typed view of the entity.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_value(Value::Object(self.fields.clone()))
            .map_err(|err| ClientError::internal("decode_entity", err.to_string()))
    }

    /// Shallow-merge `deltas` over the current fields; unrelated
    /// fields are preserved.
    pub fn merge(&mut self, deltas: &FieldDeltas) {
        for (key, value) in deltas {
            self.fields.insert(key.clone(), value.clone());
        }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Marketplace listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Post {
    pub id: String,
    pub title: String,
    pub seller_id: String,
    #[serde(default)]
    pub price_cents: u64,
    #[serde(default)]
    pub is_liked: bool,
    #[serde(default)]
    pub like_count: i64,
    #[serde(default)]
    pub is_draft: bool,
}

/// Public profile of a marketplace user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// One message inside a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    #[serde(default)]
    pub sent_at_ms: u64,
    #[serde(default)]
    pub is_read: bool,
}

/// Conversation preview row plus thread metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub participant_ids: Vec<String>,
    #[serde(default)]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub last_activity_ms: u64,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub message_count: u64,
}

impl Conversation {
    /// The participant other than `current_user_id`.
    pub fn partner_of(&self, current_user_id: &str) -> Option<&str> {
        self.participant_ids
            .iter()
            .map(String::as_str)
            .find(|id| *id != current_user_id)
    }
}

/// One page of entities decoded from a server list payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityPage {
    pub entities: Vec<Entity>,
    pub ids: Vec<String>,
    pub has_more: bool,
}

/// Decode a `{items: [...], has_more}` payload into cache entities.
///
/// Every item must be an object carrying a string `id`; anything else
/// is a decode failure (the server owns this shape).
pub fn page_from_body(body: &Value, kind: EntityKind) -> Result<EntityPage, ClientError> {
    let items = body
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| ClientError::internal("decode_page", "payload missing 'items' array"))?;
    let has_more = body
        .get("has_more")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut entities = Vec::with_capacity(items.len());
    let mut ids = Vec::with_capacity(items.len());
    for item in items {
        let fields = item
            .as_object()
            .cloned()
            .ok_or_else(|| ClientError::internal("decode_page", "list item is not an object"))?;
        let id = fields
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::internal("decode_page", "list item missing string 'id'"))?
            .to_owned();
        ids.push(id.clone());
        entities.push(Entity::new(id, kind, fields));
    }

    Ok(EntityPage {
        entities,
        ids,
        has_more,
    })
}
