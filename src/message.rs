use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::SystemTime;
use uuid::Uuid;

/// A published message.
///
/// Fields are read-only once the message leaves the publisher; every delivered copy
/// is an independent clone owned by its destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: Uuid,

    /// Opaque payload. Body-scoped filter policies parse it as JSON.
    body: Bytes,

    /// User defined attributes in form of key-value pairs.
    /// Attribute-scoped filter policies are evaluated against these.
    attributes: HashMap<String, String>,

    /// Partition key for ordered topics.
    group_id: Option<String>,

    /// Explicit deduplication key. Ordered topics derive one from the body when absent.
    dedup_key: Option<String>,

    published_at: SystemTime,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Message {
            id: Uuid::new_v4(),
            body: body.into(),
            attributes: HashMap::new(),
            group_id: None,
            dedup_key: None,
            published_at: SystemTime::now(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_dedup_key(mut self, dedup_key: impl Into<String>) -> Self {
        self.dedup_key = Some(dedup_key.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    pub fn dedup_key(&self) -> Option<&str> {
        self.dedup_key.as_deref()
    }

    pub fn published_at(&self) -> SystemTime {
        self.published_at
    }

    /// Fixes the publish timestamp and the effective dedup key as the broker accepts the message.
    pub(crate) fn stamp(mut self, published_at: SystemTime, dedup_key: Option<String>) -> Self {
        self.published_at = published_at;
        if dedup_key.is_some() {
            self.dedup_key = dedup_key;
        }
        self
    }
}

/// Shape of a publish request as handed over by a front door.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub body: String,

    #[serde(default)]
    pub attributes: HashMap<String, String>,

    #[serde(default)]
    pub group_id: Option<String>,

    #[serde(default)]
    pub dedup_key: Option<String>,
}

impl From<PublishRequest> for Message {
    fn from(request: PublishRequest) -> Message {
        let mut message = Message::new(request.body);
        message.attributes = request.attributes;
        message.group_id = request.group_id;
        message.dedup_key = request.dedup_key;
        message
    }
}
