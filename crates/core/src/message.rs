//! The `Message` resource: a header and body that the controller delivers once.

use serde::{Deserialize, Serialize};

use crate::{Object, ObjectMeta};

pub const API_VERSION: &str = "herald.dev/v1alpha1";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: MessageSpec,
    #[serde(default)]
    pub status: MessageStatus,
}

/// Desired state, set by the owner. Never written by the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageSpec {
    #[serde(default)]
    pub header: String,
    #[serde(default)]
    pub body: String,
}

/// Observed state, written only by the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageStatus {
    #[serde(default)]
    pub sent: bool,
}

impl Message {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        header: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            metadata: ObjectMeta { namespace: namespace.into(), name: name.into(), ..Default::default() },
            spec: MessageSpec { header: header.into(), body: body.into() },
            status: MessageStatus::default(),
        }
    }

    /// Rendered payload: header and body on separate lines.
    pub fn note(&self) -> String {
        format!("{}\n{}", self.spec.header, self.spec.body)
    }
}

impl Object for Message {
    type Status = MessageStatus;

    const KIND: &'static str = "Message";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn status(&self) -> &MessageStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut MessageStatus {
        &mut self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_api_object_and_ignores_envelope_fields() {
        let raw = serde_json::json!({
            "apiVersion": API_VERSION,
            "kind": "Message",
            "metadata": {
                "name": "m1",
                "namespace": "default",
                "uid": "6f1c1a52-2b0e-4f7e-9d7a-2f3c1b0d9e11",
                "resourceVersion": "42",
                "managedFields": [],
            },
            "spec": { "header": "H", "body": "B" },
        });
        let m: Message = serde_json::from_value(raw).unwrap();
        assert_eq!(m.metadata.name, "m1");
        assert_eq!(m.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(m.note(), "H\nB");
        // status absent on fresh objects
        assert!(!m.status.sent);
    }

    #[test]
    fn encodes_kubernetes_field_names() {
        let mut m = Message::new("default", "m1", "H", "B");
        m.metadata.resource_version = Some("7".into());
        m.status.sent = true;
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["metadata"]["resourceVersion"], "7");
        assert_eq!(v["status"]["sent"], true);
        assert!(v["metadata"].get("labels").is_none());
    }
}
