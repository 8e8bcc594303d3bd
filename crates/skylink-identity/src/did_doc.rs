//! DID document model.

use std::collections::BTreeMap;

use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skylink_common::{Did, Handle};
use smol_str::SmolStr;
use url::Url;

/// Service type that names an account's personal data server.
pub const PDS_SERVICE_TYPE: &str = "AtprotoPersonalDataServer";

/// DID Document representation.
///
/// Only the fields identity resolution needs are modeled explicitly. All other
/// fields are captured in `extra_data` for forward compatibility.
///
/// Example
/// ```
/// use skylink_identity::did_doc::DidDocument;
/// use serde_json::json;
/// let doc: DidDocument = serde_json::from_value(json!({
///   "id": "did:plc:alice",
///   "alsoKnownAs": ["at://alice.example"],
///   "service": [{"id":"#atproto_pds","type":"AtprotoPersonalDataServer","serviceEndpoint":"https://pds.example"}]
/// })).unwrap();
/// assert_eq!(doc.id.as_str(), "did:plc:alice");
/// assert!(doc.pds_endpoint().is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[builder(start_fn = new)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    /// Document identifier (e.g., `did:plc:...` or `did:web:...`)
    pub id: Did,

    /// Alternate identifiers for the subject, such as at://<handle>
    #[serde(skip_serializing_if = "Option::is_none")]
    pub also_known_as: Option<Vec<SmolStr>>,

    /// Services associated with this DID (e.g., AtprotoPersonalDataServer)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<Vec<Service>>,

    /// Forward‑compatible capture of unmodeled fields
    #[serde(flatten)]
    #[builder(default)]
    pub extra_data: BTreeMap<SmolStr, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: SmolStr,
    #[serde(rename = "type")]
    pub r#type: SmolStr,
    /// String URL, or an object carrying a `url` field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_endpoint: Option<Value>,
}

impl DidDocument {
    /// Validated handles from `alsoKnownAs` entries like `at://<handle>`, in document order.
    pub fn handles(&self) -> Vec<Handle> {
        self.also_known_as
            .as_ref()
            .map(|v| {
                v.iter()
                    .filter_map(|s| s.strip_prefix("at://"))
                    .filter_map(|h| Handle::new(h).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the document claims `handle`.
    pub fn claims_handle(&self, handle: &Handle) -> bool {
        self.handles().iter().any(|h| h == handle)
    }

    /// The AtprotoPersonalDataServer service endpoint.
    pub fn pds_endpoint(&self) -> Option<Url> {
        self.service.as_ref().and_then(|services| {
            services.iter().find_map(|s| {
                if s.r#type != PDS_SERVICE_TYPE {
                    return None;
                }
                match &s.service_endpoint {
                    Some(Value::String(raw)) => Url::parse(raw).ok(),
                    Some(Value::Object(obj)) => obj
                        .get("url")
                        .and_then(Value::as_str)
                        .and_then(|raw| Url::parse(raw).ok()),
                    _ => None,
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> DidDocument {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn pds_from_string_or_object() {
        let d = doc(json!({
            "id": "did:plc:alice",
            "service": [
                {"id": "#other", "type": "Other", "serviceEndpoint": "https://nope.example"},
                {"id": "#atproto_pds", "type": "AtprotoPersonalDataServer", "serviceEndpoint": "https://pds.example"}
            ]
        }));
        assert_eq!(d.pds_endpoint().unwrap().as_str(), "https://pds.example/");

        let d = doc(json!({
            "id": "did:plc:alice",
            "service": [{"id": "#atproto_pds", "type": "AtprotoPersonalDataServer", "serviceEndpoint": {"url": "https://pds2.example"}}]
        }));
        assert_eq!(d.pds_endpoint().unwrap().host_str(), Some("pds2.example"));
    }

    #[test]
    fn missing_pds() {
        let d = doc(json!({"id": "did:plc:alice"}));
        assert!(d.pds_endpoint().is_none());
    }

    #[test]
    fn handles_skip_invalid_aliases() {
        let d = doc(json!({
            "id": "did:plc:alice",
            "alsoKnownAs": ["https://alice.example", "at://not a handle", "at://Alice.Example"]
        }));
        let handles = d.handles();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].as_str(), "alice.example");
        assert!(d.claims_handle(&Handle::new("alice.example").unwrap()));
    }

    #[test]
    fn unknown_fields_round_trip() {
        let d = doc(json!({
            "id": "did:plc:alice",
            "@context": ["https://www.w3.org/ns/did/v1"],
            "verificationMethod": [{"id": "#atproto", "type": "Multikey"}]
        }));
        assert!(d.extra_data.contains_key("@context"));
        assert!(d.extra_data.contains_key("verificationMethod"));
        let back = serde_json::to_value(&d).unwrap();
        assert!(back.get("@context").is_some());
    }
}
