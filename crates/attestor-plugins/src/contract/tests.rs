//! Unit tests for the base capability contract.

use std::collections::BTreeMap;
use std::sync::Arc;

use rstest::rstest;
use serde_json::Value;

use super::*;

struct FakePlugin;

impl Pluggable for FakePlugin {
    fn name(&self) -> String {
        "psa-evidence".into()
    }

    fn attestation_scheme(&self) -> String {
        "PSA".into()
    }

    fn supported_media_types(&self) -> MediaTypeMap {
        let mut map = BTreeMap::new();
        map.insert(
            "evidence-verification".into(),
            vec!["application/psa-attestation-token".into()],
        );
        map
    }

    fn version(&self) -> String {
        "1.0.0".into()
    }
}

#[rstest]
#[case::name(METHOD_GET_NAME, "psa-evidence")]
#[case::scheme(METHOD_GET_ATTESTATION_SCHEME, "PSA")]
#[case::version(METHOD_GET_VERSION, "1.0.0")]
fn dispatch_base_answers_string_methods(#[case] method: &str, #[case] expected: &str) {
    let value = dispatch_base(&FakePlugin, method).expect("base method answered");
    assert_eq!(value, Value::String(expected.into()));
}

#[test]
fn dispatch_base_serialises_media_type_map() {
    let value =
        dispatch_base(&FakePlugin, METHOD_GET_SUPPORTED_MEDIA_TYPES).expect("map answered");
    let map: MediaTypeMap = serde_json::from_value(value).expect("map deserialises");
    assert_eq!(
        map.get("evidence-verification")
            .map(|types| types.first().map(String::as_str)),
        Some(Some("application/psa-attestation-token"))
    );
}

#[test]
fn dispatch_base_ignores_category_methods() {
    assert!(dispatch_base(&FakePlugin, "appraise_evidence").is_none());
}

#[test]
fn arc_blanket_impl_delegates() {
    let plugin: Arc<dyn Pluggable> = Arc::new(FakePlugin);
    assert_eq!(plugin.name(), "psa-evidence");
    assert_eq!(plugin.attestation_scheme(), "PSA");
    assert_eq!(plugin.version(), "1.0.0");
}
