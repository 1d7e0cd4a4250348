//! Versioned record schema and structural classifier.
//!
//! Stored session blobs and received wire messages carry no type tag. The
//! classifier recovers the shape from the set of top-level field names, using a
//! static table of `(field, introduced_in)` entries per shape. Only fields from
//! the first schema version count as required, so fields added later never make
//! an old record unclassifiable. Additions are append-only: a field must never
//! be removed from a shape without a migration.
//!
//! The shapes are checked in [`RecordShape::PRIORITY`] order and the first one
//! whose required set is fully present wins. The table is kept disjoint (no
//! required set contained in another), so the order only matters for records
//! that carry the fields of two shapes at once.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use serde_json::Value;

use crate::error::{Result, SecureChatError};
use crate::message::{InitiationMessage, RegularMessage};
use crate::session::{InitiatorState, ResponderState};

/// Latest schema version present in [`SCHEMA_TABLE`].
pub const SCHEMA_VERSION: u32 = 2;

/// Schema version whose fields make up the required sets.
const BASELINE_VERSION: u32 = 1;

/// Structural shape of an untagged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordShape {
    InitiatorState,
    ResponderState,
    InitiationMessage,
    RegularMessage,
    Unknown,
}

impl RecordShape {
    /// Classification order.
    pub const PRIORITY: [Self; 4] = [
        Self::InitiatorState,
        Self::ResponderState,
        Self::InitiationMessage,
        Self::RegularMessage,
    ];
}

/// One field of a shape and the schema version that introduced it.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub since: u32,
}

const fn field(name: &'static str, since: u32) -> FieldSpec {
    FieldSpec { name, since }
}

/// Fields of one shape, grouped so shared groups are listed once.
#[derive(Debug)]
pub struct ShapeSchema {
    pub shape: RecordShape,
    pub groups: &'static [&'static [FieldSpec]],
}

impl ShapeSchema {
    pub fn fields(&self) -> impl Iterator<Item = &'static FieldSpec> {
        self.groups.iter().flat_map(|group| group.iter())
    }
}

const SESSION_CORE_FIELDS: &[FieldSpec] = &[
    field("session_id", 1),
    field("local_identity", 1),
    field("remote_identity", 1),
    field("root_key", 1),
    field("sending_chain_key", 1),
    field("receiving_chain_key", 1),
    field("sent_count", 1),
    field("received_count", 1),
    field("phase", 1),
    field("created_at", 1),
    field("expires_at", 2),
];

const INITIATOR_FIELDS: &[FieldSpec] = &[
    field("initiator_ltc_id", 1),
    field("responder_ltc_id", 1),
    field("responder_otc_id", 1),
    field("ephemeral_public", 1),
];

const RESPONDER_FIELDS: &[FieldSpec] = &[
    field("initiator_ltc_id", 1),
    field("responder_ltc_id", 1),
    field("consumed_otc_id", 1),
    field("initiator_ephemeral_public", 1),
];

const INITIATION_MESSAGE_FIELDS: &[FieldSpec] = &[
    field("initiator_ic_id", 1),
    field("initiator_ltc_id", 1),
    field("responder_ic_id", 1),
    field("responder_ltc_id", 1),
    field("responder_otc_id", 1),
    field("eph", 1),
    field("eph_sign", 1),
    field("salt", 1),
    field("counter", 1),
    field("cipher_text", 1),
];

const REGULAR_MESSAGE_FIELDS: &[FieldSpec] = &[
    field("session_id", 1),
    field("counter", 1),
    field("cipher_text", 1),
];

/// Every known shape, in classification order.
pub static SCHEMA_TABLE: &[ShapeSchema] = &[
    ShapeSchema {
        shape: RecordShape::InitiatorState,
        groups: &[SESSION_CORE_FIELDS, INITIATOR_FIELDS],
    },
    ShapeSchema {
        shape: RecordShape::ResponderState,
        groups: &[SESSION_CORE_FIELDS, RESPONDER_FIELDS],
    },
    ShapeSchema {
        shape: RecordShape::InitiationMessage,
        groups: &[INITIATION_MESSAGE_FIELDS],
    },
    ShapeSchema {
        shape: RecordShape::RegularMessage,
        groups: &[REGULAR_MESSAGE_FIELDS],
    },
];

static REQUIRED: LazyLock<Vec<(RecordShape, BTreeSet<&'static str>)>> = LazyLock::new(|| {
    RecordShape::PRIORITY
        .iter()
        .map(|shape| {
            let required = SCHEMA_TABLE
                .iter()
                .filter(|schema| schema.shape == *shape)
                .flat_map(ShapeSchema::fields)
                .filter(|entry| entry.since <= BASELINE_VERSION)
                .map(|entry| entry.name)
                .collect();
            (*shape, required)
        })
        .collect()
});

/// Required field names of `shape`; `None` for [`RecordShape::Unknown`].
pub fn required_fields(shape: RecordShape) -> Option<&'static BTreeSet<&'static str>> {
    REQUIRED
        .iter()
        .find(|(candidate, _)| *candidate == shape)
        .map(|(_, fields)| fields)
}

/// Determine the shape of a decoded record from its top-level field names.
pub fn classify(record: &Value) -> RecordShape {
    let Some(object) = record.as_object() else {
        return RecordShape::Unknown;
    };
    REQUIRED
        .iter()
        .find(|(_, required)| required.iter().all(|name| object.contains_key(*name)))
        .map_or(RecordShape::Unknown, |(shape, _)| *shape)
}

/// A classified record decoded into its concrete type.
#[derive(Debug, Clone)]
pub enum SessionRecord {
    InitiatorState(InitiatorState),
    ResponderState(ResponderState),
    InitiationMessage(InitiationMessage),
    RegularMessage(RegularMessage),
}

impl From<&SessionRecord> for RecordShape {
    fn from(record: &SessionRecord) -> Self {
        match record {
            SessionRecord::InitiatorState(_) => Self::InitiatorState,
            SessionRecord::ResponderState(_) => Self::ResponderState,
            SessionRecord::InitiationMessage(_) => Self::InitiationMessage,
            SessionRecord::RegularMessage(_) => Self::RegularMessage,
        }
    }
}

/// Classify `record` and decode it into the matching type.
pub fn decode_record(record: Value) -> Result<SessionRecord> {
    let shape = classify(&record);
    Ok(match shape {
        RecordShape::InitiatorState => SessionRecord::InitiatorState(serde_json::from_value(record)?),
        RecordShape::ResponderState => SessionRecord::ResponderState(serde_json::from_value(record)?),
        RecordShape::InitiationMessage => {
            SessionRecord::InitiationMessage(serde_json::from_value(record)?)
        }
        RecordShape::RegularMessage => SessionRecord::RegularMessage(serde_json::from_value(record)?),
        RecordShape::Unknown => {
            let fields: Vec<String> = record
                .as_object()
                .map(|object| object.keys().cloned().collect())
                .unwrap_or_default();
            return Err(SecureChatError::UnclassifiableRecord(format!(
                "no known shape matches fields {fields:?}"
            )));
        }
    })
}

/// Parse a JSON string and decode it with [`decode_record`].
pub fn decode_str(json: &str) -> Result<SessionRecord> {
    decode_record(serde_json::from_str(json)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{Map, json};

    fn record_with(fields: &BTreeSet<&'static str>) -> Value {
        let object: Map<String, Value> = fields
            .iter()
            .map(|name| ((*name).to_string(), Value::Null))
            .collect();
        Value::Object(object)
    }

    #[test]
    fn required_sets_are_pairwise_disjoint_by_subset() {
        for (a, fields_a) in REQUIRED.iter() {
            for (b, fields_b) in REQUIRED.iter() {
                if a != b {
                    assert!(
                        !fields_a.is_subset(fields_b),
                        "{a:?} required fields are contained in {b:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn later_fields_are_not_required() {
        let state = required_fields(RecordShape::InitiatorState).unwrap();
        assert!(state.contains("session_id"));
        assert!(!state.contains("expires_at"));
        assert!(required_fields(RecordShape::Unknown).is_none());
    }

    #[test]
    fn each_baseline_set_classifies_as_its_shape() {
        for shape in RecordShape::PRIORITY {
            let record = record_with(required_fields(shape).unwrap());
            assert_eq!(classify(&record), shape);
        }
    }

    #[test]
    fn record_with_two_shapes_resolves_by_priority() {
        let mut fields = required_fields(RecordShape::RegularMessage).unwrap().clone();
        fields.extend(required_fields(RecordShape::InitiatorState).unwrap());
        assert_eq!(classify(&record_with(&fields)), RecordShape::InitiatorState);

        let mut fields = required_fields(RecordShape::RegularMessage).unwrap().clone();
        fields.extend(required_fields(RecordShape::InitiationMessage).unwrap());
        assert_eq!(classify(&record_with(&fields)), RecordShape::InitiationMessage);
    }

    #[test]
    fn non_objects_are_unknown() {
        assert_eq!(classify(&json!([1, 2, 3])), RecordShape::Unknown);
        assert_eq!(classify(&json!("session")), RecordShape::Unknown);
        assert_eq!(classify(&json!({})), RecordShape::Unknown);
    }

    #[test]
    fn decode_unknown_reports_fields() {
        let err = decode_record(json!({"foo": 1})).unwrap_err();
        match err {
            SecureChatError::UnclassifiableRecord(msg) => assert!(msg.contains("foo")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn decode_regular_message() {
        let record = decode_str(r#"{"session_id":"abc","counter":3,"cipher_text":"AAEC"}"#).unwrap();
        match record {
            SessionRecord::RegularMessage(msg) => {
                assert_eq!(msg.session_id, "abc");
                assert_eq!(msg.counter, 3);
                assert_eq!(msg.cipher_text, vec![0, 1, 2]);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn shape_with_bad_field_types_is_a_serialization_error() {
        let err = decode_record(json!({"session_id": 1, "counter": "x", "cipher_text": 0}))
            .unwrap_err();
        assert!(matches!(err, SecureChatError::Serialization(_)));
    }

    proptest! {
        #[test]
        fn extra_fields_do_not_change_shape(
            index in 0usize..4,
            extras in proptest::collection::btree_set("x_[a-z]{1,8}", 0..6),
        ) {
            let shape = RecordShape::PRIORITY[index];
            let mut record = record_with(required_fields(shape).unwrap());
            let object = record.as_object_mut().unwrap();
            for extra in extras {
                object.insert(extra, Value::Bool(true));
            }
            prop_assert_eq!(classify(&record), shape);
        }

        #[test]
        fn dropping_a_required_field_yields_unknown(index in 0usize..4, drop in 0usize..64) {
            let shape = RecordShape::PRIORITY[index];
            let required = required_fields(shape).unwrap();
            let victim = *required.iter().nth(drop % required.len()).unwrap();
            let mut record = record_with(required);
            record.as_object_mut().unwrap().remove(victim);
            prop_assert_eq!(classify(&record), RecordShape::Unknown);
        }
    }
}
