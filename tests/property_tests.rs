//! Property tests for identity determinism and type inference.

mod common;

use proptest::prelude::*;

use silt::materialize::{infer_column_type, ColumnType, ColumnValue, Segment};
use silt::record::{AttrValue, Participant, Record};
use silt::relation::relation_id;

use common::Pipeline;

proptest! {
    /// The relation id never depends on participant order.
    #[test]
    fn prop_relation_id_is_order_invariant(
        table in "[a-z]{1,12}",
        mut participants in prop::collection::vec(
            ("[a-z]{1,8}", "[a-zA-Z0-9-]{1,12}")
                .prop_map(|(t, i)| Participant::new(t, i)),
            1..6,
        ),
    ) {
        let forward = relation_id(&table, &participants);
        participants.reverse();
        let reversed = relation_id(&table, &participants);
        prop_assert_eq!(&forward, &reversed);
        prop_assert_eq!(forward.len(), 32);
    }

    /// Distinct tables with the same participants never share an id.
    #[test]
    fn prop_relation_id_depends_on_table(
        participants in prop::collection::vec(
            ("[a-z]{1,8}", "[a-zA-Z0-9-]{1,12}")
                .prop_map(|(t, i)| Participant::new(t, i)),
            1..4,
        ),
    ) {
        prop_assert_ne!(
            relation_id("alpha", &participants),
            relation_id("beta", &participants)
        );
    }

    /// Integer narrowing picks a width that always round-trips the value.
    #[test]
    fn prop_integer_narrowing_is_lossless(v in any::<i64>()) {
        let ctype = infer_column_type(&AttrValue::Int(v));
        let fits = match ctype {
            ColumnType::Int8 => i8::try_from(v).is_ok(),
            ColumnType::Int16 => i16::try_from(v).is_ok(),
            ColumnType::Int32 => i32::try_from(v).is_ok(),
            ColumnType::Int64 => true,
            other => {
                return Err(TestCaseError::fail(format!("integer inferred as {other:?}")));
            }
        };
        prop_assert!(fits);
    }

    /// Encode/decode of a materialized segment preserves every value under
    /// the defined precision (float32 rounding accepted, integers exact).
    #[test]
    fn prop_segment_round_trip(
        id in "[a-z0-9]{1,10}",
        int_val in any::<i64>(),
        // JSON has no NaN or infinity; the feed never carries them either.
        float_val in -1.0e30f32..1.0e30f32,
        text_val in "[ -~]{0,40}",
    ) {
        let record = Record::new("things", id, Pipeline::ts())
            .with_attr("i", int_val)
            .with_attr("s", text_val.as_str())
            .with_attr("f", f64::from(float_val));

        let segment = Segment::from_record(&record);
        let decoded = Segment::decode(&segment.encode().unwrap()).unwrap();

        for (column, value) in decoded.columns.iter().zip(&decoded.values) {
            match column.name.as_str() {
                "i" => prop_assert_eq!(value, &ColumnValue::Int(int_val)),
                "f" => {
                    let ColumnValue::Float(f) = value else {
                        return Err(TestCaseError::fail("float column lost its type"));
                    };
                    prop_assert_eq!(*f, float_val);
                }
                "s" => {
                    // Unless the random text happens to be RFC 3339, it
                    // stays a string.
                    if column.ctype == ColumnType::Text {
                        prop_assert_eq!(value, &ColumnValue::Text(text_val.clone()));
                    }
                }
                _ => {}
            }
        }
    }
}
