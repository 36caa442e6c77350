//! Property-based tests for cbv format primitives

use cbv_format::tags::{value_type, ValueType};
use cbv_format::varint::{
    decode_varint, decode_varint_reversed, encode_varint, encode_varint_reversed, varint_length,
};
use proptest::prelude::*;

proptest! {
    #[test]
    fn varint_roundtrip_property(value in 0u64..u64::MAX) {
        let encoded = encode_varint(value);
        let (decoded, len) = decode_varint(&encoded).expect("decode forward varint");
        prop_assert_eq!(value, decoded);
        prop_assert_eq!(len, encoded.len());
    }

    #[test]
    fn varint_reversed_roundtrip_property(value in 0u64..u64::MAX) {
        let encoded = encode_varint_reversed(value);
        let (decoded, len) = decode_varint_reversed(&encoded).expect("decode reversed varint");
        prop_assert_eq!(value, decoded);
        prop_assert_eq!(len, encoded.len());
    }

    #[test]
    fn varint_encoding_size_property(value in 0u64..u64::MAX) {
        let encoded = encode_varint(value);

        prop_assert_eq!(encoded.len(), varint_length(value));
        prop_assert!(encoded.len() <= 10);

        if value < 0x80 {
            prop_assert_eq!(encoded.len(), 1);
        } else if value < 0x4000 {
            prop_assert!(encoded.len() <= 2);
        }
    }

    #[test]
    fn varint_reversed_tail_property(value in 0u64..u64::MAX, prefix in prop::collection::vec(any::<u8>(), 0..16)) {
        // decoding from the tail must not depend on what precedes the varint,
        // as long as the byte right before it has no continuation bit
        let mut bytes = prefix;
        bytes.push(0x00);
        let encoded = encode_varint_reversed(value);
        bytes.extend_from_slice(&encoded);

        let (decoded, len) = decode_varint_reversed(&bytes).expect("decode reversed varint");
        prop_assert_eq!(value, decoded);
        prop_assert_eq!(len, encoded.len());
    }

    #[test]
    fn head_classification_total_property(head in any::<u8>()) {
        // every head byte classifies without panicking, and the builder's
        // produced ranges never classify as None
        let vt = value_type(head);
        if matches!(head, 0x01..=0x0e | 0x13 | 0x14 | 0x18..=0xd7 | 0xee | 0xef) {
            prop_assert_ne!(vt, ValueType::None);
        }
    }
}
