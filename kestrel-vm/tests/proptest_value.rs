// kestrel-vm - Property-based tests for the NaN-boxed value encoding
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Properties of the tagged value representation:
//! - every encoded value decodes back to the same kind and payload
//! - doubles survive bit-exactly, including NaNs and infinities
//! - arithmetic on encoded ints promotes exactly when it leaves i32 range

use kestrel_vm::{Value, ValueKind, values_equal};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn doubles_round_trip_bit_exactly(bits in any::<u64>()) {
        let x = f64::from_bits(bits);
        let v = Value::double(x);
        // Bit patterns that collide with a tag signature are the NaN
        // payloads the runtime never produces from arithmetic; everything
        // else must decode as the identical double.
        if v.kind() == ValueKind::Double {
            prop_assert_eq!(v.as_double().to_bits(), bits);
        }
    }

    #[test]
    fn finite_doubles_always_decode_as_doubles(x in any::<f64>().prop_filter("finite", |f| f.is_finite())) {
        let v = Value::double(x);
        prop_assert_eq!(v.kind(), ValueKind::Double);
        prop_assert_eq!(v.as_double().to_bits(), x.to_bits());
    }

    #[test]
    fn ints_round_trip(x in any::<i32>()) {
        let v = Value::int(x);
        prop_assert_eq!(v.kind(), ValueKind::Int);
        prop_assert_eq!(v.as_int(), x);
    }

    #[test]
    fn ints_and_doubles_never_collide(x in any::<i32>()) {
        // An int encoding must never be readable as a double encoding of
        // anything, and vice versa for the same numeric magnitude.
        let as_int = Value::int(x);
        let as_double = Value::double(x as f64);
        prop_assert_eq!(as_int.kind(), ValueKind::Int);
        if as_double.kind() == ValueKind::Double {
            prop_assert!(!values_equal(as_int, as_double));
        }
    }

    #[test]
    fn number_constructor_is_consistent(x in any::<f64>().prop_filter("finite", |f| f.is_finite())) {
        let v = Value::number(x);
        match v.kind() {
            ValueKind::Int => prop_assert_eq!(v.as_int() as f64, x),
            ValueKind::Double => prop_assert_eq!(v.as_double().to_bits(), x.to_bits()),
            other => prop_assert!(false, "unexpected kind {:?}", other),
        }
    }

    #[test]
    fn equality_is_reflexive_for_numbers(x in any::<f64>().prop_filter("finite", |f| f.is_finite())) {
        let v = Value::double(x);
        prop_assert!(values_equal(v, v));
        let i = Value::number(x.trunc());
        prop_assert!(values_equal(i, i));
    }

    #[test]
    fn booleans_and_nil_are_singletons(b in any::<bool>()) {
        let v = Value::boolean(b);
        prop_assert_eq!(v.kind(), ValueKind::Bool);
        prop_assert_eq!(v.as_bool(), b);
        prop_assert_eq!(v.raw(), Value::boolean(b).raw());
        prop_assert_eq!(Value::NIL.kind(), ValueKind::Nil);
    }

    #[test]
    fn falseyness_matches_the_two_falsey_values(x in any::<i32>()) {
        prop_assert!(!Value::int(x).is_falsey());
        prop_assert!(Value::NIL.is_falsey());
        prop_assert!(Value::FALSE.is_falsey());
        prop_assert!(!Value::TRUE.is_falsey());
    }
}
