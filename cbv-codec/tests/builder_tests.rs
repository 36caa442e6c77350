//! Builder state-machine, option and rollback tests

use std::sync::Arc;

use cbv_codec::{
    ArrayGuard, AttributeTranslator, Buffer, Builder, BuilderOptions, CbvError, ObjectGuard,
    Value,
};

#[test]
fn close_without_open_frame_fails() {
    let mut builder = Builder::new();
    assert!(matches!(
        builder.close(),
        Err(CbvError::BuilderNeedOpenCompound)
    ));
}

#[test]
fn observing_output_with_open_frame_fails() {
    let mut builder = Builder::new();
    builder.open_array(false).unwrap();
    assert!(matches!(builder.slice(), Err(CbvError::BuilderNotSealed)));
    assert!(matches!(builder.size(), Err(CbvError::BuilderNotSealed)));
    assert!(matches!(builder.data(), Err(CbvError::BuilderNotSealed)));

    builder.close().unwrap();
    assert_eq!(builder.size().unwrap(), 1);
}

#[test]
fn key_value_outside_object_fails() {
    let mut builder = Builder::new();
    assert!(matches!(
        builder.add_key_value("a", Value::Int(1)),
        Err(CbvError::BuilderNeedOpenObject)
    ));

    builder.open_array(false).unwrap();
    assert!(matches!(
        builder.add_key_value("a", Value::Int(1)),
        Err(CbvError::BuilderNeedOpenObject)
    ));
}

#[test]
fn open_array_inside_object_awaiting_key_fails() {
    let mut builder = Builder::new();
    builder.open_object(false).unwrap();
    assert!(matches!(
        builder.open_array(false),
        Err(CbvError::BuilderNeedOpenArray)
    ));
}

#[test]
fn non_string_key_fails() {
    let mut builder = Builder::new();
    builder.open_object(false).unwrap();
    assert!(matches!(
        builder.add(Value::Int(1)),
        Err(CbvError::BuilderKeyMustBeString)
    ));
    // token keys need an active translator
    assert!(matches!(
        builder.add(Value::UInt(3)),
        Err(CbvError::BuilderKeyMustBeString)
    ));
}

#[test]
fn second_key_through_add_key_value_fails() {
    let mut builder = Builder::new();
    builder.open_object(false).unwrap();
    builder.add(Value::String("pending")).unwrap();
    assert!(matches!(
        builder.add_key_value("other", Value::Int(1)),
        Err(CbvError::BuilderKeyAlreadyWritten)
    ));
    // the pending key still accepts its value
    builder.add(Value::Int(7)).unwrap();
    builder.close().unwrap();
    let slice = builder.slice().unwrap();
    assert_eq!(
        slice.get("pending").unwrap().unwrap().get_int().unwrap(),
        7
    );
}

#[test]
fn two_step_key_value_matches_convenience_form() {
    let mut two_step = Builder::new();
    two_step.open_object(false).unwrap();
    two_step.add(Value::String("a")).unwrap();
    two_step.add(Value::Int(12)).unwrap();
    two_step.close().unwrap();

    let mut convenience = Builder::new();
    convenience.open_object(false).unwrap();
    convenience.add_key_value("a", Value::Int(12)).unwrap();
    convenience.close().unwrap();

    assert_eq!(two_step.data().unwrap(), convenience.data().unwrap());
}

#[test]
fn failed_add_rolls_back_cleanly() {
    let mut options = BuilderOptions::default();
    options.disallow_externals = true;
    let mut builder = Builder::with_options(options);
    builder.open_array(false).unwrap();
    builder.add(Value::Int(1)).unwrap();

    let before = builder.buffer().len();
    assert!(matches!(
        builder.add_external(std::ptr::null()),
        Err(CbvError::BuilderExternalsDisallowed)
    ));
    assert_eq!(builder.buffer().len(), before);

    // the failed call leaves no trace in the sealed output
    builder.add(Value::Int(2)).unwrap();
    builder.close().unwrap();

    let mut clean = Builder::new();
    clean.open_array(false).unwrap();
    clean.add(Value::Int(1)).unwrap();
    clean.add(Value::Int(2)).unwrap();
    clean.close().unwrap();
    assert_eq!(builder.data().unwrap(), clean.data().unwrap());
}

#[test]
fn failed_key_value_rolls_back_the_key_too() {
    let mut options = BuilderOptions::default();
    options.disallow_bcd = true;
    let mut builder = Builder::with_options(options);
    builder.open_object(false).unwrap();
    assert!(matches!(
        builder.add_key_value(
            "n",
            Value::Bcd {
                negative: false,
                exponent: 0,
                digits: &[1],
            }
        ),
        Err(CbvError::BuilderBcdDisallowed)
    ));

    // neither key nor value survived; the object closes empty
    builder.close().unwrap();
    assert_eq!(builder.data().unwrap(), &[0x0a]);
}

#[test]
fn bcd_digit_out_of_range_fails() {
    let mut builder = Builder::new();
    assert!(matches!(
        builder.add(Value::Bcd {
            negative: false,
            exponent: 0,
            digits: &[1, 10],
        }),
        Err(CbvError::NumberOutOfRange(_))
    ));
    assert!(matches!(
        builder.add(Value::Bcd {
            negative: false,
            exponent: 0,
            digits: &[],
        }),
        Err(CbvError::NumberOutOfRange(_))
    ));
    assert!(builder.is_empty());
}

#[test]
fn duplicate_keys_fail_on_close() {
    let mut options = BuilderOptions::default();
    options.check_attribute_uniqueness = true;
    let mut builder = Builder::with_options(options);
    builder.open_object(false).unwrap();
    builder.add_key_value("a", Value::Int(1)).unwrap();
    builder.add_key_value("a", Value::Int(2)).unwrap();
    match builder.close() {
        Err(CbvError::DuplicateAttributeName(name)) => assert_eq!(name, "a"),
        other => panic!("expected duplicate attribute error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn duplicate_keys_fail_in_compact_objects_too() {
    let mut options = BuilderOptions::default();
    options.check_attribute_uniqueness = true;
    let mut builder = Builder::with_options(options);
    builder.open_object(true).unwrap();
    builder.add_key_value("a", Value::Int(1)).unwrap();
    builder.add_key_value("a", Value::Int(2)).unwrap();
    assert!(matches!(
        builder.close(),
        Err(CbvError::DuplicateAttributeName(_))
    ));
}

#[test]
fn duplicate_keys_allowed_when_check_is_off() {
    let mut builder = Builder::new();
    builder.open_object(false).unwrap();
    builder.add_key_value("a", Value::Int(1)).unwrap();
    builder.add_key_value("a", Value::Int(2)).unwrap();
    builder.close().unwrap();
    assert_eq!(builder.slice().unwrap().length().unwrap(), 2);
}

#[test]
fn clear_makes_the_builder_reusable() {
    let mut builder = Builder::new();
    builder.open_array(false).unwrap();
    builder.add(Value::Int(1)).unwrap();
    builder.clear();
    assert!(builder.is_empty());
    assert!(builder.is_closed());

    builder.add(Value::Bool(true)).unwrap();
    assert_eq!(builder.data().unwrap(), &[0x1a]);
}

#[test]
fn steal_transfers_the_buffer() {
    let mut builder = Builder::new();
    builder.add(Value::Int(5)).unwrap();
    let buffer = builder.steal();
    assert_eq!(buffer.as_slice(), &[0x35]);
    assert!(builder.is_empty());

    // the builder starts fresh afterwards
    builder.add(Value::Bool(false)).unwrap();
    assert_eq!(builder.data().unwrap(), &[0x19]);
}

#[test]
fn borrowed_buffer_appends_after_existing_content() {
    let mut buffer = Buffer::from(vec![0x18]);
    {
        let mut builder = Builder::from_buffer(&mut buffer);
        builder.add(Value::Bool(true)).unwrap();
        assert_eq!(builder.size().unwrap(), 2);
    }
    assert_eq!(buffer.as_slice(), &[0x18, 0x1a]);
}

#[test]
fn multiple_top_level_values_concatenate() {
    let mut builder = Builder::new();
    builder.add(Value::Int(1)).unwrap();
    builder.add(Value::Int(2)).unwrap();
    assert_eq!(builder.size().unwrap(), 2);
    // slice views the first value only
    assert_eq!(builder.slice().unwrap().get_int().unwrap(), 1);
}

#[test]
fn array_guard_closes_on_drop() {
    let mut builder = Builder::new();
    {
        let mut guard = ArrayGuard::new(&mut builder, false).unwrap();
        guard.add(Value::Int(1)).unwrap();
    }
    assert!(builder.is_closed());
    assert_eq!(builder.slice().unwrap().length().unwrap(), 1);
}

#[test]
fn nested_guards_close_in_reverse_order() {
    let mut builder = Builder::new();
    {
        let mut outer = ObjectGuard::new(&mut builder, false).unwrap();
        {
            let mut inner = ArrayGuard::new_with_key(&mut outer, "list", false).unwrap();
            inner.add(Value::Int(1)).unwrap();
            inner.add(Value::Int(2)).unwrap();
        }
        outer.add_key_value("x", Value::Bool(true)).unwrap();
    }
    assert!(builder.is_closed());

    let slice = builder.slice().unwrap();
    let list = slice.get("list").unwrap().unwrap();
    assert_eq!(list.length().unwrap(), 2);
    assert!(slice.get("x").unwrap().unwrap().get_bool().unwrap());
}

#[test]
fn guard_close_surfaces_errors() {
    let mut options = BuilderOptions::default();
    options.check_attribute_uniqueness = true;
    let mut builder = Builder::with_options(options);
    let mut guard = ObjectGuard::new(&mut builder, false).unwrap();
    guard.add_key_value("a", Value::Int(1)).unwrap();
    guard.add_key_value("a", Value::Int(2)).unwrap();
    assert!(guard.close().is_err());
}

#[test]
fn has_key_and_get_key_inspect_the_open_object() {
    let mut builder = Builder::new();
    builder.open_object(false).unwrap();
    builder.add_key_value("a", Value::Int(1)).unwrap();

    assert!(builder.has_key("a").unwrap());
    assert!(!builder.has_key("b").unwrap());
    assert_eq!(builder.get_key("a").unwrap().unwrap().get_int().unwrap(), 1);

    // a pending key blocks the lookup
    builder.add(Value::String("pending")).unwrap();
    assert!(matches!(
        builder.has_key("a"),
        Err(CbvError::BuilderKeyAlreadyWritten)
    ));
}

#[test]
fn translator_substitutes_tokens_for_known_keys() {
    let mut table = AttributeTranslator::new();
    table.add("_key", 1).unwrap();
    let mut options = BuilderOptions::default();
    options.attribute_translator = Some(Arc::new(table));

    let mut builder = Builder::with_options(options.clone());
    builder.open_object(false).unwrap();
    builder.add_key_value("_key", Value::String("v")).unwrap();
    builder.add_key_value("other", Value::Int(2)).unwrap();
    builder.close().unwrap();

    // the registered key shrank to one token byte
    let slice = builder.slice().unwrap();
    let translator = options.attribute_translator.as_deref();
    assert_eq!(
        slice
            .get_with_translator("_key", translator)
            .unwrap()
            .unwrap()
            .get_string()
            .unwrap(),
        "v"
    );
    assert_eq!(
        slice.get("other").unwrap().unwrap().get_int().unwrap(),
        2
    );

    // token keys are accepted directly while the translator is active
    let mut manual = Builder::with_options(options);
    manual.open_object(false).unwrap();
    manual.add(Value::UInt(1)).unwrap();
    manual.add(Value::String("v")).unwrap();
    manual.close().unwrap();
    assert_eq!(
        manual.data().unwrap(),
        &[0x0b, 0x07, 0x01, 0x31, 0x41, b'v', 0x03]
    );
}

#[test]
fn add_with_runs_a_serializer_callback() {
    let mut builder = Builder::new();
    builder
        .add_with(|b| {
            b.open_array(false)?;
            b.add(Value::Int(1))?;
            b.add(Value::Int(2))?;
            b.close()?;
            Ok(())
        })
        .unwrap();
    assert_eq!(builder.slice().unwrap().length().unwrap(), 2);
}

#[test]
fn add_with_rolls_back_on_error() {
    let mut builder = Builder::new();
    builder.open_array(false).unwrap();
    builder.add(Value::Int(1)).unwrap();
    let before = builder.buffer().len();

    let result: Result<(), CbvError> = builder.add_with(|b| {
        b.add(Value::Int(2))?;
        Err(CbvError::Internal("serializer gave up".to_string()))
    });
    assert!(result.is_err());
    assert_eq!(builder.buffer().len(), before);

    builder.close().unwrap();
    assert_eq!(builder.slice().unwrap().length().unwrap(), 1);
}

#[test]
fn add_slice_copies_verbatim() {
    let mut source = Builder::new();
    source.open_array(false).unwrap();
    source.add(Value::Int(1)).unwrap();
    source.add(Value::String("x")).unwrap();
    source.close().unwrap();

    let mut target = Builder::new();
    target.open_object(false).unwrap();
    target
        .add_key_slice("copy", source.slice().unwrap())
        .unwrap();
    target.close().unwrap();

    let copied = target.slice().unwrap().get("copy").unwrap().unwrap();
    assert!(copied.binary_equals(&source.slice().unwrap()));
}

#[test]
fn external_value_roundtrips_the_address() {
    let payload: [u8; 1] = [0x31];
    let mut builder = Builder::new();
    builder.add_external(payload.as_ptr()).unwrap();
    let slice = builder.slice().unwrap();
    assert!(slice.is_external());
    assert_eq!(slice.external().unwrap(), payload.as_ptr());
}
