use gir_bridge::{
    CallbackScope, Callback, FfiType, IntWidth, Ownership, Runtime, RuntimeConfig, StructLayout,
    Trampoline, TypedArg, Value, SELF_LIBRARY,
};
use std::cmp::Ordering;

fn runtime() -> Runtime {
    Runtime::start_with_config(RuntimeConfig::detached())
}

#[test]
fn test_strlen_through_process_image() {
    let rt = runtime();
    let len = rt
        .call(
            SELF_LIBRARY,
            "strlen",
            &[TypedArg::new(FfiType::string(Ownership::None), "introspection")],
            &FfiType::u64(),
        )
        .unwrap();
    assert_eq!(len, Value::UInt(13));
}

#[test]
fn test_owned_string_return() {
    let rt = runtime();
    let copy = rt
        .call(
            SELF_LIBRARY,
            "strdup",
            &[TypedArg::new(FfiType::string(Ownership::None), "héllo")],
            &FfiType::string(Ownership::Full),
        )
        .unwrap();
    assert_eq!(copy, Value::from("héllo"));
    assert_eq!(rt.libraries().loaded_count(), 1);
    assert_eq!(rt.libraries().symbol_count(), 1);
}

#[test]
fn test_narrow_integer_arguments() {
    let rt = runtime();
    let upper = rt
        .call(
            SELF_LIBRARY,
            "toupper",
            &[TypedArg::new(FfiType::i32(), 'q' as i32)],
            &FfiType::i32(),
        )
        .unwrap();
    assert_eq!(upper, Value::Int('Q' as i64));

    let abs = rt
        .call(
            SELF_LIBRARY,
            "labs",
            &[TypedArg::new(FfiType::int(IntWidth::W64), -9_000_000_000i64)],
            &FfiType::int(IntWidth::W64),
        )
        .unwrap();
    assert_eq!(abs, Value::Int(9_000_000_000));
}

#[test]
fn test_missing_symbol_reported() {
    let rt = runtime();
    let err = rt
        .call(SELF_LIBRARY, "gir_bridge_no_such_symbol", &[], &FfiType::void())
        .unwrap_err();
    assert!(err.to_string().contains("gir_bridge_no_such_symbol"));

    let err = rt
        .call("libgir-bridge-missing.so", "f", &[], &FfiType::void())
        .unwrap_err();
    assert!(matches!(err, gir_bridge::Error::Library { .. }));
}

#[test]
fn test_qsort_with_call_scoped_comparator() {
    let rt = runtime();
    let element = StructLayout::new("Int", [("value", FfiType::i32())]).unwrap();
    let buffer_layout = StructLayout::opaque("IntBuffer", 16);
    let buffer = rt.alloc(16, "IntBuffer").unwrap();
    for (i, v) in [40, -3, 17, 0].into_iter().enumerate() {
        rt.write(&buffer, &FfiType::i32(), i * 4, &Value::Int(v)).unwrap();
    }

    let compar = FfiType::callback(
        Trampoline::Plain,
        CallbackScope::Call,
        vec![
            FfiType::struct_ptr(element.clone(), Ownership::None),
            FfiType::struct_ptr(element, Ownership::None),
        ],
        FfiType::i32(),
    )
    .unwrap();

    let reader = rt.clone();
    let handler = Callback::new(move |args: &[Value]| {
        let mut keys = [0i64; 2];
        for (key, arg) in keys.iter_mut().zip(args) {
            let cell = arg.as_boxed().ok_or(gir_bridge::Error::Stopped)?;
            *key = reader.read(cell, &FfiType::i32(), 0)?.as_i64().unwrap_or(0);
        }
        let order = match keys[0].cmp(&keys[1]) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        };
        Ok(Value::Int(order))
    });

    rt.call(
        SELF_LIBRARY,
        "qsort",
        &[
            TypedArg::new(FfiType::struct_ptr(buffer_layout, Ownership::None), buffer.clone()),
            TypedArg::new(FfiType::u64(), 4u64),
            TypedArg::new(FfiType::u64(), 4u64),
            TypedArg::new(compar, handler),
        ],
        &FfiType::void(),
    )
    .unwrap();

    let sorted: Vec<Value> = (0..4)
        .map(|i| rt.read(&buffer, &FfiType::i32(), i * 4).unwrap())
        .collect();
    assert_eq!(sorted, [-3, 0, 17, 40].map(Value::Int));

    // The comparator was retired when qsort returned
    assert_eq!(rt.trampolines().connected_count(), 0);
    rt.tick().unwrap();
    assert_eq!(rt.trampolines().closure_count(), 0);
}

#[test]
fn test_object_hooks_absent_without_gobject() {
    let rt = runtime();
    let mut cell = [0u64; 2];
    let err = rt
        .get_native_object(cell.as_mut_ptr().cast(), None)
        .unwrap_err();
    assert_eq!(err, gir_bridge::Error::MissingHook("object_ref_sink"));
}
