use gir_bridge::{FfiType, IntWidth, Ownership, Record, Runtime, RuntimeConfig, StructLayout, Value};
use proptest::prelude::*;

fn runtime() -> Runtime {
    Runtime::start_with_config(RuntimeConfig::detached())
}

proptest! {
    #[test]
    fn test_record_fields_survive_native_memory(
        id in any::<i32>(),
        scale in -1.0e9f64..1.0e9,
        flags in any::<u8>(),
        visible in any::<bool>(),
        label in "[a-zA-Z0-9 ]{0,24}",
    ) {
        let rt = runtime();
        let layout = StructLayout::new(
            "Widget",
            [
                ("id", FfiType::i32()),
                ("scale", FfiType::f64()),
                ("flags", FfiType::uint(IntWidth::W8)),
                ("visible", FfiType::boolean()),
                ("label", FfiType::string(Ownership::None)),
            ],
        )
        .unwrap();
        let field = FfiType::struct_value(layout.clone()).unwrap();
        let buffer = rt.alloc(layout.size(), "Widget").unwrap();

        let record = Record::new()
            .with("id", id)
            .with("scale", scale)
            .with("flags", flags)
            .with("visible", visible)
            .with("label", label.as_str());
        rt.write(&buffer, &field, 0, &Value::Record(record.clone())).unwrap();

        prop_assert_eq!(rt.read(&buffer, &field, 0).unwrap(), Value::Record(record));
    }

    #[test]
    fn test_integer_fields_wrap_to_width(value in any::<i64>()) {
        let rt = runtime();
        let buffer = rt.alloc(8, "Cell").unwrap();

        rt.write(&buffer, &FfiType::uint(IntWidth::W16), 0, &Value::Int(value)).unwrap();
        prop_assert_eq!(
            rt.read(&buffer, &FfiType::uint(IntWidth::W16), 0).unwrap(),
            Value::UInt(value as u16 as u64)
        );

        rt.write(&buffer, &FfiType::int(IntWidth::W8), 4, &Value::Int(value)).unwrap();
        prop_assert_eq!(
            rt.read(&buffer, &FfiType::int(IntWidth::W8), 4).unwrap(),
            Value::Int(value as i8 as i64)
        );
    }
}

#[test]
fn test_out_of_range_byte_field_wraps() {
    let rt = runtime();
    let buffer = rt.alloc(4, "Cell").unwrap();
    let byte = FfiType::uint(IntWidth::W8);

    rt.write(&buffer, &byte, 0, &Value::Int(300)).unwrap();
    assert_eq!(rt.read(&buffer, &byte, 0).unwrap(), Value::UInt(44));
    // Neighbouring bytes are untouched
    assert_eq!(rt.read(&buffer, &byte, 1).unwrap(), Value::UInt(0));
}
