//! Integration tests for the module unit format

use sideload_bytecode::unit::HEADER_SIZE;
use sideload_bytecode::{
    verify_unit, DescriptorError, ModuleUnit, Opcode, Signature, TypeRef, UnitBuilder, UnitError,
    VerifyError,
};

fn wrapper_unit() -> ModuleUnit {
    UnitBuilder::new("impl.Wrapper")
        .field("n", "int")
        .constructor("(int)->void", |c| {
            c.load_local(0).load_local(1).store_field(0).ret_void();
        })
        .method("apply", "(impl.Box)->int", |c| {
            c.load_local(1).load_this_field(0).call_method("square", 1).ret();
        })
        .method("applyAll", "(impl.Box[])->int", |c| {
            c.load_local(1).op(Opcode::ArrayLen).ret();
        })
        .build()
        .expect("Failed to build")
}

#[test]
fn test_encode_decode_built_unit() {
    let unit = wrapper_unit();
    let bytes = unit.encode();
    let decoded = ModuleUnit::decode(&bytes).expect("Failed to decode");

    assert_eq!(decoded, unit);
    assert_eq!(decoded.entry_points[1].signature.to_string(), "(impl.Box)->int");
    assert_eq!(
        decoded.entry_points[2].signature.params[0],
        TypeRef::Array(Box::new(TypeRef::named("impl.Box")))
    );
}

/// Swap one length-prefixed string in an encoded unit and fix the checksum
fn patch_string(bytes: &[u8], from: &str, to: &str) -> Vec<u8> {
    let mut needle = (from.len() as u32).to_le_bytes().to_vec();
    needle.extend_from_slice(from.as_bytes());
    let at = bytes
        .windows(needle.len())
        .position(|w| w == needle.as_slice())
        .expect("string not found");

    let mut patched = bytes[..at].to_vec();
    patched.extend_from_slice(&(to.len() as u32).to_le_bytes());
    patched.extend_from_slice(to.as_bytes());
    patched.extend_from_slice(&bytes[at + needle.len()..]);

    let checksum = crc32fast::hash(&patched[HEADER_SIZE..]);
    patched[HEADER_SIZE - 4..HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());
    patched
}

#[test]
fn test_deeply_nested_descriptor_is_rejected() {
    let unit = UnitBuilder::new("impl.Deep")
        .field("slot", "impl.Placeholder")
        .build()
        .unwrap();
    let deep = format!("{}int{}", "(".repeat(100_000), ")".repeat(100_000));
    let bytes = patch_string(&unit.encode(), "impl.Placeholder", &deep);

    assert!(matches!(
        ModuleUnit::decode(&bytes),
        Err(UnitError::Descriptor(DescriptorError::TooDeep { .. }))
    ));

    let shallow = patch_string(&unit.encode(), "impl.Placeholder", "((int))");
    assert_eq!(ModuleUnit::decode(&shallow).unwrap().fields[0].ty, TypeRef::Int);
}

#[test]
fn test_unaddressable_locals_are_rejected() {
    let mut unit = wrapper_unit();
    unit.entry_points[1].local_count = u32::MAX as usize;

    assert!(matches!(
        ModuleUnit::decode(&unit.encode()),
        Err(UnitError::TooManyLocals { ref entry, .. }) if entry == "apply"
    ));
}

#[test]
fn test_verify_built_unit() {
    verify_unit(&wrapper_unit()).expect("Should be valid");
}

#[test]
fn test_super_unit_and_capabilities_survive_encoding() {
    let unit = UnitBuilder::new("impl.Square")
        .extends("impl.Shape")
        .implements("api.Area")
        .implements("api.Named")
        .build()
        .unwrap();

    let decoded = ModuleUnit::decode(&unit.encode()).unwrap();
    assert_eq!(decoded.super_unit.as_deref(), Some("impl.Shape"));
    assert!(decoded.declares("api.Area"));
    assert!(decoded.declares("api.Named"));
    assert!(!decoded.declares("api.Boxed"));
}

#[test]
fn test_corrupted_payload_is_rejected() {
    let mut bytes = wrapper_unit().encode();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;

    assert!(matches!(
        ModuleUnit::decode(&bytes),
        Err(UnitError::ChecksumMismatch { .. })
    ));
}

#[test]
fn test_not_a_unit() {
    assert!(matches!(
        ModuleUnit::decode(b"PK\x03\x04 definitely not a unit"),
        Err(UnitError::InvalidMagic(_))
    ));
    assert!(ModuleUnit::decode(&[]).is_err());
}

#[test]
fn test_find_exact_overload() {
    let unit = UnitBuilder::new("impl.Over")
        .method("f", "(int)->int", |c| {
            c.load_local(1).ret();
        })
        .method("f", "(str)->int", |c| {
            c.const_int(0).ret();
        })
        .build()
        .unwrap();

    let by_str = unit.find_exact("f", &[TypeRef::Str]).unwrap();
    assert_eq!(by_str.signature, Signature::parse("(str)->int").unwrap());
    assert!(unit.find_exact("f", &[TypeRef::Float]).is_none());
    assert_eq!(unit.entry_points_named("f").count(), 2);
}

#[test]
fn test_verify_rejects_dangling_name() {
    let mut unit = wrapper_unit();
    // CALL_METHOD name index pointing past the pool
    unit.entry_points[1].code = vec![
        Opcode::LoadLocal1 as u8,
        Opcode::CallMethod as u8,
        0xFF,
        0,
        0,
        0,
        0,
        0,
        Opcode::Return as u8,
    ];

    match verify_unit(&unit) {
        Err(VerifyError::Entry { error, .. }) => {
            assert!(matches!(*error, VerifyError::InvalidConstantRef { index: 255, .. }))
        }
        other => panic!("expected constant ref error, got {:?}", other),
    }
}
