//! End-to-end typing layer tests: IDL loading, generic instantiation,
//! validation and typed serialization.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use lattice_core::{code, Object};
use lattice_typing::{get_typei, is_compatible, TypeClass, TypingContext};

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn write_idl(contents: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("lattice-idl-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.yaml", COUNTER.fetch_add(1, Ordering::Relaxed)));
    fs::write(&path, contents).unwrap();
    path
}

const PAIR_IDL: &str = "
meta:
  version: 1
  namespace: com.example
struct Pair<A,B>:
  members:
    a: A
    b: B
typedef IntPair:
  type: Pair<int64,int64>
";

#[test]
fn test_missing_meta_is_einval() {
    let ctx = TypingContext::new();
    let path = write_idl("struct Foo:\n  members: {}\n");
    let err = ctx.load_types(&path).unwrap_err();
    assert_eq!(err.code, code::EINVAL);
}

#[test]
fn test_idempotent_load() {
    let ctx = TypingContext::new();
    let path = write_idl(PAIR_IDL);
    ctx.load_types(&path).unwrap();
    ctx.load_types(&path).unwrap();
    assert!(ctx.find_type("com.example.Pair").is_some());
}

#[test]
fn test_load_stream_not_supported() {
    let ctx = TypingContext::new();
    assert_eq!(ctx.load_types_stream(0).unwrap_err().code, code::ENOTSUP);
}

#[test]
fn test_canonical_cache_shares_instances() {
    let ctx = TypingContext::new();
    let path = write_idl(PAIR_IDL);
    ctx.load_types(&path).unwrap();

    let a = ctx.instantiate("int64").unwrap();
    let b = ctx.instantiate("int64").unwrap();
    assert!(a.ptr_eq(&b));

    let first = ctx.instantiate("com.example.IntPair").unwrap();
    let second = ctx.instantiate(first.canonical_form()).unwrap();
    assert!(first.ptr_eq(&second));
}

#[test]
fn test_generic_canonical_form() {
    let ctx = TypingContext::new();
    let path = write_idl(PAIR_IDL);
    ctx.load_types(&path).unwrap();

    let typei = ctx.instantiate("com.example.Pair<string,double>").unwrap();
    assert_eq!(typei.canonical_form(), "com.example.Pair<string,double>");
    assert!(typei.is_fully_specialized());

    let unwound = ctx.instantiate("com.example.IntPair").unwrap().unwind();
    assert_eq!(unwound.canonical_form(), "com.example.Pair<int64,int64>");
}

#[test]
fn test_nested_generics_depth_eight() {
    let ctx = TypingContext::new();
    let path = write_idl(
        "
meta:
  version: 1
  namespace: com.example
struct Box<T>:
  members:
    item: T
",
    );
    ctx.load_types(&path).unwrap();

    let mut decl = "int64".to_string();
    for _ in 0..8 {
        decl = format!("com.example.Box<{}>", decl);
    }

    let typei = ctx.instantiate(&decl).unwrap();
    assert!(typei.is_fully_specialized());

    let mut canonical = "int64".to_string();
    for _ in 0..8 {
        canonical = format!("com.example.Box<{}>", canonical);
    }
    assert_eq!(typei.canonical_form(), canonical);
}

#[test]
fn test_generic_arity_mismatch() {
    let ctx = TypingContext::new();
    let path = write_idl(PAIR_IDL);
    ctx.load_types(&path).unwrap();

    let err = ctx.instantiate("com.example.Pair<int64>").unwrap_err();
    assert_eq!(err.code, code::EINVAL);
}

#[test]
fn test_unknown_type_is_einval() {
    let ctx = TypingContext::new();
    let err = ctx.instantiate("Nonexistent").unwrap_err();
    assert_eq!(err.code, code::EINVAL);
    assert!(err.message.contains("not found"));
}

#[test]
fn test_validate_int_pair() {
    let ctx = TypingContext::new();
    let path = write_idl(PAIR_IDL);
    ctx.load_types(&path).unwrap();

    let typei = ctx.instantiate("com.example.IntPair").unwrap();

    let good = Object::dictionary_from([("a", Object::int64(1)), ("b", Object::int64(2))]);
    let good = ctx.new_instance("com.example.IntPair", &good).unwrap();
    assert!(ctx.validate(&typei, &good).is_ok());

    let bad = Object::dictionary_from([("a", Object::string("x")), ("b", Object::int64(2))]);
    let bad = ctx.new_instance("com.example.IntPair", &bad).unwrap();
    let errors = ctx.validate(&typei, &bad).unwrap_err();
    assert_eq!(errors.len(), 1);

    let entry = errors.array_get(0).unwrap();
    assert_eq!(entry.dict_get("path").unwrap().as_str(), Some(".a"));
    assert_eq!(
        entry.dict_get("message").unwrap().as_str(),
        Some("Incompatible type string, should be int64")
    );
}

#[test]
fn test_validate_missing_and_unknown_members() {
    let ctx = TypingContext::new();
    let path = write_idl(PAIR_IDL);
    ctx.load_types(&path).unwrap();

    let typei = ctx.instantiate("com.example.IntPair").unwrap();
    let obj = Object::dictionary_from([("a", Object::int64(1)), ("extra", Object::int64(3))]);
    let obj = ctx.new_instance("com.example.IntPair", &obj).unwrap();

    let errors = ctx.validate(&typei, &obj).unwrap_err();
    let mut messages = Vec::new();
    errors.array_apply(|_, entry| {
        messages.push(entry.dict_get("message").unwrap().as_str().unwrap().to_string());
        true
    });
    assert!(messages.iter().any(|m| m.contains("'b' is missing")));
    assert!(messages.iter().any(|m| m.contains("Unknown member 'extra'")));
}

#[test]
fn test_compatibility_ignores_specializations() {
    let ctx = TypingContext::new();
    let path = write_idl(
        "
meta:
  version: 1
  namespace: com.example
struct List<T>:
  members:
    items: array
",
    );
    ctx.load_types(&path).unwrap();

    let ints = ctx.instantiate("com.example.List<int64>").unwrap();
    let strings = ctx.instantiate("com.example.List<string>").unwrap();
    assert!(is_compatible(&strings, &ints));

    let any = ctx.instantiate("any").unwrap();
    assert!(is_compatible(&any, &ints));
    assert!(!is_compatible(&ints, &ctx.instantiate("string").unwrap()));
}

#[test]
fn test_parent_members_inherited() {
    let ctx = TypingContext::new();
    let path = write_idl(
        "
meta:
  version: 1
  namespace: com.example
struct Base:
  members:
    id: int64
struct Derived:
  inherits: Base
  members:
    name: string
",
    );
    ctx.load_types(&path).unwrap();

    let derived = ctx.find_type("com.example.Derived").unwrap();
    assert!(derived.member("id").is_some());
    assert!(derived.member("name").is_some());

    // A derived value is accepted where the parent is declared.
    let base = ctx.instantiate("com.example.Base").unwrap();
    let child = ctx.instantiate("com.example.Derived").unwrap();
    assert!(is_compatible(&base, &child));
    assert!(!is_compatible(&child, &base));
}

#[test]
fn test_enum_validation() {
    let ctx = TypingContext::new();
    let path = write_idl(
        "
meta:
  version: 1
  namespace: com.example
enum Color:
  members:
    - red
    - green
",
    );
    ctx.load_types(&path).unwrap();

    let typei = ctx.instantiate("com.example.Color").unwrap();

    let red = ctx.new_instance("com.example.Color", &Object::string("red")).unwrap();
    assert!(ctx.validate(&typei, &red).is_ok());

    let blue = ctx.new_instance("com.example.Color", &Object::string("blue")).unwrap();
    let errors = ctx.validate(&typei, &blue).unwrap_err();
    let entry = errors.array_get(0).unwrap();
    assert_eq!(
        entry.dict_get("message").unwrap().as_str(),
        Some("Invalid enum value 'blue'")
    );
}

#[test]
fn test_union_branch_matching() {
    let ctx = TypingContext::new();
    let path = write_idl(
        "
meta:
  version: 1
  namespace: com.example
union Scalar:
  members:
    num: int64
    text: string
",
    );
    ctx.load_types(&path).unwrap();

    let typei = ctx.instantiate("com.example.Scalar").unwrap();

    let num = ctx.new_instance("com.example.Scalar", &Object::int64(5)).unwrap();
    assert!(ctx.validate(&typei, &num).is_ok());

    let text = ctx.new_instance("com.example.Scalar", &Object::string("hi")).unwrap();
    assert!(ctx.validate(&typei, &text).is_ok());

    let nope = ctx.new_instance("com.example.Scalar", &Object::boolean(true)).unwrap();
    let errors = ctx.validate(&typei, &nope).unwrap_err();
    let entry = errors.array_get(0).unwrap();
    assert_eq!(
        entry.dict_get("message").unwrap().as_str(),
        Some("No union branch matches the value")
    );
}

#[test]
fn test_constraints() {
    let ctx = TypingContext::new();
    let path = write_idl(
        "
meta:
  version: 1
  namespace: com.example
struct Job:
  members:
    priority:
      type: int64
      constraints:
        min: 0
        max: 10
    tag:
      type: string
      constraints:
        regex: '^[a-z]+$'
",
    );
    ctx.load_types(&path).unwrap();

    let typei = ctx.instantiate("com.example.Job").unwrap();

    let good = Object::dictionary_from([
        ("priority", Object::int64(5)),
        ("tag", Object::string("build")),
    ]);
    let good = ctx.new_instance("com.example.Job", &good).unwrap();
    assert!(ctx.validate(&typei, &good).is_ok());

    let bad = Object::dictionary_from([
        ("priority", Object::int64(-3)),
        ("tag", Object::string("NOPE")),
    ]);
    let bad = ctx.new_instance("com.example.Job", &bad).unwrap();
    let errors = ctx.validate(&typei, &bad).unwrap_err();
    assert_eq!(errors.len(), 2);
}

#[test]
fn test_chain_load_across_files() {
    let ctx = TypingContext::new();
    let inner = write_idl(
        "
meta:
  version: 1
  namespace: com.a
struct Inner:
  members:
    x: int64
",
    );
    let outer = write_idl(
        "
meta:
  version: 1
  namespace: com.b
  use: [com.a]
struct Outer:
  members:
    inner: Inner
",
    );

    // Register the first file without parsing it; parsing the second
    // chain-loads the referenced type.
    ctx.load_file(&inner).unwrap();
    ctx.load_types(&outer).unwrap();

    assert!(ctx.find_type("com.a.Inner").is_some());
    let outer_ty = ctx.find_type("com.b.Outer").unwrap();
    assert_eq!(outer_ty.class, TypeClass::Struct);
}

#[test]
fn test_interface_and_arg_validation() {
    let ctx = TypingContext::new();
    let path = write_idl(
        "
meta:
  version: 1
  namespace: com.example
interface Calculator:
  description: Basic arithmetic
  method add:
    args:
      - {name: a, type: int64}
      - {name: b, type: int64}
    return: {type: int64}
",
    );
    ctx.load_types(&path).unwrap();

    let member = ctx
        .find_if_member("com.example.Calculator", "add")
        .unwrap();
    assert_eq!(member.arguments().unwrap().len(), 2);

    let good = Object::array_from([Object::int64(2), Object::int64(3)]);
    assert!(ctx.validate_args(&member, &good).is_ok());
    assert!(ctx.validate_return(&member, &Object::int64(5)).is_ok());

    let bad = Object::array_from([Object::string("x"), Object::int64(3)]);
    let errors = ctx.validate_args(&member, &bad).unwrap_err();
    let entry = errors.array_get(0).unwrap();
    assert_eq!(entry.dict_get("path").unwrap().as_str(), Some(".0"));
    assert_eq!(
        entry.dict_get("message").unwrap().as_str(),
        Some("Incompatible type string, should be int64")
    );

    assert_eq!(
        ctx.find_if_member("com.example.Calculator", "sub")
            .unwrap_err()
            .code,
        code::ENOENT
    );
    assert_eq!(
        ctx.find_if_member("com.example.Missing", "add")
            .unwrap_err()
            .code,
        code::ENOENT
    );
}

#[test]
fn test_typed_serialization_roundtrip() {
    let ctx = TypingContext::new();
    let path = write_idl(PAIR_IDL);
    ctx.load_types(&path).unwrap();

    let obj = Object::dictionary_from([("a", Object::int64(1)), ("b", Object::int64(2))]);
    let obj = ctx.new_instance("com.example.IntPair", &obj).unwrap();

    let wire = ctx.serialize(&obj).unwrap();
    assert_eq!(
        wire.dict_get("%type").unwrap().as_str(),
        Some("com.example.Pair<int64,int64>")
    );

    let back = ctx.deserialize(&wire).unwrap();
    assert_eq!(back, obj);
    assert_eq!(
        get_typei(&back).unwrap().canonical_form(),
        get_typei(&obj).unwrap().canonical_form()
    );
}

#[test]
fn test_load_types_dir() {
    let dir = std::env::temp_dir().join(format!(
        "lattice-idl-dir-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(dir.join("nested")).unwrap();
    fs::write(
        dir.join("pair.yaml"),
        "meta:\n  version: 1\n  namespace: com.d\nstruct P:\n  members:\n    x: int64\n",
    )
    .unwrap();
    fs::write(
        dir.join("nested/other.yaml"),
        "meta:\n  version: 1\n  namespace: com.e\nenum E:\n  members:\n    - up\n    - down\n",
    )
    .unwrap();
    fs::write(dir.join("ignored.txt"), "not idl").unwrap();

    let ctx = TypingContext::new();
    ctx.load_types_dir(&dir).unwrap();
    assert!(ctx.find_type("com.d.P").is_some());
    assert!(ctx.find_type("com.e.E").is_some());
}

#[test]
fn test_apply_iteration_stops_early() {
    let ctx = TypingContext::new();
    let mut seen = 0;
    let stopped = ctx.types_apply(|_ty| {
        seen += 1;
        seen < 3
    });
    assert!(stopped);
    assert_eq!(seen, 3);

    // The builtin table alone has more than three entries.
    let mut total = 0;
    assert!(!ctx.types_apply(|_ty| {
        total += 1;
        true
    }));
    assert!(total > 3);
}

#[test]
fn test_enum_value_field_helpers() {
    let ctx = TypingContext::new();
    let path = write_idl(
        "
meta:
  version: 1
  namespace: com.example
enum Light:
  members:
    - red
    - green
",
    );
    ctx.load_types(&path).unwrap();

    let red = ctx.new_instance("com.example.Light", &Object::string("red")).unwrap();
    let wire = ctx.serialize(&red).unwrap();
    assert_eq!(wire.dict_get("%value").unwrap().as_str(), Some("red"));

    let instance = ctx.deserialize(&wire).unwrap();
    assert_eq!(
        lattice_typing::get_value(&instance).unwrap().as_str(),
        Some("red")
    );

    lattice_typing::set_value(&instance, "green");
    assert_eq!(
        lattice_typing::get_value(&instance).unwrap().as_str(),
        Some("green")
    );

    let typei = ctx.instantiate("com.example.Light").unwrap();
    assert!(ctx.validate(&typei, &instance).is_ok());
}

#[test]
fn test_unknown_declared_type_deserializes_to_null() {
    let ctx = TypingContext::new();
    let wire = Object::dictionary_from([
        ("%type", Object::string("com.example.Vanished")),
        ("x", Object::int64(1)),
    ]);
    let back = ctx.deserialize(&wire).unwrap();
    assert!(back.is_null());
}
