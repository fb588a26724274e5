//! Per-operator emission spot checks across the supported opcode set,
//! plus rejection of everything outside it.

use wasm_x64::test_harness::*;
use wasm_x64::Error;

fn unop_body(ty_in: &str, ty_out: &str, op: &str) -> String {
    format!(
        r#"
        (module
            (func (export "main") (param {ty_in}) (result {ty_out})
                local.get 0
                {op}
            )
        )
        "#
    )
}

fn binop_body(ty: &str, op: &str, result: &str) -> String {
    format!(
        r#"
        (module
            (func (export "main") (param {ty} {ty}) (result {result})
                local.get 0
                local.get 1
                {op}
            )
        )
        "#
    )
}

fn assert_binop_emits(ty: &str, op: &str, result: &str, needle: &[u8]) {
    let f = compile_wat_function(&binop_body(ty, op, result))
        .unwrap_or_else(|e| panic!("{op}: {e}"));
    assert_contains_bytes(&f.code, needle, op);
}

#[test]
fn test_i32_arithmetic() {
    assert_binop_emits("i32", "i32.add", "i32", &[0x58, 0x01, 0x04, 0x24]);
    assert_binop_emits("i32", "i32.sub", "i32", &[0x58, 0x29, 0x04, 0x24]);
    assert_binop_emits("i32", "i32.and", "i32", &[0x58, 0x21, 0x04, 0x24]);
    assert_binop_emits("i32", "i32.or", "i32", &[0x58, 0x09, 0x04, 0x24]);
    assert_binop_emits("i32", "i32.xor", "i32", &[0x58, 0x31, 0x04, 0x24]);
    // pop rax; mul [rsp]; store the low half back
    assert_binop_emits("i32", "i32.mul", "i32", &[0x58, 0xF7, 0x24, 0x24, 0x89, 0x04, 0x24]);
}

#[test]
fn test_i64_arithmetic() {
    assert_binop_emits("i64", "i64.add", "i64", &[0x58, 0x48, 0x01, 0x04, 0x24]);
    assert_binop_emits("i64", "i64.sub", "i64", &[0x58, 0x48, 0x29, 0x04, 0x24]);
    assert_binop_emits("i64", "i64.and", "i64", &[0x58, 0x48, 0x21, 0x04, 0x24]);
    assert_binop_emits("i64", "i64.or", "i64", &[0x58, 0x48, 0x09, 0x04, 0x24]);
    assert_binop_emits("i64", "i64.xor", "i64", &[0x58, 0x48, 0x31, 0x04, 0x24]);
    assert_binop_emits(
        "i64",
        "i64.mul",
        "i64",
        &[0x58, 0x48, 0xF7, 0x24, 0x24, 0x48, 0x89, 0x04, 0x24],
    );
}

#[test]
fn test_division_setup() {
    // signed: sign-extend into rdx, idiv, quotient from rax
    assert_binop_emits(
        "i32",
        "i32.div_s",
        "i32",
        &[0x5F, 0x8B, 0x04, 0x24, 0x99, 0xF7, 0xFF, 0x89, 0x04, 0x24],
    );
    // unsigned: zero rdx, div
    assert_binop_emits(
        "i32",
        "i32.div_u",
        "i32",
        &[0x5F, 0x8B, 0x04, 0x24, 0x31, 0xD2, 0xF7, 0xF7, 0x89, 0x04, 0x24],
    );
    // remainders come from rdx
    assert_binop_emits(
        "i32",
        "i32.rem_s",
        "i32",
        &[0x5F, 0x8B, 0x04, 0x24, 0x99, 0xF7, 0xFF, 0x89, 0x14, 0x24],
    );
    assert_binop_emits(
        "i64",
        "i64.div_s",
        "i64",
        &[0x5F, 0x48, 0x8B, 0x04, 0x24, 0x48, 0x99, 0x48, 0xF7, 0xFF, 0x48, 0x89, 0x04, 0x24],
    );
    assert_binop_emits(
        "i64",
        "i64.rem_u",
        "i64",
        &[0x5F, 0x48, 0x8B, 0x04, 0x24, 0x48, 0x31, 0xD2, 0x48, 0xF7, 0xF7, 0x48, 0x89, 0x14, 0x24],
    );
}

#[test]
fn test_shifts() {
    // count popped into rcx, shift applied in place
    assert_binop_emits("i32", "i32.shl", "i32", &[0x59, 0xD3, 0x24, 0x24]);
    assert_binop_emits("i32", "i32.shr_s", "i32", &[0x59, 0xD3, 0x3C, 0x24]);
    assert_binop_emits("i32", "i32.shr_u", "i32", &[0x59, 0xD3, 0x2C, 0x24]);
    assert_binop_emits("i64", "i64.shl", "i64", &[0x59, 0x48, 0xD3, 0x24, 0x24]);
    assert_binop_emits("i64", "i64.shr_s", "i64", &[0x59, 0x48, 0xD3, 0x3C, 0x24]);
    assert_binop_emits("i64", "i64.shr_u", "i64", &[0x59, 0x48, 0xD3, 0x2C, 0x24]);
}

#[test]
fn test_i32_eqz() {
    let f = compile_wat_function(&unop_body("i32", "i32", "i32.eqz")).expect("compile");
    #[rustfmt::skip]
    assert_contains_bytes(
        &f.code,
        &[
            0x31, 0xC0,             // xor eax, eax
            0x83, 0x3C, 0x24, 0x00, // cmp dword [rsp], 0
            0x0F, 0x94, 0xC0,       // sete al
            0x89, 0x04, 0x24,       // mov [rsp], eax
        ],
        "i32.eqz",
    );
}

#[test]
fn test_i32_comparisons() {
    // pop rhs into rdi, zero rax, compare against the lhs slot, setcc
    assert_binop_emits(
        "i32",
        "i32.eq",
        "i32",
        &[0x5F, 0x31, 0xC0, 0x39, 0x3C, 0x24, 0x0F, 0x94, 0xC0, 0x89, 0x04, 0x24],
    );
    assert_binop_emits("i32", "i32.ne", "i32", &[0x0F, 0x95, 0xC0]);
    assert_binop_emits("i32", "i32.lt_s", "i32", &[0x0F, 0x9C, 0xC0]);
    assert_binop_emits("i32", "i32.lt_u", "i32", &[0x0F, 0x92, 0xC0]);
    assert_binop_emits("i32", "i32.gt_s", "i32", &[0x0F, 0x9F, 0xC0]);
    assert_binop_emits("i32", "i32.gt_u", "i32", &[0x0F, 0x97, 0xC0]);
    assert_binop_emits("i32", "i32.le_s", "i32", &[0x0F, 0x9E, 0xC0]);
    assert_binop_emits("i32", "i32.le_u", "i32", &[0x0F, 0x96, 0xC0]);
    assert_binop_emits("i32", "i32.ge_s", "i32", &[0x0F, 0x9D, 0xC0]);
}

#[test]
fn test_i64_comparisons() {
    // 64-bit compare, 64-bit store of the i32 result to clear the slot
    assert_binop_emits(
        "i64",
        "i64.lt_u",
        "i32",
        &[0x5F, 0x48, 0x31, 0xC0, 0x48, 0x39, 0x3C, 0x24, 0x0F, 0x92, 0xC0, 0x48, 0x89, 0x04, 0x24],
    );
    assert_binop_emits("i64", "i64.eq", "i32", &[0x0F, 0x94, 0xC0]);
    assert_binop_emits("i64", "i64.ge_s", "i32", &[0x0F, 0x9D, 0xC0]);
}

#[test]
fn test_f64_comparisons() {
    // eq: unordered must yield 0 (setnp + cmovne)
    assert_binop_emits(
        "f64",
        "f64.eq",
        "i32",
        &[0x31, 0xD2, 0x66, 0x0F, 0x2E, 0x04, 0x24, 0x0F, 0x9B, 0xC0, 0x0F, 0x45, 0xC2],
    );
    // ne: unordered must yield 1 (edx preloaded with 1, setp)
    assert_binop_emits(
        "f64",
        "f64.ne",
        "i32",
        &[0xBA, 0x01, 0x00, 0x00, 0x00, 0x66, 0x0F, 0x2E, 0x04, 0x24, 0x0F, 0x9A, 0xC0, 0x0F, 0x45, 0xC2],
    );
}

#[test]
fn test_f64_arithmetic() {
    // rhs into xmm1, pop, lhs into xmm0, operate, write back
    #[rustfmt::skip]
    let add = [
        0xF2, 0x0F, 0x10, 0x0C, 0x24, // movsd xmm1, [rsp]
        0x48, 0x83, 0xC4, 0x08,       // add rsp, 8
        0xF2, 0x0F, 0x10, 0x04, 0x24, // movsd xmm0, [rsp]
        0xF2, 0x0F, 0x58, 0xC1,       // addsd xmm0, xmm1
        0xF2, 0x0F, 0x11, 0x04, 0x24, // movsd [rsp], xmm0
    ];
    assert_binop_emits("f64", "f64.add", "f64", &add);
    assert_binop_emits("f64", "f64.sub", "f64", &[0xF2, 0x0F, 0x5C, 0xC1]);
    assert_binop_emits("f64", "f64.mul", "f64", &[0xF2, 0x0F, 0x59, 0xC1]);

    let f = compile_wat_function(&unop_body("f64", "f64", "f64.neg")).expect("compile");
    assert_contains_bytes(&f.code, &[0x48, 0x0F, 0xBA, 0x3C, 0x24, 0x3F], "sign-bit flip");
}

#[test]
fn test_conversions() {
    let f = compile_wat_function(&unop_body("i64", "i32", "i32.wrap_i64")).expect("compile");
    assert_contains_bytes(
        &f.code,
        &[0x8B, 0x04, 0x24, 0x48, 0x89, 0x04, 0x24],
        "wrap clears the upper half",
    );

    let f = compile_wat_function(&unop_body("f64", "i32", "i32.trunc_f64_s")).expect("compile");
    assert_contains_bytes(&f.code, &[0xF2, 0x0F, 0x2C, 0x04, 0x24], "32-bit truncation");

    let f = compile_wat_function(&unop_body("f64", "i32", "i32.trunc_f64_u")).expect("compile");
    assert_contains_bytes(
        &f.code,
        &[0xF2, 0x48, 0x0F, 0x2C, 0x04, 0x24],
        "64-bit truncation covers u32",
    );

    let f = compile_wat_function(&unop_body("i32", "i64", "i64.extend_i32_s")).expect("compile");
    assert_contains_bytes(
        &f.code,
        &[0x48, 0x63, 0x04, 0x24, 0x48, 0x89, 0x04, 0x24],
        "sign extension",
    );

    let f = compile_wat_function(&unop_body("i32", "f64", "f64.convert_i32_s")).expect("compile");
    assert_contains_bytes(
        &f.code,
        &[0xF2, 0x0F, 0x2A, 0x04, 0x24, 0xF2, 0x0F, 0x11, 0x04, 0x24],
        "signed int to double",
    );

    let f = compile_wat_function(&unop_body("i32", "f64", "f64.convert_i32_u")).expect("compile");
    assert_contains_bytes(
        &f.code,
        &[0x8B, 0x04, 0x24, 0xF2, 0x48, 0x0F, 0x2A, 0xC0],
        "unsigned int through the 64-bit form",
    );
}

#[test]
fn test_noop_conversions_emit_nothing() {
    let identity = compile_wat_function(&unop_body("i32", "i32", "")).expect("compile");
    let extend_u = compile_wat_function(&unop_body("i32", "i64", "i64.extend_i32_u")).expect("compile");
    assert_eq!(identity.code.len(), extend_u.code.len(), "zero-extension is free");

    // compare against same-result baselines so the epilogues match
    let const_body = |result: &str, init: &str, op: &str| {
        format!(
            r#"
            (module
                (func (export "main") (result {result})
                    {init}
                    {op}
                )
            )
            "#
        )
    };
    let baseline = compile_wat_function(&const_body("i64", "i64.const 0", "")).expect("compile");
    let reinterp =
        compile_wat_function(&const_body("i64", "f64.const 0", "i64.reinterpret_f64"))
            .expect("compile");
    assert_eq!(baseline.code.len(), reinterp.code.len(), "reinterpret is free");

    let baseline = compile_wat_function(&const_body("f64", "f64.const 0", "")).expect("compile");
    let reinterp =
        compile_wat_function(&const_body("f64", "i64.const 0", "f64.reinterpret_i64"))
            .expect("compile");
    assert_eq!(baseline.code.len(), reinterp.code.len(), "reinterpret is free");
}

#[test]
fn test_unreachable_and_drop() {
    let f = compile_wat_function(
        r#"
        (module
            (func (export "main") (result i32)
                i32.const 1
                drop
                unreachable
            )
        )
        "#,
    )
    .expect("compile");
    assert_contains_bytes(&f.code, &[0x48, 0x83, 0xC4, 0x08, 0x0F, 0x0B], "drop then ud2");
}

#[test]
fn test_negative_i32_const_keeps_slot_clean() {
    let f = compile_wat_function(
        r#"
        (module
            (func (export "main") (result i32)
                i32.const -1
            )
        )
        "#,
    )
    .expect("compile");
    // not push imm32 (sign-extension would set the upper half)
    assert_eq!(find_bytes(&f.code, &[0x68]), None);
    assert_contains_bytes(&f.code, &[0xB8, 0xFF, 0xFF, 0xFF, 0xFF, 0x50], "zero-extending move");
}

#[test]
fn test_globals() {
    let module = compile_wat(
        r#"
        (module
            (global $g (mut i32) (i32.const 0))
            (global $h (mut i64) (i64.const 0))
            (func (export "set") (param i32)
                local.get 0
                global.set $g
            )
            (func (export "get") (result i64)
                global.get $h
            )
        )
        "#,
    )
    .expect("compile");

    let set = &module.functions[0];
    // pop rdx; mov rax, <global>; mov [rax], edx
    assert_contains_bytes(&set.code, &[0x5A], "pop value");
    assert_contains_bytes(&set.code, &[0x89, 0x10], "32-bit store into the value union");
    assert_eq!(set.relocs.len(), 1);
    assert_eq!(set.relocs[0].index, 0);

    let get = &module.functions[1];
    assert_contains_bytes(&get.code, &[0x48, 0x8B, 0x00, 0x50], "64-bit load and push");
    assert_eq!(get.relocs[0].index, 1);
}

#[test]
fn test_unsupported_opcodes_are_rejected() {
    for (body, sig) in [
        ("local.get 0 local.get 1 i32.ge_u", "(param i32 i32) (result i32)"),
        ("local.get 0 i32.popcnt", "(param i32) (result i32)"),
        ("local.get 0 local.get 1 f64.div", "(param f64 f64) (result f64)"),
        ("local.get 0 f32.abs", "(param f32) (result f32)"),
        ("local.get 0 i64.eqz", "(param i64) (result i32)"),
    ] {
        let wat = format!(
            r#"
            (module
                (func (export "main") {sig}
                    {body}
                )
            )
            "#
        );
        let err = compile_wat(&wat).expect_err(body);
        assert!(
            matches!(err, Error::Unsupported(_)),
            "{body}: expected Unsupported, got {err:?}"
        );
    }
}
