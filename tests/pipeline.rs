//! End-to-end pipeline tests over in-memory script blobs.

use gscdec::emit::formatter_of;
use gscdec::flow::StepSkip;
use gscdec::hash::{hash32, HashIndex};
use gscdec::opcode::{default_registry, Opcode, OpcodeRegistry};
use gscdec::process::{process_data, Options, RunState};
use gscdec::rosetta::RosettaSink;
use gscdec::vm::{Platform, VM_MW23, VM_T8};

const T8_MAGIC: u64 = 0x36000a0d43534780;
const MW23_MAGIC: u64 = 0x00000a0d4353478a;

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}
fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}
fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Code assembler mirroring the walker's operand alignment rules.
struct Asm {
    out: Vec<u8>,
    reg: OpcodeRegistry,
    vm: u8,
    short: bool,
}

impl Asm {
    fn t8() -> Self {
        Self {
            out: Vec::new(),
            reg: default_registry(),
            vm: VM_T8,
            short: true,
        }
    }

    fn mw23() -> Self {
        Self {
            out: Vec::new(),
            reg: default_registry(),
            vm: VM_MW23,
            short: false,
        }
    }

    fn pad_to(&mut self, align: usize) {
        while self.out.len() % align != 0 {
            self.out.push(0);
        }
    }

    fn op(&mut self, op: Opcode) -> &mut Self {
        if self.short {
            self.pad_to(2);
            let code = self.reg.encoding(self.vm, Platform::Pc, op).unwrap();
            self.out.extend_from_slice(&code.to_le_bytes());
        } else {
            let code = self.reg.encoding(self.vm, Platform::Pc, op).unwrap();
            self.out.push(code as u8);
        }
        self
    }

    fn u8(&mut self, v: u8) -> &mut Self {
        self.out.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        if self.short {
            self.pad_to(2);
        }
        self.out.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn i16(&mut self, v: i16) -> &mut Self {
        self.u16(v as u16)
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        if self.short {
            self.pad_to(4);
        }
        self.out.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u64(&mut self, v: u64) -> &mut Self {
        if self.short {
            self.pad_to(8);
        }
        self.out.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn here(&self) -> u32 {
        self.out.len() as u32
    }
}

#[derive(Default, Clone)]
struct ExportSpec {
    namespace: u32,
    name: u32,
    param_count: u8,
    flags: u8,
}

/// Assembles a complete T8 container around prebuilt code chunks. Fixups are
/// `(export index, code-relative offset)` pairs resolved once the final code
/// base is known.
#[derive(Default)]
struct T8Blob {
    name: u64,
    includes: Vec<u64>,
    strings: Vec<(String, Vec<(usize, u32)>)>,
    imports: Vec<(u32, u32, u8, u8, Vec<(usize, u32)>)>,
    globals: Vec<(u32, Vec<(usize, u32)>)>,
    exports: Vec<(ExportSpec, Vec<u8>)>,
}

impl T8Blob {
    fn build(&self) -> Vec<u8> {
        const HDR: usize = 0x60;
        let mut buf = vec![0u8; HDR];
        put_u64(&mut buf, 0, T8_MAGIC);
        put_u64(&mut buf, 0x10, self.name);

        // includes
        let include_offset = buf.len();
        for inc in &self.includes {
            buf.extend_from_slice(&inc.to_le_bytes());
        }

        // string literals
        let mut literal_offsets = Vec::new();
        for (text, _) in &self.strings {
            literal_offsets.push(buf.len() as u32);
            buf.push(0x80);
            buf.push(text.len() as u8 + 1);
            buf.extend_from_slice(text.as_bytes());
            buf.push(0);
        }

        // code chunks, each 8-aligned; addresses known before the tables are
        // written because tables need the resolved fixup offsets
        let mut table_sizes = 0usize;
        for (_, fixups) in &self.strings {
            table_sizes += 8 + fixups.len() * 4;
        }
        for (_, _, _, _, fixups) in &self.imports {
            table_sizes += 12 + fixups.len() * 4;
        }
        for (_, fixups) in &self.globals {
            table_sizes += 8 + fixups.len() * 4;
        }
        table_sizes += self.exports.len() * 0x18;

        let mut code_base = buf.len() + table_sizes;
        code_base = (code_base + 7) & !7;
        let mut addresses = Vec::new();
        let mut cursor = code_base;
        for (_, code) in &self.exports {
            addresses.push(cursor as u32);
            cursor += code.len();
            cursor = (cursor + 7) & !7;
        }
        let resolve = |(export, rel): (usize, u32)| addresses[export] + rel;

        // strings table
        let string_offset = buf.len();
        for (i, (_, fixups)) in self.strings.iter().enumerate() {
            let mut entry = vec![0u8; 8];
            put_u32(&mut entry, 0, literal_offsets[i]);
            entry[4] = fixups.len() as u8;
            entry[5] = 0x80;
            buf.extend_from_slice(&entry);
            for &f in fixups {
                buf.extend_from_slice(&resolve(f).to_le_bytes());
            }
        }

        // imports table
        let imports_offset = buf.len();
        for (name, namespace, params, flags, fixups) in &self.imports {
            let mut entry = vec![0u8; 12];
            put_u32(&mut entry, 0, *name);
            put_u32(&mut entry, 4, *namespace);
            put_u16(&mut entry, 8, fixups.len() as u16);
            entry[10] = *params;
            entry[11] = *flags;
            buf.extend_from_slice(&entry);
            for &f in fixups {
                buf.extend_from_slice(&resolve(f).to_le_bytes());
            }
        }

        // globals table
        let globals_offset = buf.len();
        for (name, fixups) in &self.globals {
            let mut entry = vec![0u8; 8];
            put_u32(&mut entry, 0, *name);
            put_u16(&mut entry, 4, fixups.len() as u16);
            buf.extend_from_slice(&entry);
            for &f in fixups {
                buf.extend_from_slice(&resolve(f).to_le_bytes());
            }
        }

        // exports table
        let export_offset = buf.len();
        for (i, (spec, _)) in self.exports.iter().enumerate() {
            let mut entry = vec![0u8; 0x18];
            put_u32(&mut entry, 0x04, addresses[i]);
            put_u32(&mut entry, 0x08, spec.name);
            put_u32(&mut entry, 0x0C, spec.namespace);
            entry[0x14] = spec.param_count;
            entry[0x15] = spec.flags;
            buf.extend_from_slice(&entry);
        }

        // code
        while buf.len() < code_base {
            buf.push(0);
        }
        for (_, code) in &self.exports {
            buf.extend_from_slice(code);
            while buf.len() % 8 != 0 {
                buf.push(0);
            }
        }

        // header fields
        put_u32(&mut buf, 0x18, include_offset as u32);
        put_u16(&mut buf, 0x1C, self.strings.len() as u16);
        put_u16(&mut buf, 0x1E, self.exports.len() as u16);
        put_u16(&mut buf, 0x20, self.includes.len() as u16);
        put_u16(&mut buf, 0x22, self.imports.len() as u16);
        put_u32(&mut buf, 0x24, string_offset as u32);
        put_u32(&mut buf, 0x28, imports_offset as u32);
        put_u16(&mut buf, 0x2C, self.globals.len() as u16);
        put_u32(&mut buf, 0x30, globals_offset as u32);
        put_u32(&mut buf, 0x34, export_offset as u32);
        let total = buf.len() as u32;
        put_u32(&mut buf, 0x40, total);
        put_u32(&mut buf, 0x48, code_base as u32);
        put_u32(&mut buf, 0x4C, total - code_base as u32);
        buf
    }
}

fn run_state() -> RunState {
    RunState {
        hash: HashIndex::new(false),
        registry: default_registry(),
        rosetta: RosettaSink::new(false),
        dumped_strings: Default::default(),
    }
}

fn options() -> Options {
    Options {
        header: true,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// scenario 1: minimal blob, one End-only export

#[test]
fn minimal_blob_empty_function() {
    let mut asm = Asm::t8();
    asm.op(Opcode::End);
    let blob = T8Blob {
        name: 0x1234,
        exports: vec![(
            ExportSpec {
                namespace: 0,
                name: 0x555,
                ..Default::default()
            },
            asm.out.clone(),
        )],
        ..Default::default()
    };
    let mut state = run_state();
    let out = process_data(blob.build(), "test.gscc", &options(), &mut state).unwrap();

    assert!(out.contains("// magic .... 0x36000a0d43534780"), "{}", out);
    assert!(!out.contains("#namespace"), "{}", out);
    assert!(out.contains("function function_555()"), "{}", out);
    assert!(out.contains("{\n}"), "{}", out);
    assert!(!out.contains("#using"), "{}", out);
}

// ---------------------------------------------------------------------------
// scenario 2: one include

#[test]
fn include_emits_using_line() {
    let mut asm = Asm::t8();
    asm.op(Opcode::End);
    let blob = T8Blob {
        name: 0x1234,
        includes: vec![0xDEADBEEF],
        exports: vec![(
            ExportSpec {
                name: 0x555,
                ..Default::default()
            },
            asm.out.clone(),
        )],
        ..Default::default()
    };
    let mut state = run_state();
    let out = process_data(blob.build(), "test.gscc", &options(), &mut state).unwrap();
    let using = out.find("#using script_deadbeef;").expect("missing #using line");
    let func = out.find("function function_555").unwrap();
    assert!(using < func, "#using must precede the first function: {}", out);
}

// ---------------------------------------------------------------------------
// scenario 3: wide-hash single animtree patching

#[test]
fn mw23_single_animtree() {
    // code: GetAnimTree <slot>; DecTop; End
    let mut asm = Asm::mw23();
    asm.op(Opcode::GetAnimTree);
    let slot_rel = asm.here();
    asm.u8(0xEE); // placeholder patched to the interned index
    asm.op(Opcode::DecTop);
    asm.op(Opcode::End);

    const HDR: usize = 0x68;
    let mut buf = vec![0u8; HDR];
    put_u64(&mut buf, 0, MW23_MAGIC);
    put_u64(&mut buf, 0x08, 0x9999);

    // literal
    let literal = buf.len() as u32;
    buf.extend_from_slice(b"generic\0");

    // animtree-single table: count, address, fixups
    let animtree_offset = buf.len() as u32;
    let code_base = (buf.len() + 8 + 4 + 0x28 + 7) & !7;
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.extend_from_slice(&literal.to_le_bytes());
    buf.extend_from_slice(&((code_base as u32) + slot_rel).to_le_bytes());

    // export table
    let export_offset = buf.len() as u32;
    let mut entry = vec![0u8; 0x28];
    put_u64(&mut entry, 0x00, 0x77); // namespace
    put_u64(&mut entry, 0x08, 0x88); // name
    put_u32(&mut entry, 0x20, code_base as u32);
    buf.extend_from_slice(&entry);

    while buf.len() < code_base {
        buf.push(0);
    }
    buf.extend_from_slice(&asm.out);

    put_u32(&mut buf, 0x38, animtree_offset);
    put_u16(&mut buf, 0x3C, 1); // animtree_use_count
    put_u32(&mut buf, 0x34, export_offset);
    put_u16(&mut buf, 0x32, 1); // export_count
    put_u32(&mut buf, 0x44, code_base as u32);
    let total = buf.len() as u32;
    put_u32(&mut buf, 0x48, total);
    put_u32(&mut buf, 0x4C, total - code_base as u32);

    let patched_at = code_base + slot_rel as usize;
    let mut state = run_state();
    let mut opts = options();
    opts.vm = Some(VM_MW23);
    let out = process_data(buf.clone(), "test.gscc", &opts, &mut state).unwrap();

    assert!(out.contains("#using animtree(\"generic\");"), "{}", out);
    assert!(out.contains("#animtree(\"generic\");"), "{}", out);
    let _ = patched_at;
}

// ---------------------------------------------------------------------------
// scenario 4: boolean return collapse

#[test]
fn bool_return_collapses_to_expression() {
    let x = hash32("x");
    let mut asm = Asm::t8();
    asm.op(Opcode::SafeCreateLocalVariables).u8(1);
    asm.u32(x).u8(0);
    asm.op(Opcode::EvalLocalVariableCached).u8(0);
    asm.op(Opcode::JumpOnFalse);
    // delta written once the target is known
    let delta_pos = {
        asm.pad_to(2);
        let p = asm.here();
        asm.i16(0);
        p
    };
    let after_jump = asm.here();
    asm.op(Opcode::GetByte).u8(1);
    asm.op(Opcode::Return);
    asm.pad_to(2);
    let target = asm.here();
    asm.op(Opcode::GetZero);
    asm.op(Opcode::Return);
    let delta = (target - after_jump) as i16;
    asm.out[delta_pos as usize..delta_pos as usize + 2].copy_from_slice(&delta.to_le_bytes());

    let blob = T8Blob {
        name: 0x1234,
        exports: vec![(
            ExportSpec {
                name: 0x600,
                param_count: 1,
                ..Default::default()
            },
            asm.out.clone(),
        )],
        ..Default::default()
    };
    let mut state = run_state();
    state.hash.add("x");
    let out = process_data(blob.build(), "test.gscc", &options(), &mut state).unwrap();

    assert!(out.contains("function function_600(x)"), "{}", out);
    assert!(out.contains("return x;"), "{}", out);
    assert!(!out.contains("if ("), "{}", out);
    assert!(!out.contains("else"), "{}", out);
}

// ---------------------------------------------------------------------------
// scenario 5: vtable export

fn t8_vtable_code(class: u32, method: u32, uid: u32) -> Vec<u8> {
    let mut asm = Asm::t8();
    asm.op(Opcode::CheckClearParams);
    asm.op(Opcode::PreScriptCall);
    asm.op(Opcode::ScriptFunctionCall);
    asm.u8(0);
    asm.u64(0x73717731); // spawnstruct name pair
    asm.op(Opcode::GetZero);
    asm.op(Opcode::GetGlobalObject);
    asm.u16(0);
    asm.op(Opcode::EvalFieldVariableRef);
    asm.u32(class);
    asm.op(Opcode::EvalArrayRef);
    asm.op(Opcode::SetVariableField);

    asm.op(Opcode::GetResolveFunction);
    asm.u64(((class as u64) << 32) | method as u64);
    asm.op(Opcode::GetUnsignedInteger);
    asm.u32(uid);
    asm.op(Opcode::GetZero);
    asm.op(Opcode::EvalGlobalObjectFieldVariable);
    asm.u16(0);
    asm.u32(class);
    asm.op(Opcode::EvalArray);
    asm.op(Opcode::CastFieldObject);
    asm.op(Opcode::EvalFieldVariableRef);
    asm.u32(hash32("__vtable"));
    asm.op(Opcode::EvalArrayRef);
    asm.op(Opcode::SetVariableField);

    asm.op(Opcode::End);
    asm.out
}

#[test]
fn vtable_export_recovers_class() {
    let class = 0x00C1A55;
    let method = 0xABCD;
    let ns = 0x4242;

    // the bound method as a class-member export: CheckClearParams; End
    let mut method_code = Asm::t8();
    method_code.op(Opcode::CheckClearParams);
    method_code.op(Opcode::End);

    let blob = T8Blob {
        name: 0x1234,
        globals: vec![(hash32("classes"), Vec::new())],
        exports: vec![
            (
                ExportSpec {
                    namespace: ns,
                    name: class,
                    flags: 0x15, // CLASS_VTABLE
                    ..Default::default()
                },
                t8_vtable_code(class, method, 0xA5A5),
            ),
            (
                ExportSpec {
                    namespace: class,
                    name: method,
                    flags: 0x08, // CLASS_MEMBER
                    ..Default::default()
                },
                method_code.out.clone(),
            ),
        ],
        ..Default::default()
    };
    let mut state = run_state();
    let out = process_data(blob.build(), "test.gscc", &options(), &mut state).unwrap();

    assert!(out.contains("class class_c1a55"), "{}", out);
    assert!(out.contains("function function_abcd()"), "{}", out);
    assert!(out.contains("0xa5a5 -> &class_c1a55::function_abcd;"), "{}", out);
    // no empty constructor/destructor stubs
    assert!(!out.contains("constructor"), "{}", out);
    assert!(!out.contains("destructor"), "{}", out);
}

// ---------------------------------------------------------------------------
// scenario 6: corrupted magic

#[test]
fn corrupted_magic_is_fatal_for_the_file() {
    let mut asm = Asm::t8();
    asm.op(Opcode::End);
    let blob = T8Blob {
        name: 0x1234,
        exports: vec![(ExportSpec::default(), asm.out.clone())],
        ..Default::default()
    };
    let mut data = blob.build();
    data[1] = 0xFF;
    let mut state = run_state();
    let err = process_data(data, "bad.gscc", &options(), &mut state).unwrap_err();
    assert!(format!("{:#}", err).contains("bad magic"), "{:#}", err);
}

// ---------------------------------------------------------------------------
// link patching details

#[test]
fn string_fixups_are_rewritten_to_interned_index() {
    // x = "hello"; end
    let x = hash32("x");
    let mut asm = Asm::t8();
    asm.op(Opcode::SafeCreateLocalVariables).u8(1);
    asm.u32(x).u8(0);
    asm.op(Opcode::GetString);
    let operand_rel = {
        asm.pad_to(4);
        let p = asm.here();
        asm.u32(0xFFFF_FFFF); // placeholder
        p
    };
    asm.op(Opcode::SetLocalVariableCached).u8(0);
    asm.op(Opcode::End);

    let blob = T8Blob {
        name: 0x1234,
        strings: vec![("hello".into(), vec![(0, operand_rel)])],
        exports: vec![(
            ExportSpec {
                name: 0x700,
                ..Default::default()
            },
            asm.out.clone(),
        )],
        ..Default::default()
    };
    let mut state = run_state();
    state.hash.add("x");
    let out = process_data(blob.build(), "test.gscc", &options(), &mut state).unwrap();
    assert!(out.contains("x = \"hello\";"), "{}", out);
    assert!(state.dumped_strings.contains("hello"));
}

#[test]
fn get_call_import_has_no_namespace() {
    // foo("hello-like arg"): PreScriptCall; GetByte 9; CallBuiltinFunction
    let mut asm = Asm::t8();
    asm.op(Opcode::PreScriptCall);
    asm.op(Opcode::GetByte).u8(9);
    let call_rel = {
        asm.pad_to(2);
        asm.here()
    };
    asm.op(Opcode::CallBuiltinFunction);
    asm.u8(0xEE); // arity placeholder, patched from the import entry
    asm.u64(0); // name pair placeholder
    asm.op(Opcode::DecTop);
    asm.op(Opcode::End);

    let blob = T8Blob {
        name: 0x1234,
        imports: vec![(0xF00, 0xBAD, 1, 0x02 | 0x20, vec![(0, call_rel)])], // FUNCTION | GET_CALL
        exports: vec![(
            ExportSpec {
                name: 0x701,
                ..Default::default()
            },
            asm.out.clone(),
        )],
        ..Default::default()
    };
    let mut state = run_state();
    let out = process_data(blob.build(), "test.gscc", &options(), &mut state).unwrap();
    assert!(out.contains("function_f00(9);"), "{}", out);
    assert!(!out.contains("namespace_bad::"), "{}", out);
}

#[test]
fn namespaced_import_keeps_prefix() {
    let mut asm = Asm::t8();
    asm.op(Opcode::PreScriptCall);
    let call_rel = {
        asm.pad_to(2);
        asm.here()
    };
    asm.op(Opcode::ScriptFunctionCall);
    asm.u8(0xEE);
    asm.u64(0);
    asm.op(Opcode::DecTop);
    asm.op(Opcode::End);

    let blob = T8Blob {
        name: 0x1234,
        imports: vec![(0xF01, 0xBAD, 0, 0x02, vec![(0, call_rel)])], // FUNCTION
        exports: vec![(
            ExportSpec {
                name: 0x702,
                ..Default::default()
            },
            asm.out.clone(),
        )],
        ..Default::default()
    };
    let mut state = run_state();
    let out = process_data(blob.build(), "test.gscc", &options(), &mut state).unwrap();
    assert!(out.contains("namespace_bad::function_f01();"), "{}", out);
}

#[test]
fn ignore_all_leaves_raw_asm_fallback() {
    // an if pattern with the passes disabled cannot be structured, so the
    // export falls back to a gscasm block
    let x = hash32("x");
    let mut asm = Asm::t8();
    asm.op(Opcode::SafeCreateLocalVariables).u8(1);
    asm.u32(x).u8(0);
    asm.op(Opcode::EvalLocalVariableCached).u8(0);
    asm.op(Opcode::JumpOnFalse);
    let delta_pos = {
        asm.pad_to(2);
        let p = asm.here();
        asm.i16(0);
        p
    };
    let after = asm.here();
    asm.op(Opcode::GetByte).u8(1);
    asm.op(Opcode::Return);
    asm.pad_to(2);
    let target = asm.here();
    asm.op(Opcode::End);
    let delta = (target - after) as i16;
    asm.out[delta_pos as usize..delta_pos as usize + 2].copy_from_slice(&delta.to_le_bytes());

    let blob = T8Blob {
        name: 0x1234,
        exports: vec![(
            ExportSpec {
                name: 0x800,
                param_count: 1,
                ..Default::default()
            },
            asm.out.clone(),
        )],
        ..Default::default()
    };
    let mut state = run_state();
    let mut opts = options();
    opts.skip = StepSkip::all();
    let out = process_data(blob.build(), "test.gscc", &opts, &mut state).unwrap();
    assert!(out.contains("gscasm {"), "{}", out);
    assert!(out.contains("JumpOnFalse"), "{}", out);
}

#[test]
fn formatter_changes_brace_placement() {
    let x = hash32("x");
    let mut asm = Asm::t8();
    asm.op(Opcode::SafeCreateLocalVariables).u8(1);
    asm.u32(x).u8(0);
    asm.op(Opcode::EvalLocalVariableCached).u8(0);
    asm.op(Opcode::JumpOnFalse);
    let delta_pos = {
        asm.pad_to(2);
        let p = asm.here();
        asm.i16(0);
        p
    };
    let after = asm.here();
    asm.op(Opcode::GetByte).u8(1);
    asm.op(Opcode::SetLocalVariableCached).u8(0);
    asm.pad_to(2);
    let target = asm.here();
    asm.op(Opcode::End);
    let delta = (target - after) as i16;
    asm.out[delta_pos as usize..delta_pos as usize + 2].copy_from_slice(&delta.to_le_bytes());

    let blob = T8Blob {
        name: 0x1234,
        exports: vec![(
            ExportSpec {
                name: 0x801,
                param_count: 1,
                ..Default::default()
            },
            asm.out.clone(),
        )],
        ..Default::default()
    };
    let mut state = run_state();
    state.hash.add("x");
    let mut opts = options();
    opts.formatter = formatter_of("bo");
    let out = process_data(blob.build(), "test.gscc", &opts, &mut state).unwrap();
    assert!(out.contains("if (x)\n"), "{}", out);
}

#[test]
fn switch_jump_table_reconstruction() {
    let x = hash32("x");
    let mut asm = Asm::t8();
    asm.op(Opcode::SafeCreateLocalVariables).u8(1);
    asm.u32(x).u8(0);
    asm.op(Opcode::EvalLocalVariableCached).u8(0);
    asm.op(Opcode::Switch);
    let switch_delta_pos = {
        asm.pad_to(4);
        let p = asm.here();
        asm.u32(0);
        p
    };
    let after_switch = asm.here();

    // case 1: x = 1; break
    asm.pad_to(2);
    let case1 = asm.here();
    asm.op(Opcode::GetByte).u8(1);
    asm.op(Opcode::SetLocalVariableCached).u8(0);
    asm.op(Opcode::Jump);
    let break1_pos = {
        asm.pad_to(2);
        let p = asm.here();
        asm.i16(0);
        p
    };
    let after_break1 = asm.here();

    // case 2: x = 2; break
    asm.pad_to(2);
    let case2 = asm.here();
    asm.op(Opcode::GetByte).u8(2);
    asm.op(Opcode::SetLocalVariableCached).u8(0);
    asm.op(Opcode::Jump);
    let break2_pos = {
        asm.pad_to(2);
        let p = asm.here();
        asm.i16(0);
        p
    };
    let after_break2 = asm.here();

    // jump table
    asm.pad_to(2);
    let table = asm.here();
    asm.op(Opcode::EndSwitch);
    asm.pad_to(4);
    asm.u32(2); // case count
    asm.pad_to(8);
    asm.u64(1); // tag 0: int key 1
    asm.u32(case1);
    asm.u32(0);
    asm.u64(2);
    asm.u32(case2);
    asm.u32(0);
    let end = asm.here();
    asm.op(Opcode::End);

    let switch_delta = (table as i32 - after_switch as i32) as u32;
    asm.out[switch_delta_pos as usize..switch_delta_pos as usize + 4]
        .copy_from_slice(&switch_delta.to_le_bytes());
    let d1 = (end as i32 - after_break1 as i32) as i16;
    asm.out[break1_pos as usize..break1_pos as usize + 2].copy_from_slice(&d1.to_le_bytes());
    let d2 = (end as i32 - after_break2 as i32) as i16;
    asm.out[break2_pos as usize..break2_pos as usize + 2].copy_from_slice(&d2.to_le_bytes());

    let blob = T8Blob {
        name: 0x1234,
        exports: vec![(
            ExportSpec {
                name: 0x802,
                param_count: 1,
                ..Default::default()
            },
            asm.out.clone(),
        )],
        ..Default::default()
    };
    let mut state = run_state();
    state.hash.add("x");
    let out = process_data(blob.build(), "test.gscc", &options(), &mut state).unwrap();

    assert!(out.contains("switch (x)"), "{}", out);
    assert!(out.contains("case 1:"), "{}", out);
    assert!(out.contains("case 2:"), "{}", out);
    assert!(out.contains("break;"), "{}", out);
    assert!(out.contains("x = 2;"), "{}", out);
    assert!(!out.contains("gscasm"), "{}", out);
}

#[test]
fn rloc_annotations_in_decompiled_output() {
    let x = hash32("x");
    let mut asm = Asm::t8();
    asm.op(Opcode::SafeCreateLocalVariables).u8(1);
    asm.u32(x).u8(0);
    asm.op(Opcode::GetByte).u8(7);
    asm.op(Opcode::SetLocalVariableCached).u8(0);
    asm.op(Opcode::End);

    let blob = T8Blob {
        name: 0x1234,
        exports: vec![(
            ExportSpec {
                name: 0x803,
                param_count: 1,
                ..Default::default()
            },
            asm.out.clone(),
        )],
        ..Default::default()
    };
    let mut state = run_state();
    state.hash.add("x");
    let mut opts = options();
    opts.func_rloc = true;
    let out = process_data(blob.build(), "test.gscc", &opts, &mut state).unwrap();
    // GetByte sits at rloc 10 after the 9-byte declaration prologue
    assert!(out.contains("/*0000000a*/     x = 7;"), "{}", out);

    opts.func_rloc = false;
    let mut state = run_state();
    state.hash.add("x");
    let out = process_data(blob.build(), "test.gscc", &opts, &mut state).unwrap();
    assert!(!out.contains("/*0000000a*/"), "{}", out);
}

#[test]
fn rosetta_sink_collects_blocks() {
    let mut asm = Asm::t8();
    asm.op(Opcode::End);
    let blob = T8Blob {
        name: 0xABC,
        exports: vec![(
            ExportSpec {
                name: 0x900,
                ..Default::default()
            },
            asm.out.clone(),
        )],
        ..Default::default()
    };
    let mut state = run_state();
    state.rosetta = RosettaSink::new(true);
    let _ = process_data(blob.build(), "test.gscc", &options(), &mut state).unwrap();
    let mut bin = Vec::new();
    state.rosetta.write(&mut bin).unwrap();
    assert_eq!(&bin[..4], b"ROSE");
    assert_eq!(&bin[bin.len() - 3..], b"END");
    assert!(bin.len() > 4 + 8 + 3);
}
