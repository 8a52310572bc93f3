use std::fmt::Write as _;

use anyhow::{bail, Result};

use crate::context::{ObjectContext, VtableSlot};
use crate::emit::padding;
use crate::hash::HashIndex;
use crate::opcode::{Opcode, OpcodeRegistry};
use crate::reader::ExportEntry;
use crate::vm::{Platform, VmFlags, VmInfo, VM_T8};
use crate::walker::Cursor;

/// Reader for the rigid prologue the compiler emits for `CLASS_VTABLE`
/// exports. The shape is fixed:
///
/// ```text
/// CheckClearParams; PreScriptCall;
/// (ScriptFunctionCall | CallBuiltinFunction)   // spawnstruct
/// GetZero;
/// (EvalFieldVariableFromGlobalObject classes.<class>
///  | GetGlobalObject classes; EvalFieldVariableRef <class>)
/// (SetVariableFieldFromEvalArrayRef | EvalArrayRef; SetVariableField)
/// ```
///
/// followed by one quadruple per method slot until `End`. Any deviation
/// aborts with a single diagnostic; the general pipeline is never used as a
/// fallback for these exports.
pub struct VtableReader<'a> {
    cur: Cursor<'a>,
    vm: &'static VmInfo,
    platform: Platform,
    registry: &'a OpcodeRegistry,
}

impl<'a> VtableReader<'a> {
    pub fn new(
        data: &'a [u8],
        start: usize,
        vm: &'static VmInfo,
        platform: Platform,
        registry: &'a OpcodeRegistry,
    ) -> Self {
        Self {
            cur: Cursor::new(data, start, vm.has(VmFlags::OPCODE_SHORT)),
            vm,
            platform,
            registry,
        }
    }

    fn next_opcode(&mut self) -> Result<Opcode> {
        self.cur.align(2);
        let code = if self.vm.has(VmFlags::OPCODE_SHORT) {
            let v = crate::bytes::read_u16(self.cur.data, self.cur.pos)?;
            self.cur.pos += 2;
            v
        } else {
            let v = crate::bytes::read_u8(self.cur.data, self.cur.pos)? as u16;
            self.cur.pos += 1;
            v as u16
        };
        match self.registry.lookup(self.vm.vm, self.platform, code) {
            Some(op) => Ok(op),
            None => bail!("bad vtable opcode: {:#x}", code),
        }
    }

    fn expect(&mut self, expected: Opcode) -> Result<()> {
        let op = self.next_opcode()?;
        if op != expected {
            bail!("bad vtable opcode: {}, expected {}", op.name(), expected.name());
        }
        Ok(())
    }

    /// Skip the aligned `(name u32, namespace u32)` pair of a callsite or
    /// function resolve, returning the raw words.
    fn read_pair(&mut self) -> Result<(u32, u32)> {
        self.cur.align(8);
        let a = crate::bytes::read_u32(self.cur.data, self.cur.pos)?;
        let b = crate::bytes::read_u32(self.cur.data, self.cur.pos + 4)?;
        self.cur.pos += 8;
        Ok((a, b))
    }

    /// Integer getter used for the slot uid.
    fn read_uid(&mut self) -> Result<u64> {
        let op = self.next_opcode()?;
        if !op.is_uid_getter() {
            bail!("bad vtable opcode: {}, expected getter", op.name());
        }
        Ok(match op {
            Opcode::GetZero => 0,
            Opcode::GetByte => self.cur.u8()? as u64,
            Opcode::GetNegByte => -(self.cur.u8()? as i64) as u64,
            Opcode::GetUnsignedShort => self.cur.u16()? as u64,
            Opcode::GetNegUnsignedShort => -(self.cur.u16()? as i64) as u64,
            Opcode::GetInteger => self.cur.i32()? as i64 as u64,
            Opcode::GetNegUnsignedInteger => -(self.cur.u32()? as i64) as u64,
            Opcode::GetUnsignedInteger => self.cur.u32()? as u64,
            Opcode::GetLongInteger => self.cur.i64()? as u64,
            _ => unreachable!(),
        })
    }

    /// Parse the export, register the class into the context, and append the
    /// slot listing to `out`.
    pub fn read(
        mut self,
        exp: &ExportEntry,
        ctx: &mut ObjectContext,
        hash: &HashIndex,
        out: &mut String,
        depth: usize,
    ) -> Result<u64> {
        self.expect(Opcode::CheckClearParams)?;
        self.expect(Opcode::PreScriptCall)?;
        let spawn = self.next_opcode()?;
        if spawn != Opcode::ScriptFunctionCall && spawn != Opcode::CallBuiltinFunction {
            bail!(
                "bad vtable opcode: {}, expected ScriptFunctionCall",
                spawn.name()
            );
        }
        // spawnstruct callsite: arity byte plus the patched name pair
        self.cur.u8()?;
        self.read_pair()?;

        self.expect(Opcode::GetZero)?;

        let class_name = if self.vm.vm == VM_T8 {
            self.expect(Opcode::GetGlobalObject)?;
            self.cur.u16()?; // classes
            self.expect(Opcode::EvalFieldVariableRef)?;
            self.cur.u32()? as u64
        } else {
            self.expect(Opcode::EvalFieldVariableFromGlobalObject)?;
            self.cur.u16()?; // classes
            self.cur.u32()? as u64
        };

        if self.vm.vm == VM_T8 {
            self.expect(Opcode::EvalArrayRef)?;
            self.expect(Opcode::SetVariableField)?;
        } else {
            self.expect(Opcode::SetVariableFieldFromEvalArrayRef)?;
        }

        let mut methods: Vec<u64> = Vec::new();
        let mut supers: Vec<u64> = Vec::new();
        let mut slots: Vec<(u64, VtableSlot)> = Vec::new();

        loop {
            let op = self.next_opcode()?;
            if op == Opcode::End {
                break;
            }
            if op != Opcode::GetResolveFunction {
                bail!(
                    "bad vtable opcode: {}, expected GetResolveFunction or End",
                    op.name()
                );
            }
            let (method, method_cls) = self.read_pair()?;
            if method == 0 {
                bail!("vtable entry with null method hash");
            }
            let uid = self.read_uid()?;

            self.expect(Opcode::GetZero)?;
            self.expect(Opcode::EvalGlobalObjectFieldVariable)?;
            self.cur.u16()?; // classes
            self.cur.u32()?; // class field
            self.expect(Opcode::EvalArray)?;
            self.expect(Opcode::CastFieldObject)?;
            self.expect(Opcode::EvalFieldVariableRef)?;
            self.cur.u32()?; // __vtable
            if self.vm.vm == VM_T8 {
                self.expect(Opcode::EvalArrayRef)?;
                self.expect(Opcode::SetVariableField)?;
            } else {
                self.expect(Opcode::SetVariableFieldFromEvalArrayRef)?;
            }

            if method_cls as u64 == class_name {
                methods.push(method as u64);
            } else {
                supers.push(method_cls as u64);
            }
            slots.push((
                uid,
                VtableSlot {
                    name: method as u64,
                    namespace: method_cls as u64,
                },
            ));
            padding(out, depth);
            let _ = writeln!(
                out,
                "0x{:x} -> &{}::{};",
                uid,
                hash.extract("class", method_cls as u64),
                hash.extract("function", method as u64)
            );
        }

        if methods.is_empty() {
            bail!("vtable with no own methods");
        }

        let cls = ctx.class_mut(class_name);
        cls.name_space = exp.namespace;
        cls.methods.extend(methods);
        cls.super_classes.extend(supers);
        for (uid, slot) in slots {
            cls.vtable.insert(uid, slot);
        }

        padding(out, depth);
        let _ = write!(out, "// class {}", hash.extract("class", class_name));
        let cls = &ctx.classes[&class_name];
        if !cls.super_classes.is_empty() {
            out.push_str(" : ");
            for (i, sup) in cls.super_classes.iter().enumerate() {
                if i != 0 {
                    out.push_str(", ");
                }
                out.push_str(&hash.extract("class", *sup));
            }
        }
        out.push('\n');
        Ok(class_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::default_registry;
    use crate::vm::vm_info;

    /// Assemble a minimal T8 vtable export with one constructor slot.
    fn build_vtable_code(reg: &OpcodeRegistry, class: u32, method: u32, uid: u32) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::new();
        let mut op = |out: &mut Vec<u8>, o: Opcode| {
            while out.len() % 2 != 0 {
                out.push(0);
            }
            let code = reg.encoding(VM_T8, Platform::Pc, o).unwrap();
            out.extend_from_slice(&code.to_le_bytes());
        };
        let pad_to = |out: &mut Vec<u8>, align: usize| {
            while out.len() % align != 0 {
                out.push(0);
            }
        };

        op(&mut out, Opcode::CheckClearParams);
        op(&mut out, Opcode::PreScriptCall);
        op(&mut out, Opcode::ScriptFunctionCall);
        out.push(0); // param count
        pad_to(&mut out, 8);
        out.extend_from_slice(&0x73717731u32.to_le_bytes()); // spawnstruct
        out.extend_from_slice(&0u32.to_le_bytes());
        op(&mut out, Opcode::GetZero);
        op(&mut out, Opcode::GetGlobalObject);
        out.extend_from_slice(&0u16.to_le_bytes()); // classes gvar id
        op(&mut out, Opcode::EvalFieldVariableRef);
        pad_to(&mut out, 4);
        out.extend_from_slice(&class.to_le_bytes());
        op(&mut out, Opcode::EvalArrayRef);
        op(&mut out, Opcode::SetVariableField);

        // one slot
        op(&mut out, Opcode::GetResolveFunction);
        pad_to(&mut out, 8);
        out.extend_from_slice(&method.to_le_bytes());
        out.extend_from_slice(&class.to_le_bytes());
        op(&mut out, Opcode::GetUnsignedInteger);
        pad_to(&mut out, 4);
        out.extend_from_slice(&uid.to_le_bytes());
        op(&mut out, Opcode::GetZero);
        op(&mut out, Opcode::EvalGlobalObjectFieldVariable);
        out.extend_from_slice(&0u16.to_le_bytes());
        pad_to(&mut out, 4);
        out.extend_from_slice(&class.to_le_bytes());
        op(&mut out, Opcode::EvalArray);
        op(&mut out, Opcode::CastFieldObject);
        op(&mut out, Opcode::EvalFieldVariableRef);
        pad_to(&mut out, 4);
        out.extend_from_slice(&0x11223344u32.to_le_bytes()); // __vtable
        op(&mut out, Opcode::EvalArrayRef);
        op(&mut out, Opcode::SetVariableField);

        op(&mut out, Opcode::End);
        out
    }

    fn export() -> ExportEntry {
        ExportEntry {
            namespace: 0x4242,
            name: 0xC1A55,
            file_namespace: 0,
            checksum: 0,
            address: 0,
            param_count: 0,
            flags: 0,
        }
    }

    #[test]
    fn reads_single_slot_vtable() {
        let reg = default_registry();
        let vm = vm_info(VM_T8).unwrap();
        let code = build_vtable_code(&reg, 0xC1A55, 0xABCD, 0xA5A5);
        let mut ctx = ObjectContext::new(vm);
        ctx.add_global_var_name(0x99); // classes
        let hash = HashIndex::new(false);
        let mut out = String::new();
        let reader = VtableReader::new(&code, 0, vm, Platform::Pc, &reg);
        let name = reader.read(&export(), &mut ctx, &hash, &mut out, 1).unwrap();
        assert_eq!(name, 0xC1A55);
        let cls = &ctx.classes[&0xC1A55];
        assert_eq!(cls.name_space, 0x4242);
        assert_eq!(cls.methods, vec![0xABCD]);
        assert_eq!(cls.vtable[&0xA5A5].name, 0xABCD);
        assert!(out.contains("0xa5a5 ->"));
        assert!(out.contains("// class"));
    }

    #[test]
    fn rejects_broken_prologue() {
        let reg = default_registry();
        let vm = vm_info(VM_T8).unwrap();
        let mut code = build_vtable_code(&reg, 1, 2, 3);
        // clobber the second opcode
        let bad = reg.encoding(VM_T8, Platform::Pc, Opcode::GetZero).unwrap();
        code[2..4].copy_from_slice(&bad.to_le_bytes());
        let mut ctx = ObjectContext::new(vm);
        let hash = HashIndex::new(false);
        let mut out = String::new();
        let reader = VtableReader::new(&code, 0, vm, Platform::Pc, &reg);
        assert!(reader.read(&export(), &mut ctx, &hash, &mut out, 0).is_err());
        assert!(ctx.classes.is_empty());
    }

    #[test]
    fn rejects_empty_vtable() {
        let reg = default_registry();
        let vm = vm_info(VM_T8).unwrap();
        // prologue then immediate End
        let mut out: Vec<u8> = Vec::new();
        let mut op = |out: &mut Vec<u8>, o: Opcode| {
            while out.len() % 2 != 0 {
                out.push(0);
            }
            let code = reg.encoding(VM_T8, Platform::Pc, o).unwrap();
            out.extend_from_slice(&code.to_le_bytes());
        };
        op(&mut out, Opcode::CheckClearParams);
        op(&mut out, Opcode::PreScriptCall);
        op(&mut out, Opcode::ScriptFunctionCall);
        out.push(0);
        while out.len() % 8 != 0 {
            out.push(0);
        }
        out.extend_from_slice(&[0u8; 8]);
        op(&mut out, Opcode::GetZero);
        op(&mut out, Opcode::GetGlobalObject);
        out.extend_from_slice(&0u16.to_le_bytes());
        op(&mut out, Opcode::EvalFieldVariableRef);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(&0xC1u32.to_le_bytes());
        op(&mut out, Opcode::EvalArrayRef);
        op(&mut out, Opcode::SetVariableField);
        op(&mut out, Opcode::End);

        let mut ctx = ObjectContext::new(vm);
        let hash = HashIndex::new(false);
        let mut text = String::new();
        let reader = VtableReader::new(&out, 0, vm, Platform::Pc, &reg);
        assert!(reader
            .read(&export(), &mut ctx, &hash, &mut text, 0)
            .is_err());
    }
}
