use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::{anyhow, bail, Result};
use bitflags::bitflags;
use log::warn;

use crate::ast::{Ast, CallKind, CallTarget, CaseKey, FunctionBlock, JumpType, Node, NodeId, Statement};
use crate::bytes::{align_to, read_f32, read_i16, read_i32, read_i64, read_u16, read_u32, read_u64, read_u8};
use crate::context::ObjectContext;
use crate::hash::HashIndex;
use crate::opcode::{Opcode, OpcodeRegistry};
use crate::reader::{EMPTY_STR_HASH32, GET_CALL};
use crate::vm::{Platform, VmFlags, VmInfo};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LocalVarFlags: u8 {
        const ARRAY_REF = 0x01;
        const VARIADIC = 0x02;
        const VAR_REF = 0x04;
    }
}

#[derive(Debug, Clone)]
pub struct LocalVar {
    pub name: u64,
    pub flags: u8,
    pub default_value: Option<NodeId>,
}

/// Deferred AST splice attached to a location, realizing short-circuit
/// `&&` / `||` once the right-hand side has been walked.
#[derive(Debug, Clone, Copy)]
pub enum LateOp {
    Bool { op: &'static str, lhs: NodeId },
}

#[derive(Debug, Default)]
pub struct LocationRecord {
    pub handled: bool,
    pub late_ops: Vec<LateOp>,
}

/// Shared cursor over an export's code. Operand alignment only applies on
/// dialects with aligned halfword opcodes; byte-coded dialects pack operands
/// tight. All alignment arithmetic lives here.
pub(crate) struct Cursor<'a> {
    pub(crate) data: &'a [u8],
    start: usize,
    pub(crate) pos: usize,
    aligned_ops: bool,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(data: &'a [u8], start: usize, aligned_ops: bool) -> Self {
        Self {
            data,
            start,
            pos: start,
            aligned_ops,
        }
    }

    pub(crate) fn rloc(&self) -> u32 {
        (self.pos - self.start) as u32
    }

    pub(crate) fn seek(&mut self, rloc: u32) {
        self.pos = self.start + rloc as usize;
    }

    pub(crate) fn align(&mut self, n: usize) {
        if self.aligned_ops {
            self.pos = align_to(self.pos, n);
        }
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        let v = read_u8(self.data, self.pos)?;
        self.pos += 1;
        Ok(v)
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        self.align(2);
        let v = read_u16(self.data, self.pos)?;
        self.pos += 2;
        Ok(v)
    }

    pub(crate) fn i16(&mut self) -> Result<i16> {
        self.align(2);
        let v = read_i16(self.data, self.pos)?;
        self.pos += 2;
        Ok(v)
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        self.align(4);
        let v = read_u32(self.data, self.pos)?;
        self.pos += 4;
        Ok(v)
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        self.align(4);
        let v = read_i32(self.data, self.pos)?;
        self.pos += 4;
        Ok(v)
    }

    pub(crate) fn f32(&mut self) -> Result<f32> {
        self.align(4);
        let v = read_f32(self.data, self.pos)?;
        self.pos += 4;
        Ok(v)
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        self.align(8);
        let v = read_u64(self.data, self.pos)?;
        self.pos += 8;
        Ok(v)
    }

    pub(crate) fn i64(&mut self) -> Result<i64> {
        self.align(8);
        let v = read_i64(self.data, self.pos)?;
        self.pos += 8;
        Ok(v)
    }
}

/// Result of walking one export.
pub struct WalkOutcome {
    pub asm: String,
    pub ast: Ast,
    pub block: FunctionBlock,
    pub localvars: Vec<LocalVar>,
    /// `false` once a handler failed; the export is emitted as asm only.
    pub decompilable: bool,
    pub final_size: u32,
    /// `(file offset, encoded opcode)` pairs for the rosetta sink.
    pub opcodes: Vec<(u32, u16)>,
}

/// Work-list walker: discovers reachable locations from the entry address,
/// decodes each instruction once, maintains the abstract operand stack and
/// the field/object registers, and builds the statement list.
pub struct AsmWalker<'a> {
    cur: Cursor<'a>,
    vm: &'static VmInfo,
    platform: Platform,
    registry: &'a OpcodeRegistry,
    ctx: &'a ObjectContext,
    hash: &'a HashIndex,
    locations: BTreeMap<u32, LocationRecord>,
    stack: Vec<NodeId>,
    field_id: Option<NodeId>,
    object_id: Option<NodeId>,
    stmt_start: Option<u32>,
    ast: Ast,
    block: FunctionBlock,
    localvars: Vec<LocalVar>,
    asm: String,
    opcodes: Vec<(u32, u16)>,
    decompilable: bool,
}

impl<'a> AsmWalker<'a> {
    pub fn new(
        data: &'a [u8],
        start: usize,
        vm: &'static VmInfo,
        platform: Platform,
        registry: &'a OpcodeRegistry,
        ctx: &'a ObjectContext,
        hash: &'a HashIndex,
    ) -> Self {
        Self {
            cur: Cursor::new(data, start, vm.has(VmFlags::OPCODE_SHORT)),
            vm,
            platform,
            registry,
            ctx,
            hash,
            locations: BTreeMap::new(),
            stack: Vec::new(),
            field_id: None,
            object_id: None,
            stmt_start: None,
            ast: Ast::new(),
            block: FunctionBlock::default(),
            localvars: Vec::new(),
            asm: String::new(),
            opcodes: Vec::new(),
            decompilable: true,
        }
    }

    pub fn walk(mut self) -> WalkOutcome {
        self.locations.entry(0).or_default();
        'outer: while let Some(rloc) = self.find_next_location() {
            self.cur.seek(rloc);
            self.stack.clear();
            self.field_id = None;
            self.object_id = None;
            self.stmt_start = None;
            self.push_marker(rloc);
            loop {
                if self.vm.has(VmFlags::OPCODE_SHORT) {
                    self.cur.align(2);
                }
                let rloc = self.cur.rloc();
                let loc = self.locations.entry(rloc).or_default();
                loc.handled = true;
                let late_ops = std::mem::take(&mut loc.late_ops);
                for op in late_ops {
                    if let Err(err) = self.run_late_op(op) {
                        self.fail(rloc, &err);
                        break 'outer;
                    }
                }

                if self.stmt_start.is_none()
                    && self.stack.is_empty()
                    && self.field_id.is_none()
                    && self.object_id.is_none()
                {
                    self.stmt_start = Some(rloc);
                }

                let code = match self.read_opcode() {
                    Ok(code) => code,
                    Err(err) => {
                        self.fail(rloc, &err);
                        break 'outer;
                    }
                };
                if code & !0xFFF != 0 {
                    let _ = writeln!(self.asm, ".{:08x}: FAILURE, bad opcode 0x{:x}", rloc, code);
                    self.decompilable = false;
                    break 'outer;
                }
                let op = match self.registry.lookup(self.vm.vm, self.platform, code) {
                    Some(op) => op,
                    None => {
                        let _ = writeln!(self.asm, ".{:08x}: unknown opcode 0x{:x}", rloc, code);
                        self.decompilable = false;
                        break 'outer;
                    }
                };
                self.opcodes.push((self.cur.pos as u32, code));
                // pass the opcode before the handler reads its operands
                self.cur.pos += if self.vm.has(VmFlags::OPCODE_SHORT) { 2 } else { 1 };
                let _ = write!(self.asm, ".{:08x}: {:04x} {:<25} ", rloc, code, op.name());
                match self.exec(op, rloc) {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(err) => {
                        self.fail(rloc, &err);
                        break 'outer;
                    }
                }
            }
        }

        let terminator_width = if self.vm.has(VmFlags::OPCODE_SHORT) { 2 } else { 1 };
        let final_size = self
            .locations
            .keys()
            .copied()
            .max()
            .map(|max| max + terminator_width)
            .unwrap_or(terminator_width);
        let _ = writeln!(self.asm, "// final size: 0x{:x}", final_size);

        WalkOutcome {
            asm: self.asm,
            ast: self.ast,
            block: self.block,
            localvars: self.localvars,
            decompilable: self.decompilable,
            final_size,
            opcodes: self.opcodes,
        }
    }

    fn fail(&mut self, rloc: u32, err: &anyhow::Error) {
        warn!("walker stopped at rloc {:#x}: {:#}", rloc, err);
        let _ = writeln!(self.asm, "// error at 0x{:x}: {:#}", rloc, err);
        self.decompilable = false;
    }

    fn read_opcode(&mut self) -> Result<u16> {
        if self.vm.has(VmFlags::OPCODE_SHORT) {
            Ok(read_u16(self.cur.data, self.cur.pos)?)
        } else {
            Ok(read_u8(self.cur.data, self.cur.pos)? as u16)
        }
    }

    fn find_next_location(&mut self) -> Option<u32> {
        self.locations
            .iter()
            .find(|(_, loc)| !loc.handled)
            .map(|(&rloc, _)| rloc)
    }

    fn queue_location(&mut self, rloc: u32) {
        self.locations.entry(rloc).or_default();
    }

    fn run_late_op(&mut self, op: LateOp) -> Result<()> {
        match op {
            LateOp::Bool { op, lhs } => {
                let rhs = self.pop()?;
                let node = self.ast.push(Node::BinOp { op, lhs, rhs });
                self.stack.push(node);
                Ok(())
            }
        }
    }

    fn pop(&mut self) -> Result<NodeId> {
        self.stack.pop().ok_or_else(|| anyhow!("empty operand stack"))
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = self.ast.push(node);
        self.stack.push(id);
        id
    }

    fn push_marker(&mut self, rloc: u32) {
        if let Some(last) = self.block.statements.last() {
            if last.rloc == rloc && matches!(self.ast.node(last.node), Node::Precodepos) {
                return;
            }
        }
        let node = self.ast.push(Node::Precodepos);
        self.block.statements.push(Statement { node, rloc });
    }

    fn push_stmt(&mut self, node: Node, op_rloc: u32) {
        let rloc = self.stmt_start.take().unwrap_or(op_rloc);
        let id = self.ast.push(node);
        self.block.statements.push(Statement { node: id, rloc });
    }

    fn local_name(&self, idx: u8) -> Result<u64> {
        self.localvars
            .get(idx as usize)
            .map(|v| v.name)
            .ok_or_else(|| anyhow!("unknown local variable {}", idx))
    }

    fn string_value(&self, idx: u32) -> String {
        match self.ctx.string(idx) {
            Some(s) => s.to_string(),
            None => format!("<bad string index {}>", idx),
        }
    }

    /// Decode the callsite target the link patcher normalized: either an
    /// interned import id (wide-hash) or the arity byte plus the aligned
    /// name/namespace pair (hash32).
    fn read_callsite(&mut self, with_param_byte: bool) -> Result<(u64, u64, u8)> {
        if self.vm.has(VmFlags::HASH64) {
            let idx = self.cur.u16()?;
            let record = self
                .ctx
                .linked_import(idx)
                .ok_or_else(|| anyhow!("unlinked import index {}", idx))?
                .clone();
            let namespace = if record.flags & GET_CALL != 0 { 0 } else { record.namespace };
            Ok((record.name, namespace, record.param_count))
        } else {
            let params = if with_param_byte { self.cur.u8()? } else { 0 };
            self.cur.align(8);
            let name = read_u32(self.cur.data, self.cur.pos)? as u64;
            let namespace = read_u32(self.cur.data, self.cur.pos + 4)? as u64;
            self.cur.pos += 8;
            let namespace = if namespace == EMPTY_STR_HASH32 as u64 { 0 } else { namespace };
            Ok((name, namespace, params))
        }
    }

    fn pop_args(&mut self, count: u8) -> Result<Vec<NodeId>> {
        let mut args = Vec::with_capacity(count as usize);
        for _ in 0..count {
            args.push(self.pop()?);
        }
        args.reverse();
        Ok(args)
    }

    fn pop_call_marker(&mut self) -> Result<()> {
        let marker = self.pop()?;
        if !matches!(self.ast.node(marker), Node::PreCall) {
            bail!("missing call boundary marker");
        }
        Ok(())
    }

    fn finish_call(&mut self, target: CallTarget, kind: CallKind, params: u8) -> Result<()> {
        let args = self.pop_args(params)?;
        self.pop_call_marker()?;
        let self_obj = if kind.is_method() { Some(self.pop()?) } else { None };
        let node = Node::Call {
            target,
            kind,
            self_obj,
            args,
        };
        self.push(node);
        Ok(())
    }

    fn jump_delta(&mut self) -> Result<(u32, i64)> {
        let delta = self.cur.i16()? as i64;
        let after = self.cur.rloc() as i64;
        let target = after + delta;
        if target < 0 {
            bail!("jump target before function start: {}", target);
        }
        let target = target as u32;
        self.queue_location(target);
        Ok((target, delta))
    }

    /// Execute one opcode: read operands, emit disassembly text, mutate the
    /// abstract machine, attach statements. Returns `true` on a terminator.
    fn exec(&mut self, op: Opcode, rloc: u32) -> Result<bool> {
        use Opcode::*;
        match op {
            End => {
                let _ = writeln!(self.asm);
                self.push_stmt(Node::End, rloc);
                return Ok(true);
            }
            Return => {
                let value = self.pop()?;
                let _ = writeln!(self.asm);
                self.push_stmt(Node::Return(Some(value)), rloc);
                return Ok(true);
            }
            CheckClearParams => {
                let _ = writeln!(self.asm);
                self.stmt_start = None;
            }
            SafeCreateLocalVariables => {
                let count = self.cur.u8()?;
                for _ in 0..count {
                    let (name, flags) = if self.vm.has(VmFlags::VAR_ID) {
                        (self.localvars.len() as u64, 0)
                    } else {
                        let name = self.cur.u32()? as u64;
                        let flags = if self.vm.has(VmFlags::NO_PARAM_FLAGS) {
                            0
                        } else {
                            self.cur.u8()?
                        };
                        (name, flags)
                    };
                    self.localvars.push(LocalVar {
                        name,
                        flags,
                        default_value: None,
                    });
                }
                let names: Vec<String> = self
                    .localvars
                    .iter()
                    .map(|v| self.hash.extract("var", v.name))
                    .collect();
                let _ = writeln!(self.asm, "{}", names.join(", "));
                self.stmt_start = None;
            }
            DecTop => {
                let node = self.pop()?;
                let _ = writeln!(self.asm);
                self.push_stmt_id(node, rloc);
            }
            Wait => {
                let delay = self.pop()?;
                let _ = writeln!(self.asm);
                self.push_stmt(Node::Wait(delay), rloc);
            }

            GetZero => {
                let _ = writeln!(self.asm, "0");
                self.push(Node::IntConst(0));
            }
            GetByte => {
                let v = self.cur.u8()?;
                let _ = writeln!(self.asm, "{}", v);
                self.push(Node::IntConst(v as i64));
            }
            GetNegByte => {
                let v = self.cur.u8()?;
                let _ = writeln!(self.asm, "-{}", v);
                self.push(Node::IntConst(-(v as i64)));
            }
            GetUnsignedShort => {
                let v = self.cur.u16()?;
                let _ = writeln!(self.asm, "{}", v);
                self.push(Node::IntConst(v as i64));
            }
            GetNegUnsignedShort => {
                let v = self.cur.u16()?;
                let _ = writeln!(self.asm, "-{}", v);
                self.push(Node::IntConst(-(v as i64)));
            }
            GetInteger => {
                let v = self.cur.i32()?;
                let _ = writeln!(self.asm, "{}", v);
                self.push(Node::IntConst(v as i64));
            }
            GetNegUnsignedInteger => {
                let v = self.cur.u32()?;
                let _ = writeln!(self.asm, "-{}", v);
                self.push(Node::IntConst(-(v as i64)));
            }
            GetUnsignedInteger => {
                let v = self.cur.u32()?;
                let _ = writeln!(self.asm, "{}", v);
                self.push(Node::IntConst(v as i64));
            }
            GetLongInteger => {
                let v = self.cur.i64()?;
                let _ = writeln!(self.asm, "{}", v);
                self.push(Node::IntConst(v));
            }
            GetFloat => {
                let v = self.cur.f32()?;
                let _ = writeln!(self.asm, "{}", v);
                self.push(Node::FloatConst(v));
            }
            GetString => {
                let idx = self.cur.u32()?;
                let s = self.string_value(idx);
                let _ = writeln!(self.asm, "\"{}\"", s);
                self.push(Node::StringConst(s));
            }
            GetHash => {
                let v = self.cur.u64()?;
                let _ = writeln!(self.asm, "#\"{}\"", self.hash.extract("hash", v));
                self.push(Node::HashConst(v));
            }
            GetUndefined => {
                let _ = writeln!(self.asm, "undefined");
                self.push(Node::Undefined);
            }
            GetEmptyArray => {
                let _ = writeln!(self.asm, "[]");
                self.push(Node::EmptyArray);
            }
            GetSelf => {
                let _ = writeln!(self.asm, "self");
                self.push(Node::SelfRef);
            }
            GetGlobalObject => {
                let idx = self.cur.u16()?;
                let name = self
                    .ctx
                    .global_var_name(idx)
                    .ok_or_else(|| anyhow!("unknown global variable index {}", idx))?;
                let _ = writeln!(self.asm, "{}", self.hash.extract("var", name));
                self.push(Node::GlobalObject(name));
            }
            GetResolveFunction => {
                self.cur.align(8);
                let name = read_u32(self.cur.data, self.cur.pos)? as u64;
                let namespace = read_u32(self.cur.data, self.cur.pos + 4)? as u64;
                self.cur.pos += 8;
                let _ = writeln!(
                    self.asm,
                    "&{}::{}",
                    self.hash.extract("namespace", namespace),
                    self.hash.extract("function", name)
                );
                self.push(Node::FuncRef { namespace, name });
            }
            GetAnimTree => {
                let idx = self.cur.u8()? as u32;
                let s = self.string_value(idx);
                let _ = writeln!(self.asm, "{}", s);
                self.push(Node::AnimTree(s));
            }
            GetAnimation => {
                self.cur.align(4);
                let idx1 = read_u32(self.cur.data, self.cur.pos)?;
                let idx2 = read_u32(self.cur.data, self.cur.pos + 4)?;
                self.cur.pos += 8;
                let tree = self.string_value(idx1);
                let anim = self.string_value(idx2);
                let _ = writeln!(self.asm, "{}%{}", tree, anim);
                self.push(Node::Animation(tree, anim));
            }

            EvalLocalVariableCached => {
                let idx = self.cur.u8()?;
                let name = self.local_name(idx)?;
                let _ = writeln!(self.asm, "{}", self.hash.extract("var", name));
                self.push(Node::LocalVar(name));
            }
            EvalLocalVariableRefCached => {
                let idx = self.cur.u8()?;
                let name = self.local_name(idx)?;
                let _ = writeln!(self.asm, "{}", self.hash.extract("var", name));
                let node = self.ast.push(Node::LocalVar(name));
                self.field_id = Some(node);
            }
            SetLocalVariableCached => {
                let idx = self.cur.u8()?;
                let name = self.local_name(idx)?;
                let _ = writeln!(self.asm, "{}", self.hash.extract("var", name));
                let rhs = self.pop()?;
                let lhs = self.ast.push(Node::LocalVar(name));
                self.push_stmt(Node::Assign { lhs, rhs, op: None }, rloc);
            }

            CastFieldObject => {
                let obj = self.pop()?;
                let _ = writeln!(self.asm);
                self.object_id = Some(obj);
            }
            EvalFieldVariable => {
                let field = self.cur.u32()? as u64;
                let _ = writeln!(self.asm, "{}", self.hash.extract("var", field));
                let obj = match self.object_id.take() {
                    Some(obj) => obj,
                    None => self.ast.push(Node::SelfRef),
                };
                self.push(Node::FieldAccess { obj, field });
            }
            EvalFieldVariableRef => {
                let field = self.cur.u32()? as u64;
                let _ = writeln!(self.asm, "{}", self.hash.extract("var", field));
                let obj = match self.object_id.take() {
                    Some(obj) => obj,
                    None => self.ast.push(Node::SelfRef),
                };
                let node = self.ast.push(Node::FieldAccess { obj, field });
                self.field_id = Some(node);
            }
            EvalFieldVariableFromGlobalObject => {
                let idx = self.cur.u16()?;
                let gvar = self
                    .ctx
                    .global_var_name(idx)
                    .ok_or_else(|| anyhow!("unknown global variable index {}", idx))?;
                let field = self.cur.u32()? as u64;
                let _ = writeln!(
                    self.asm,
                    "{}.{}",
                    self.hash.extract("var", gvar),
                    self.hash.extract("var", field)
                );
                let obj = self.ast.push(Node::GlobalObject(gvar));
                let node = self.ast.push(Node::FieldAccess { obj, field });
                self.field_id = Some(node);
            }
            EvalGlobalObjectFieldVariable => {
                let idx = self.cur.u16()?;
                let gvar = self
                    .ctx
                    .global_var_name(idx)
                    .ok_or_else(|| anyhow!("unknown global variable index {}", idx))?;
                let field = self.cur.u32()? as u64;
                let _ = writeln!(
                    self.asm,
                    "{}.{}",
                    self.hash.extract("var", gvar),
                    self.hash.extract("var", field)
                );
                let obj = self.ast.push(Node::GlobalObject(gvar));
                self.push(Node::FieldAccess { obj, field });
            }
            EvalArray => {
                let arr = self.pop()?;
                let index = self.pop()?;
                let _ = writeln!(self.asm);
                self.push(Node::ArrayAccess { arr, index });
            }
            EvalArrayRef => {
                let index = self.pop()?;
                let arr = self
                    .field_id
                    .take()
                    .ok_or_else(|| anyhow!("array ref without field register"))?;
                let _ = writeln!(self.asm);
                let node = self.ast.push(Node::ArrayAccess { arr, index });
                self.field_id = Some(node);
            }
            SetVariableField => {
                let rhs = self.pop()?;
                let lhs = self
                    .field_id
                    .take()
                    .ok_or_else(|| anyhow!("assignment without field register"))?;
                let _ = writeln!(self.asm);
                self.push_stmt(Node::Assign { lhs, rhs, op: None }, rloc);
            }
            SetVariableFieldFromEvalArrayRef => {
                let index = self.pop()?;
                let rhs = self.pop()?;
                let base = self
                    .field_id
                    .take()
                    .ok_or_else(|| anyhow!("array assignment without field register"))?;
                let _ = writeln!(self.asm);
                let lhs = self.ast.push(Node::ArrayAccess { arr: base, index });
                self.push_stmt(Node::Assign { lhs, rhs, op: None }, rloc);
            }

            Plus | Minus | Multiply | Divide | Modulus | ShiftLeft | ShiftRight | BitAnd
            | BitOr | BitXor | Equal | NotEqual | LessThan | GreaterThan | LessThanOrEqual
            | GreaterThanOrEqual => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let _ = writeln!(self.asm);
                self.push(Node::BinOp {
                    op: binop_text(op),
                    lhs,
                    rhs,
                });
            }
            BoolNot => {
                let expr = self.pop()?;
                let _ = writeln!(self.asm);
                self.push(Node::UnOp { op: "!", expr });
            }
            BoolComplement => {
                let expr = self.pop()?;
                let _ = writeln!(self.asm);
                self.push(Node::UnOp { op: "~", expr });
            }
            IsDefined => {
                let expr = self.pop()?;
                let _ = writeln!(self.asm);
                self.push(Node::IsDefined(expr));
            }
            FirstArrayKey => {
                let arr = self.pop()?;
                let _ = writeln!(self.asm);
                self.push(Node::FirstArray(arr));
            }
            NextArrayKey => {
                let key = self.pop()?;
                let arr = self.pop()?;
                let _ = writeln!(self.asm);
                self.push(Node::NextArray(arr, key));
            }

            Jump => {
                let (target, delta) = self.jump_delta()?;
                let _ = writeln!(self.asm, ".{:08x} (delta: {})", target, delta);
                self.push_stmt(
                    Node::Jump {
                        jtype: JumpType::Always,
                        cond: None,
                        target,
                        delta,
                    },
                    rloc,
                );
                return Ok(true);
            }
            JumpOnTrue | JumpOnFalse => {
                let cond = self.pop()?;
                let (target, delta) = self.jump_delta()?;
                let _ = writeln!(self.asm, ".{:08x} (delta: {})", target, delta);
                let jtype = if op == JumpOnTrue { JumpType::OnTrue } else { JumpType::OnFalse };
                self.push_stmt(
                    Node::Jump {
                        jtype,
                        cond: Some(cond),
                        target,
                        delta,
                    },
                    rloc,
                );
            }
            JumpOnTrueExpr | JumpOnFalseExpr => {
                let lhs = self.pop()?;
                let (target, delta) = self.jump_delta()?;
                let _ = writeln!(self.asm, ".{:08x} (delta: {})", target, delta);
                let bool_op = if op == JumpOnTrueExpr { "||" } else { "&&" };
                let loc = self.locations.entry(target).or_default();
                if loc.handled {
                    bail!("late operation targets a handled location {:#x}", target);
                }
                loc.late_ops.push(LateOp::Bool { op: bool_op, lhs });
            }
            DevblockBegin => {
                let (target, delta) = self.jump_delta()?;
                let _ = writeln!(self.asm, ".{:08x} (delta: {})", target, delta);
                self.push_stmt(
                    Node::Jump {
                        jtype: JumpType::Devblock,
                        cond: None,
                        target,
                        delta,
                    },
                    rloc,
                );
            }

            Switch => {
                let value = self.pop()?;
                let delta = self.cur.i32()? as i64;
                let after = self.cur.rloc() as i64;
                let table = after + delta;
                if table < 0 {
                    bail!("switch table before function start");
                }
                let (cases, end) = self.read_switch_table(table as u32)?;
                let _ = writeln!(self.asm, "table .{:08x}, {} case(s)", table, cases.len());
                for (key, target) in &cases {
                    self.queue_location(*target);
                    let _ = writeln!(self.asm, "    case {:?}: .{:08x}", key, target);
                }
                self.queue_location(end);
                self.push_stmt(Node::SwitchPre { value, cases, end }, rloc);
                return Ok(true);
            }
            EndSwitch => {
                bail!("stray EndSwitch outside a switch table");
            }

            PreScriptCall => {
                let _ = writeln!(self.asm);
                self.push(Node::PreCall);
            }
            ScriptFunctionCall | ScriptThreadCall | ScriptChildThreadCall | ScriptMethodCall
            | ScriptMethodThreadCall | ScriptMethodChildThreadCall | CallBuiltinFunction
            | CallBuiltinMethod => {
                let (name, namespace, params) = self.read_callsite(true)?;
                if namespace == 0 {
                    let _ = writeln!(
                        self.asm,
                        "params: {} {}",
                        params,
                        self.hash.extract("function", name)
                    );
                } else {
                    let _ = writeln!(
                        self.asm,
                        "params: {} {}::{}",
                        params,
                        self.hash.extract("namespace", namespace),
                        self.hash.extract("function", name)
                    );
                }
                let kind = call_kind(op);
                self.finish_call(CallTarget::Import { namespace, name }, kind, params)?;
            }
            ScriptFunctionCallPointer | ScriptMethodCallPointer => {
                let params = self.cur.u8()?;
                let _ = writeln!(self.asm, "params: {}", params);
                let args = self.pop_args(params)?;
                self.pop_call_marker()?;
                let func = self.pop()?;
                let kind = if op == ScriptMethodCallPointer {
                    CallKind::MethodPointer
                } else {
                    CallKind::Pointer
                };
                let self_obj = if kind.is_method() { Some(self.pop()?) } else { None };
                self.push(Node::Call {
                    target: CallTarget::Pointer(func),
                    kind,
                    self_obj,
                    args,
                });
            }
        }
        Ok(false)
    }

    fn push_stmt_id(&mut self, node: NodeId, op_rloc: u32) {
        let rloc = self.stmt_start.take().unwrap_or(op_rloc);
        self.block.statements.push(Statement { node, rloc });
    }

    /// Parse the jump table sitting at `table`: an `EndSwitch` opcode, the
    /// case count, then 16-byte entries. The table region is marked handled
    /// so the work list never decodes it as instructions.
    fn read_switch_table(&mut self, table: u32) -> Result<(Vec<(CaseKey, u32)>, u32)> {
        let saved = self.cur.pos;
        self.cur.seek(table);
        if self.vm.has(VmFlags::OPCODE_SHORT) {
            self.cur.align(2);
        }
        let code = self.read_opcode()?;
        self.cur.pos += if self.vm.has(VmFlags::OPCODE_SHORT) { 2 } else { 1 };
        match self.registry.lookup(self.vm.vm, self.platform, code) {
            Some(Opcode::EndSwitch) => {}
            _ => bail!("switch table without EndSwitch at {:#x}", table),
        }
        let count = self.cur.u32()?;
        if count > 0x1000 {
            bail!("implausible switch case count: {}", count);
        }
        let mut cases = Vec::with_capacity(count as usize);
        for _ in 0..count {
            self.cur.align(8);
            let raw = read_u64(self.cur.data, self.cur.pos)?;
            let target = read_u32(self.cur.data, self.cur.pos + 8)?;
            self.cur.pos += 16;
            cases.push((decode_case_key(raw, self.ctx), target));
        }
        let end = self.cur.rloc();
        let loc = self.locations.entry(table).or_default();
        loc.handled = true;
        self.cur.pos = saved;
        Ok((cases, end))
    }
}

fn binop_text(op: Opcode) -> &'static str {
    match op {
        Opcode::Plus => "+",
        Opcode::Minus => "-",
        Opcode::Multiply => "*",
        Opcode::Divide => "/",
        Opcode::Modulus => "%",
        Opcode::ShiftLeft => "<<",
        Opcode::ShiftRight => ">>",
        Opcode::BitAnd => "&",
        Opcode::BitOr => "|",
        Opcode::BitXor => "^",
        Opcode::Equal => "==",
        Opcode::NotEqual => "!=",
        Opcode::LessThan => "<",
        Opcode::GreaterThan => ">",
        Opcode::LessThanOrEqual => "<=",
        Opcode::GreaterThanOrEqual => ">=",
        _ => "?",
    }
}

fn call_kind(op: Opcode) -> CallKind {
    match op {
        Opcode::ScriptThreadCall => CallKind::Thread,
        Opcode::ScriptChildThreadCall => CallKind::ChildThread,
        Opcode::ScriptMethodCall => CallKind::Method,
        Opcode::ScriptMethodThreadCall => CallKind::MethodThread,
        Opcode::ScriptMethodChildThreadCall => CallKind::MethodChildThread,
        Opcode::CallBuiltinFunction => CallKind::Builtin,
        Opcode::CallBuiltinMethod => CallKind::BuiltinMethod,
        _ => CallKind::Function,
    }
}

/// Case keys are tagged in the top byte: 0 = signed int, 1 = interned string
/// index, anything else is a raw hash.
fn decode_case_key(raw: u64, ctx: &ObjectContext) -> CaseKey {
    match raw >> 56 {
        0 => CaseKey::Int(raw as u32 as i32 as i64),
        1 => match ctx.string(raw as u32) {
            Some(s) => CaseKey::Str(s.to_string()),
            None => CaseKey::Hash(raw),
        },
        _ => CaseKey::Hash(raw),
    }
}

/// Size-only walk of one export: identical location discovery, no AST. Used
/// to compute the export extent for the disassembly header.
pub struct SkipWalker<'a> {
    cur: Cursor<'a>,
    vm: &'static VmInfo,
    platform: Platform,
    registry: &'a OpcodeRegistry,
    locations: BTreeMap<u32, bool>,
}

impl<'a> SkipWalker<'a> {
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
            locations: BTreeMap::new(),
        }
    }

    /// Final size of the export, or 0 when the code is invalid.
    pub fn compute_size(mut self) -> u32 {
        self.locations.insert(0, false);
        while let Some(rloc) = self
            .locations
            .iter()
            .find(|(_, &handled)| !handled)
            .map(|(&r, _)| r)
        {
            self.cur.seek(rloc);
            loop {
                if self.vm.has(VmFlags::OPCODE_SHORT) {
                    self.cur.align(2);
                }
                let rloc = self.cur.rloc();
                self.locations.insert(rloc, true);
                let code = if self.vm.has(VmFlags::OPCODE_SHORT) {
                    match read_u16(self.cur.data, self.cur.pos) {
                        Ok(c) => c,
                        Err(_) => return 0,
                    }
                } else {
                    match read_u8(self.cur.data, self.cur.pos) {
                        Ok(c) => c as u16,
                        Err(_) => return 0,
                    }
                };
                if code & !0xFFF != 0 {
                    return 0;
                }
                let op = match self.registry.lookup(self.vm.vm, self.platform, code) {
                    Some(op) => op,
                    None => return 0,
                };
                self.cur.pos += if self.vm.has(VmFlags::OPCODE_SHORT) { 2 } else { 1 };
                match self.skip(op) {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(_) => return 0,
                }
            }
        }
        let terminator_width = if self.vm.has(VmFlags::OPCODE_SHORT) { 2 } else { 1 };
        self.locations
            .keys()
            .copied()
            .max()
            .map(|max| max + terminator_width)
            .unwrap_or(terminator_width)
    }

    fn queue(&mut self, rloc: u32) {
        self.locations.entry(rloc).or_insert(false);
    }

    /// Advance the cursor past one instruction's operands. Returns `true` on
    /// terminators.
    fn skip(&mut self, op: Opcode) -> Result<bool> {
        use Opcode::*;
        match op {
            End | Return => return Ok(true),
            CheckClearParams | DecTop | Wait | GetZero | GetUndefined | GetEmptyArray
            | GetSelf | PreScriptCall | CastFieldObject | EvalArray | EvalArrayRef
            | SetVariableField | SetVariableFieldFromEvalArrayRef | Plus | Minus | Multiply
            | Divide | Modulus | ShiftLeft | ShiftRight | BitAnd | BitOr | BitXor | BoolNot
            | BoolComplement | IsDefined | Equal | NotEqual | LessThan | GreaterThan
            | LessThanOrEqual | GreaterThanOrEqual | FirstArrayKey | NextArrayKey => {}
            GetByte | GetNegByte | GetAnimTree | EvalLocalVariableCached
            | EvalLocalVariableRefCached | SetLocalVariableCached => {
                self.cur.u8()?;
            }
            GetUnsignedShort | GetNegUnsignedShort => {
                self.cur.u16()?;
            }
            GetInteger | GetNegUnsignedInteger | GetUnsignedInteger | GetFloat | GetString
            | EvalFieldVariable | EvalFieldVariableRef => {
                self.cur.u32()?;
            }
            GetLongInteger | GetHash => {
                self.cur.u64()?;
            }
            GetGlobalObject => {
                self.cur.u16()?;
            }
            GetResolveFunction => {
                self.cur.align(8);
                self.cur.pos += 8;
            }
            GetAnimation => {
                self.cur.align(4);
                self.cur.pos += 8;
            }
            EvalFieldVariableFromGlobalObject | EvalGlobalObjectFieldVariable => {
                self.cur.u16()?;
                self.cur.u32()?;
            }
            SafeCreateLocalVariables => {
                let count = self.cur.u8()?;
                for _ in 0..count {
                    if self.vm.has(VmFlags::VAR_ID) {
                        continue;
                    }
                    self.cur.u32()?;
                    if !self.vm.has(VmFlags::NO_PARAM_FLAGS) {
                        self.cur.u8()?;
                    }
                }
            }
            Jump => {
                let delta = self.cur.i16()? as i64;
                let target = self.cur.rloc() as i64 + delta;
                if target < 0 {
                    bail!("jump target out of range");
                }
                self.queue(target as u32);
                return Ok(true);
            }
            JumpOnTrue | JumpOnFalse | JumpOnTrueExpr | JumpOnFalseExpr | DevblockBegin => {
                let delta = self.cur.i16()? as i64;
                let target = self.cur.rloc() as i64 + delta;
                if target < 0 {
                    bail!("jump target out of range");
                }
                self.queue(target as u32);
            }
            Switch => {
                let delta = self.cur.i32()? as i64;
                let table = self.cur.rloc() as i64 + delta;
                if table < 0 {
                    bail!("switch table out of range");
                }
                let table = table as u32;
                self.cur.seek(table);
                if self.vm.has(VmFlags::OPCODE_SHORT) {
                    self.cur.align(2);
                }
                self.cur.pos += if self.vm.has(VmFlags::OPCODE_SHORT) { 2 } else { 1 };
                let count = self.cur.u32()?;
                if count > 0x1000 {
                    bail!("implausible switch case count");
                }
                for _ in 0..count {
                    self.cur.align(8);
                    let target = read_u32(self.cur.data, self.cur.pos + 8)?;
                    self.cur.pos += 16;
                    self.queue(target);
                }
                let end = self.cur.rloc();
                self.locations.insert(table, true);
                self.queue(end);
                return Ok(true);
            }
            EndSwitch => bail!("stray EndSwitch"),
            ScriptFunctionCall | ScriptThreadCall | ScriptChildThreadCall | ScriptMethodCall
            | ScriptMethodThreadCall | ScriptMethodChildThreadCall | CallBuiltinFunction
            | CallBuiltinMethod => {
                if self.vm.has(VmFlags::HASH64) {
                    self.cur.u16()?;
                } else {
                    self.cur.u8()?;
                    self.cur.align(8);
                    self.cur.pos += 8;
                }
            }
            ScriptFunctionCallPointer | ScriptMethodCallPointer => {
                self.cur.u8()?;
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::default_registry;
    use crate::vm::{vm_info, VM_T8};

    /// Minimal code assembler for walker tests: T8 PC encodings, aligned the
    /// same way the walker reads them.
    struct Asm {
        out: Vec<u8>,
        reg: OpcodeRegistry,
    }

    impl Asm {
        fn new() -> Self {
            Self {
                out: Vec::new(),
                reg: default_registry(),
            }
        }

        fn op(&mut self, op: Opcode) -> &mut Self {
            while self.out.len() % 2 != 0 {
                self.out.push(0);
            }
            let code = self.reg.encoding(VM_T8, Platform::Pc, op).unwrap();
            self.out.extend_from_slice(&code.to_le_bytes());
            self
        }

        fn u8(&mut self, v: u8) -> &mut Self {
            self.out.push(v);
            self
        }

        fn i16_at_next_align(&mut self, v: i16) -> &mut Self {
            while self.out.len() % 2 != 0 {
                self.out.push(0);
            }
            self.out.extend_from_slice(&v.to_le_bytes());
            self
        }

        fn u32_aligned(&mut self, v: u32) -> &mut Self {
            while self.out.len() % 4 != 0 {
                self.out.push(0);
            }
            self.out.extend_from_slice(&v.to_le_bytes());
            self
        }

        fn here(&self) -> usize {
            self.out.len()
        }
    }

    fn walk(code: Vec<u8>) -> WalkOutcome {
        let reg = default_registry();
        let vm = vm_info(VM_T8).unwrap();
        let ctx = ObjectContext::new(vm);
        let hash = HashIndex::new(false);
        AsmWalker::new(&code, 0, vm, Platform::Pc, &reg, &ctx, &hash).walk()
    }

    #[test]
    fn end_only_export() {
        let mut asm = Asm::new();
        asm.op(Opcode::End);
        let out = walk(asm.out);
        assert!(out.decompilable);
        assert_eq!(out.final_size, 2);
        // marker + End
        assert_eq!(out.block.statements.len(), 2);
        assert!(matches!(
            out.ast.node(out.block.statements[1].node),
            Node::End
        ));
    }

    #[test]
    fn return_constant() {
        let mut asm = Asm::new();
        asm.op(Opcode::GetByte).u8(7);
        asm.op(Opcode::Return);
        let out = walk(asm.out);
        assert!(out.decompilable);
        let ret = out
            .block
            .statements
            .iter()
            .find_map(|s| match out.ast.node(s.node) {
                Node::Return(Some(v)) => Some(*v),
                _ => None,
            })
            .expect("return statement");
        assert!(matches!(out.ast.node(ret), Node::IntConst(7)));
    }

    #[test]
    fn empty_stack_marks_undecompilable() {
        let mut asm = Asm::new();
        asm.op(Opcode::Return); // nothing on the stack
        let out = walk(asm.out);
        assert!(!out.decompilable);
    }

    #[test]
    fn bad_opcode_top_nibble() {
        let code = vec![0xFF, 0xFF];
        let out = walk(code);
        assert!(!out.decompilable);
    }

    #[test]
    fn skip_walker_matches_walker_size() {
        let mut asm = Asm::new();
        asm.op(Opcode::SafeCreateLocalVariables).u8(1);
        asm.u32_aligned(0x1234).u8(0);
        asm.op(Opcode::GetByte).u8(5);
        asm.op(Opcode::SetLocalVariableCached).u8(0);
        asm.op(Opcode::End);
        let code = asm.out.clone();
        let out = walk(code.clone());
        assert!(out.decompilable, "asm: {}", out.asm);

        let reg = default_registry();
        let vm = vm_info(VM_T8).unwrap();
        let size = SkipWalker::new(&code, 0, vm, Platform::Pc, &reg).compute_size();
        assert_eq!(size, out.final_size);
    }

    #[test]
    fn conditional_jump_queues_target() {
        // if (1) {} -> GetByte 1; JumpOnFalse +0; End
        let mut asm = Asm::new();
        asm.op(Opcode::GetByte).u8(1);
        asm.op(Opcode::JumpOnFalse).i16_at_next_align(0);
        asm.op(Opcode::End);
        let out = walk(asm.out);
        assert!(out.decompilable, "asm: {}", out.asm);
        let jump = out
            .block
            .statements
            .iter()
            .find_map(|s| match out.ast.node(s.node) {
                Node::Jump { jtype: JumpType::OnFalse, target, .. } => Some(*target),
                _ => None,
            })
            .expect("jump statement");
        // the jump lands on the End opcode
        assert_eq!(jump, out.final_size - 2);
    }

    #[test]
    fn short_circuit_and_is_spliced() {
        // a && b: GetByte a; JumpOnFalseExpr over b; GetByte b; <target> Return
        let mut asm = Asm::new();
        asm.op(Opcode::GetByte).u8(1);
        asm.op(Opcode::JumpOnFalseExpr).i16_at_next_align(4); // skip GetByte b (2+1 bytes + pad)
        let after_jump = asm.here();
        asm.op(Opcode::GetByte).u8(2);
        // pad so the next opcode starts exactly at after_jump + 4
        while asm.here() < after_jump + 4 {
            asm.u8(0);
        }
        asm.op(Opcode::Return);
        let out = walk(asm.out);
        assert!(out.decompilable, "asm: {}", out.asm);
        let ret = out
            .block
            .statements
            .iter()
            .find_map(|s| match out.ast.node(s.node) {
                Node::Return(Some(v)) => Some(*v),
                _ => None,
            })
            .expect("return statement");
        match out.ast.node(ret) {
            Node::BinOp { op, .. } => assert_eq!(*op, "&&"),
            other => panic!("expected &&, got {:?}", other),
        }
    }
}
