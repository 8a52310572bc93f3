use std::fmt::Write as _;

use bitflags::bitflags;

use crate::ast::{Ast, CallTarget, CaseKey, Node, NodeId, Statement};
use crate::hash::HashIndex;
use crate::walker::{LocalVar, LocalVarFlags};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FormatterFlags: u8 {
        /// `{` goes on its own line after block headers.
        const NEWLINE_AFTER_BLOCK_START = 0x01;
        /// Function headers use a `/* ... */` comment instead of `// ` lines.
        const ONE_LINE_HEADER_COMMENTS = 0x02;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Formatter {
    pub name: &'static str,
    pub flags: FormatterFlags,
}

pub const FORMATTERS: &[Formatter] = &[
    Formatter {
        name: "default",
        flags: FormatterFlags::empty(),
    },
    Formatter {
        name: "bo",
        flags: FormatterFlags::NEWLINE_AFTER_BLOCK_START,
    },
    Formatter {
        name: "serious",
        flags: FormatterFlags::ONE_LINE_HEADER_COMMENTS,
    },
];

/// Formatter by name; unknown names fall back to the default so the caller
/// can detect the mismatch by comparing names.
pub fn formatter_of(name: &str) -> &'static Formatter {
    FORMATTERS
        .iter()
        .find(|f| f.name.eq_ignore_ascii_case(name))
        .unwrap_or(&FORMATTERS[0])
}

pub fn padding(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("    ");
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out
}

/// Binding strength used to decide parenthesization.
fn prec(op: &str) -> u8 {
    match op {
        "||" => 1,
        "&&" => 2,
        "|" => 3,
        "^" => 4,
        "&" => 5,
        "==" | "!=" => 6,
        "<" | ">" | "<=" | ">=" => 7,
        "<<" | ">>" => 8,
        "+" | "-" => 9,
        "*" | "/" | "%" => 10,
        _ => 11,
    }
}

/// Pretty-printer for the reconstructed AST.
pub struct Emitter<'a> {
    pub ast: &'a Ast,
    pub hash: &'a HashIndex,
    pub fmt: &'static Formatter,
    /// Annotate every statement with its relative bytecode location.
    pub show_rloc: bool,
}

impl<'a> Emitter<'a> {
    pub fn new(ast: &'a Ast, hash: &'a HashIndex, fmt: &'static Formatter) -> Self {
        Self {
            ast,
            hash,
            fmt,
            show_rloc: false,
        }
    }

    fn open_block(&self, out: &mut String, depth: usize) {
        if self.fmt.flags.contains(FormatterFlags::NEWLINE_AFTER_BLOCK_START) {
            out.push('\n');
            padding(out, depth);
            out.push_str("{\n");
        } else {
            out.push_str(" {\n");
        }
    }

    /// Emit `{ ... }` for a statement list at `depth`.
    pub fn dump_block(&self, out: &mut String, stmts: &[Statement], depth: usize) {
        self.open_block(out, depth);
        self.dump_statements(out, stmts, depth + 1);
        padding(out, depth);
        out.push_str("}\n");
    }

    pub fn dump_statements(&self, out: &mut String, stmts: &[Statement], depth: usize) {
        for stmt in stmts {
            if self.show_rloc && !self.ast.node(stmt.node).is_marker() {
                let _ = write!(out, "/*{:08x}*/ ", stmt.rloc);
            }
            self.dump_statement(out, stmt.node, depth);
        }
    }

    fn dump_statement(&self, out: &mut String, id: NodeId, depth: usize) {
        match self.ast.node(id) {
            Node::Precodepos | Node::End | Node::PreCall => {}
            Node::IfElse {
                cond,
                then_block,
                else_block,
            } => {
                padding(out, depth);
                out.push_str("if (");
                self.dump_expr(out, *cond, 0);
                out.push(')');
                self.dump_block(out, then_block, depth);
                if let Some(else_block) = else_block {
                    // render else-if chains flat
                    let real: Vec<&Statement> = else_block
                        .iter()
                        .filter(|s| !matches!(self.ast.node(s.node), Node::Precodepos))
                        .collect();
                    if real.len() == 1 {
                        if matches!(self.ast.node(real[0].node), Node::IfElse { .. }) {
                            padding(out, depth);
                            out.push_str("else ");
                            let mut chain = String::new();
                            self.dump_statement(&mut chain, real[0].node, depth);
                            out.push_str(chain.trim_start());
                            return;
                        }
                    }
                    padding(out, depth);
                    out.push_str("else");
                    self.dump_block(out, else_block, depth);
                }
            }
            Node::While { cond, body } => {
                padding(out, depth);
                match cond {
                    Some(cond) => {
                        out.push_str("while (");
                        self.dump_expr(out, *cond, 0);
                        out.push(')');
                    }
                    None => out.push_str("for (;;)"),
                }
                self.dump_block(out, body, depth);
            }
            Node::For {
                init,
                cond,
                post,
                body,
            } => {
                padding(out, depth);
                out.push_str("for (");
                if let Some(init) = init {
                    self.dump_simple_statement(out, *init);
                }
                out.push_str("; ");
                if let Some(cond) = cond {
                    self.dump_expr(out, *cond, 0);
                }
                out.push_str("; ");
                if let Some(post) = post {
                    self.dump_simple_statement(out, *post);
                }
                out.push(')');
                self.dump_block(out, body, depth);
            }
            Node::Foreach {
                key_var,
                value_var,
                array,
                body,
            } => {
                padding(out, depth);
                out.push_str("foreach (");
                if let Some(key) = key_var {
                    let _ = write!(out, "{}, ", self.hash.extract("var", *key));
                }
                let _ = write!(out, "{} in ", self.hash.extract("var", *value_var));
                self.dump_expr(out, *array, 0);
                out.push(')');
                self.dump_block(out, body, depth);
            }
            Node::Switch { value, cases } => {
                padding(out, depth);
                out.push_str("switch (");
                self.dump_expr(out, *value, 0);
                out.push(')');
                self.open_block(out, depth);
                for case in cases {
                    padding(out, depth + 1);
                    match &case.key {
                        Some(key) => {
                            out.push_str("case ");
                            self.dump_case_key(out, key);
                            out.push_str(":\n");
                        }
                        None => out.push_str("default:\n"),
                    }
                    self.dump_statements(out, &case.body, depth + 2);
                }
                padding(out, depth);
                out.push_str("}\n");
            }
            Node::DevBlock(body) => {
                padding(out, depth);
                out.push_str("/#\n");
                self.dump_statements(out, body, depth + 1);
                padding(out, depth);
                out.push_str("#/\n");
            }
            Node::Return(value) => {
                padding(out, depth);
                match value {
                    Some(value) => {
                        out.push_str("return ");
                        self.dump_expr(out, *value, 0);
                        out.push_str(";\n");
                    }
                    None => out.push_str("return;\n"),
                }
            }
            Node::Break => {
                padding(out, depth);
                out.push_str("break;\n");
            }
            Node::Continue => {
                padding(out, depth);
                out.push_str("continue;\n");
            }
            Node::Wait(delay) => {
                padding(out, depth);
                out.push_str("wait ");
                self.dump_expr(out, *delay, 0);
                out.push_str(";\n");
            }
            Node::Jump { target, .. } => {
                // unresolved control flow; the caller normally falls back to
                // a gscasm block before this renders
                padding(out, depth);
                let _ = writeln!(out, "goto loc_{:x};", target);
            }
            Node::SwitchPre { end, .. } => {
                padding(out, depth);
                let _ = writeln!(out, "// unreconstructed switch (end .{:08x})", end);
            }
            _ => {
                padding(out, depth);
                self.dump_simple_statement(out, id);
                out.push_str(";\n");
            }
        }
    }

    /// Statement body without padding or terminator (for `for` headers).
    fn dump_simple_statement(&self, out: &mut String, id: NodeId) {
        match self.ast.node(id) {
            Node::Assign { lhs, rhs, op } => {
                self.dump_expr(out, *lhs, 0);
                match op {
                    Some(op) => {
                        let _ = write!(out, " {}= ", op);
                    }
                    None => out.push_str(" = "),
                }
                self.dump_expr(out, *rhs, 0);
            }
            _ => self.dump_expr(out, id, 0),
        }
    }

    fn dump_case_key(&self, out: &mut String, key: &CaseKey) {
        match key {
            CaseKey::Int(v) => {
                let _ = write!(out, "{}", v);
            }
            CaseKey::Str(s) => {
                let _ = write!(out, "\"{}\"", escape(s));
            }
            CaseKey::Hash(h) => {
                let _ = write!(out, "#\"{}\"", self.hash.extract("hash", *h));
            }
        }
    }

    pub fn dump_expr(&self, out: &mut String, id: NodeId, parent_prec: u8) {
        match self.ast.node(id) {
            Node::Undefined => out.push_str("undefined"),
            Node::IntConst(v) => {
                let _ = write!(out, "{}", v);
            }
            Node::FloatConst(v) => {
                let _ = write!(out, "{:?}", v);
            }
            Node::StringConst(s) => {
                let _ = write!(out, "\"{}\"", escape(s));
            }
            Node::HashConst(h) => {
                let _ = write!(out, "#\"{}\"", self.hash.extract("hash", *h));
            }
            Node::AnimTree(tree) => {
                let _ = write!(out, "#animtree(\"{}\")", escape(tree));
            }
            Node::Animation(_, anim) => {
                let _ = write!(out, "%{}", anim);
            }
            Node::SelfRef => out.push_str("self"),
            Node::EmptyArray => out.push_str("[]"),
            Node::GlobalObject(name) => {
                let _ = write!(out, "{}", self.hash.extract("var", *name));
            }
            Node::LocalVar(name) => {
                let _ = write!(out, "{}", self.hash.extract("var", *name));
            }
            Node::FuncRef { namespace, name } => {
                if *namespace == 0 {
                    let _ = write!(out, "&{}", self.hash.extract("function", *name));
                } else {
                    let _ = write!(
                        out,
                        "&{}::{}",
                        self.hash.extract("namespace", *namespace),
                        self.hash.extract("function", *name)
                    );
                }
            }
            Node::FieldAccess { obj, field } => {
                self.dump_expr(out, *obj, 11);
                let _ = write!(out, ".{}", self.hash.extract("var", *field));
            }
            Node::ArrayAccess { arr, index } => {
                self.dump_expr(out, *arr, 11);
                out.push('[');
                self.dump_expr(out, *index, 0);
                out.push(']');
            }
            Node::BinOp { op, lhs, rhs } => {
                let p = prec(op);
                if p < parent_prec {
                    out.push('(');
                }
                self.dump_expr(out, *lhs, p);
                let _ = write!(out, " {} ", op);
                self.dump_expr(out, *rhs, p + 1);
                if p < parent_prec {
                    out.push(')');
                }
            }
            Node::UnOp { op, expr } => {
                out.push_str(op);
                self.dump_expr(out, *expr, 11);
            }
            Node::IsDefined(expr) => {
                out.push_str("isdefined(");
                self.dump_expr(out, *expr, 0);
                out.push(')');
            }
            Node::FirstArray(arr) => {
                out.push_str("firstarray(");
                self.dump_expr(out, *arr, 0);
                out.push(')');
            }
            Node::NextArray(arr, key) => {
                out.push_str("nextarray(");
                self.dump_expr(out, *arr, 0);
                out.push_str(", ");
                self.dump_expr(out, *key, 0);
                out.push(')');
            }
            Node::Assign { lhs, rhs, op } => {
                self.dump_expr(out, *lhs, 0);
                match op {
                    Some(op) => {
                        let _ = write!(out, " {}= ", op);
                    }
                    None => out.push_str(" = "),
                }
                self.dump_expr(out, *rhs, 0);
            }
            Node::Call {
                target,
                kind,
                self_obj,
                args,
            } => {
                if let Some(obj) = self_obj {
                    self.dump_expr(out, *obj, 11);
                    out.push(' ');
                }
                if let Some(kw) = kind.thread_keyword() {
                    out.push_str(kw);
                    out.push(' ');
                }
                match target {
                    CallTarget::Import { namespace, name } => {
                        if *namespace != 0 {
                            let _ = write!(out, "{}::", self.hash.extract("namespace", *namespace));
                        }
                        let _ = write!(out, "{}", self.hash.extract("function", *name));
                    }
                    CallTarget::Pointer(func) => {
                        out.push_str("[[ ");
                        self.dump_expr(out, *func, 0);
                        out.push_str(" ]]");
                    }
                }
                out.push('(');
                for (i, arg) in args.iter().enumerate() {
                    if i != 0 {
                        out.push_str(", ");
                    }
                    self.dump_expr(out, *arg, 0);
                }
                out.push(')');
            }
            other => {
                let _ = write!(out, "/* {:?} */", other);
            }
        }
    }
}

/// Render a function signature: decorations, name, parameter list with
/// variadic / reference markers and recovered defaults.
pub fn dump_signature(
    out: &mut String,
    emitter: &Emitter<'_>,
    keyword: Option<&str>,
    decorations: &str,
    name: &str,
    localvars: &[LocalVar],
    param_count: u8,
) {
    if let Some(keyword) = keyword {
        out.push_str(keyword);
        out.push(' ');
    }
    out.push_str(decorations);
    out.push_str(name);
    out.push('(');
    let params = (param_count as usize).min(localvars.len());
    for i in 0..params {
        if i != 0 {
            out.push_str(", ");
        }
        // parameters are declared in reverse source order
        let var = &localvars[params - 1 - i];
        let flags = LocalVarFlags::from_bits_truncate(var.flags);
        if flags.contains(LocalVarFlags::VARIADIC) {
            out.push_str("...");
            continue;
        }
        if flags.contains(LocalVarFlags::ARRAY_REF) {
            out.push('&');
        } else if flags.contains(LocalVarFlags::VAR_REF) {
            out.push('*');
        }
        out.push_str(&emitter.hash.extract("var", var.name));
        if let Some(default) = var.default_value {
            out.push_str(" = ");
            emitter.dump_expr(out, default, 0);
        }
    }
    out.push(')');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{CallKind, FunctionBlock};
    use crate::hash::hash32;

    fn hash_with(names: &[&str]) -> HashIndex {
        let idx = HashIndex::new(false);
        for n in names {
            idx.add(n);
        }
        idx
    }

    #[test]
    fn formatter_lookup() {
        assert_eq!(formatter_of("bo").name, "bo");
        assert_eq!(formatter_of("nope").name, "default");
        assert!(formatter_of("serious")
            .flags
            .contains(FormatterFlags::ONE_LINE_HEADER_COMMENTS));
    }

    #[test]
    fn expression_precedence_parenthesizes() {
        let mut ast = Ast::new();
        let a = ast.push(Node::IntConst(1));
        let b = ast.push(Node::IntConst(2));
        let c = ast.push(Node::IntConst(3));
        let sum = ast.push(Node::BinOp { op: "+", lhs: a, rhs: b });
        let mul = ast.push(Node::BinOp { op: "*", lhs: sum, rhs: c });
        let hash = hash_with(&[]);
        let em = Emitter::new(&ast, &hash, formatter_of("default"));
        let mut out = String::new();
        em.dump_expr(&mut out, mul, 0);
        assert_eq!(out, "(1 + 2) * 3");
    }

    #[test]
    fn statement_rendering() {
        let mut ast = Ast::new();
        let x = ast.push(Node::LocalVar(hash32("x") as u64));
        let five = ast.push(Node::IntConst(5));
        let assign = ast.push(Node::Assign { lhs: x, rhs: five, op: Some("+") });
        let block = FunctionBlock {
            statements: vec![Statement { node: assign, rloc: 0 }],
        };
        let hash = hash_with(&["x"]);
        let em = Emitter::new(&ast, &hash, formatter_of("default"));
        let mut out = String::new();
        em.dump_statements(&mut out, &block.statements, 1);
        assert_eq!(out, "    x += 5;\n");
    }

    #[test]
    fn call_rendering() {
        let mut ast = Ast::new();
        let obj = ast.push(Node::SelfRef);
        let arg = ast.push(Node::StringConst("hi".into()));
        let call = ast.push(Node::Call {
            target: CallTarget::Import {
                namespace: 0x1111,
                name: 0x2222,
            },
            kind: CallKind::MethodThread,
            self_obj: Some(obj),
            args: vec![arg],
        });
        let hash = hash_with(&[]);
        let em = Emitter::new(&ast, &hash, formatter_of("default"));
        let mut out = String::new();
        em.dump_expr(&mut out, call, 0);
        assert_eq!(out, "self thread namespace_1111::function_2222(\"hi\")");
    }

    #[test]
    fn get_call_has_no_namespace_prefix() {
        let mut ast = Ast::new();
        let call = ast.push(Node::Call {
            target: CallTarget::Import {
                namespace: 0,
                name: 0x2222,
            },
            kind: CallKind::Builtin,
            self_obj: None,
            args: Vec::new(),
        });
        let hash = hash_with(&[]);
        let em = Emitter::new(&ast, &hash, formatter_of("default"));
        let mut out = String::new();
        em.dump_expr(&mut out, call, 0);
        assert_eq!(out, "function_2222()");
    }

    #[test]
    fn signature_with_defaults_and_markers() {
        let mut ast = Ast::new();
        let five = ast.push(Node::IntConst(5));
        // declared in reverse order: b first, then a
        let localvars = vec![
            LocalVar {
                name: hash32("b") as u64,
                flags: LocalVarFlags::ARRAY_REF.bits(),
                default_value: None,
            },
            LocalVar {
                name: hash32("a") as u64,
                flags: 0,
                default_value: Some(five),
            },
        ];
        let hash = hash_with(&["a", "b"]);
        let em = Emitter::new(&ast, &hash, formatter_of("default"));
        let mut out = String::new();
        dump_signature(&mut out, &em, Some("function"), "", "do_thing", &localvars, 2);
        assert_eq!(out, "function do_thing(a = 5, &b)");
    }

    #[test]
    fn brace_style_follows_formatter() {
        let mut ast = Ast::new();
        let cond = ast.push(Node::IntConst(1));
        let ifnode = ast.push(Node::IfElse {
            cond,
            then_block: Vec::new(),
            else_block: None,
        });
        let hash = hash_with(&[]);
        let mut out = String::new();
        Emitter::new(&ast, &hash, formatter_of("default")).dump_statement(
            &mut out,
            ifnode,
            0,
        );
        assert!(out.starts_with("if (1) {"));

        let mut out2 = String::new();
        Emitter::new(&ast, &hash, formatter_of("bo")).dump_statement(&mut out2, ifnode, 0);
        assert!(out2.starts_with("if (1)\n{"));
    }
}
