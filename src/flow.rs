use bitflags::bitflags;

use crate::ast::{Ast, CaseKey, FunctionBlock, JumpType, Node, NodeId, Statement, SwitchCase};
use crate::walker::LocalVar;

bitflags! {
    /// One bit per reconstruction pass, mapped 1:1 to `--ignore` letters so
    /// a failing pass can be isolated.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StepSkip: u16 {
        const DEV = 0x0001;
        const DEVBLOCK_INLINE = 0x0002;
        const SWITCH = 0x0004;
        const FOREACH = 0x0008;
        const WHILE = 0x0010;
        const IF = 0x0020;
        const FOR = 0x0040;
        const RETURN = 0x0080;
        const BOOL_RETURN = 0x0100;
        const CLASSMEMBER_INLINE = 0x0200;
        const SPECIAL_PATTERN = 0x0400;
    }
}

impl StepSkip {
    /// `--ignore` letter bits; `a` skips everything.
    pub fn from_letters(letters: &str) -> Result<Self, char> {
        let mut skip = StepSkip::empty();
        for c in letters.chars() {
            skip |= match c {
                'd' => StepSkip::DEV,
                'D' => StepSkip::DEVBLOCK_INLINE,
                's' => StepSkip::SWITCH,
                'e' => StepSkip::FOREACH,
                'w' => StepSkip::WHILE,
                'i' => StepSkip::IF,
                'f' => StepSkip::FOR,
                'r' => StepSkip::RETURN,
                'R' => StepSkip::BOOL_RETURN,
                'c' => StepSkip::CLASSMEMBER_INLINE,
                'S' => StepSkip::SPECIAL_PATTERN,
                'a' => StepSkip::all(),
                other => return Err(other),
            };
        }
        Ok(skip)
    }
}

/// Run the reconstruction pipeline over one export's statement list. Passes
/// execute in a fixed order; each is gated by its skip bit. A pass that does
/// not match leaves the statements alone, so the output stays valid.
pub fn reconstruct(ast: &mut Ast, block: &mut FunctionBlock, skip: StepSkip) {
    if !skip.contains(StepSkip::DEV) {
        if skip.contains(StepSkip::DEVBLOCK_INLINE) {
            pass_dev_blocks_inline(ast, &mut block.statements);
        } else {
            pass_dev_blocks(ast, &mut block.statements);
        }
    }
    if !skip.contains(StepSkip::SWITCH) {
        pass_switch(ast, &mut block.statements);
    }
    if !skip.contains(StepSkip::FOREACH) {
        pass_foreach(ast, &mut block.statements);
    }
    if !skip.contains(StepSkip::WHILE) {
        pass_while(ast, &mut block.statements);
    }
    if !skip.contains(StepSkip::FOR) {
        pass_for(ast, &mut block.statements);
    }
    if !skip.contains(StepSkip::IF) {
        pass_if_else(ast, &mut block.statements);
    }
    if !skip.contains(StepSkip::RETURN) {
        let end_rloc = block
            .statements
            .iter()
            .rev()
            .find(|s| matches!(ast.node(s.node), Node::End))
            .map(|s| s.rloc);
        if let Some(end_rloc) = end_rloc {
            pass_return_jump(ast, &mut block.statements, end_rloc);
        }
    }
    if !skip.contains(StepSkip::BOOL_RETURN) {
        pass_bool_return(ast, &mut block.statements);
    }
    if !skip.contains(StepSkip::SPECIAL_PATTERN) {
        pass_special_patterns(ast, &mut block.statements);
    }
}

/// Default parameter recovery: the compiler guards each defaulted parameter
/// with `if (isdefined(p)) goto skip; p = <default>;` at function entry.
/// Runs on the raw statement list, before any structuring.
pub fn compute_default_params(ast: &mut Ast, block: &mut FunctionBlock, localvars: &mut [LocalVar]) {
    loop {
        let indices = real_indices(ast, &block.statements);
        if indices.len() < 2 {
            return;
        }
        let (i0, i1) = (indices[0], indices[1]);
        let (param, target) = match ast.node(block.statements[i0].node) {
            Node::Jump {
                jtype: JumpType::OnTrue,
                cond: Some(cond),
                target,
                ..
            } => match ast.node(*cond) {
                Node::IsDefined(inner) => match ast.node(*inner) {
                    Node::LocalVar(name) => (*name, *target),
                    _ => return,
                },
                _ => return,
            },
            _ => return,
        };
        let default = match ast.node(block.statements[i1].node) {
            Node::Assign { lhs, rhs, op: None } => match ast.node(*lhs) {
                Node::LocalVar(name) if *name == param => *rhs,
                _ => return,
            },
            _ => return,
        };
        // the guard must jump exactly past the assignment
        let next_rloc = indices
            .get(2)
            .map(|&i| block.statements[i].rloc)
            .unwrap_or(u32::MAX);
        if target != next_rloc && next_rloc != u32::MAX {
            return;
        }
        match localvars.iter_mut().find(|v| v.name == param) {
            Some(var) => var.default_value = Some(default),
            None => return,
        }
        block.statements.drain(i0..=i1);
    }
}

/// True when any raw jump or switch preamble survived the passes; such an
/// export is emitted as a `gscasm` block instead of broken source.
pub fn has_unstructured(ast: &Ast, statements: &[Statement]) -> bool {
    statements.iter().any(|s| {
        if matches!(ast.node(s.node), Node::Jump { .. } | Node::SwitchPre { .. }) {
            return true;
        }
        let mut found = false;
        for_child_blocks_ref(ast, s.node, &mut |stmts| {
            if has_unstructured(ast, stmts) {
                found = true;
            }
        });
        found
    })
}

/// Collect `self.<field>` assignment targets; used to list class members.
pub fn collect_self_members(ast: &Ast, statements: &[Statement], out: &mut std::collections::BTreeSet<u64>) {
    for stmt in statements {
        collect_self_members_node(ast, stmt.node, out);
        for_child_blocks_ref(ast, stmt.node, &mut |stmts| {
            collect_self_members(ast, stmts, out)
        });
    }
}

fn collect_self_members_node(ast: &Ast, id: NodeId, out: &mut std::collections::BTreeSet<u64>) {
    if let Node::Assign { lhs, .. } = ast.node(id) {
        if let Node::FieldAccess { obj, field } = ast.node(*lhs) {
            if matches!(ast.node(*obj), Node::SelfRef) {
                out.insert(*field);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// shared helpers

fn real_indices(ast: &Ast, stmts: &[Statement]) -> Vec<usize> {
    stmts
        .iter()
        .enumerate()
        .filter(|(_, s)| !matches!(ast.node(s.node), Node::Precodepos))
        .map(|(i, _)| i)
        .collect()
}

/// Recurse a pass into the nested blocks of one statement.
fn recurse_into(ast: &mut Ast, id: NodeId, pass: fn(&mut Ast, &mut Vec<Statement>)) {
    let mut node = ast.take(id);
    match &mut node {
        Node::IfElse {
            then_block,
            else_block,
            ..
        } => {
            pass(ast, then_block);
            if let Some(else_block) = else_block {
                pass(ast, else_block);
            }
        }
        Node::While { body, .. }
        | Node::For { body, .. }
        | Node::Foreach { body, .. }
        | Node::DevBlock(body) => pass(ast, body),
        Node::Switch { cases, .. } => {
            for case in cases {
                pass(ast, &mut case.body);
            }
        }
        _ => {}
    }
    ast.replace(id, node);
}

fn recurse_all(ast: &mut Ast, stmts: &mut Vec<Statement>, pass: fn(&mut Ast, &mut Vec<Statement>)) {
    for i in 0..stmts.len() {
        recurse_into(ast, stmts[i].node, pass);
    }
}

/// Read-only traversal of a statement's nested blocks.
fn for_child_blocks_ref(ast: &Ast, id: NodeId, f: &mut dyn FnMut(&[Statement])) {
    match ast.node(id) {
        Node::IfElse {
            then_block,
            else_block,
            ..
        } => {
            f(then_block);
            if let Some(else_block) = else_block {
                f(else_block);
            }
        }
        Node::While { body, .. }
        | Node::For { body, .. }
        | Node::Foreach { body, .. }
        | Node::DevBlock(body) => f(body),
        Node::Switch { cases, .. } => {
            for case in cases {
                f(&case.body);
            }
        }
        _ => {}
    }
}

/// Invert a condition, folding double negation and flipping comparisons.
fn negate(ast: &mut Ast, cond: NodeId) -> NodeId {
    let flipped = match ast.node(cond) {
        Node::UnOp { op: "!", expr } => return *expr,
        Node::BinOp { op, lhs, rhs } => {
            let flipped_op = match *op {
                "==" => Some("!="),
                "!=" => Some("=="),
                "<" => Some(">="),
                ">=" => Some("<"),
                ">" => Some("<="),
                "<=" => Some(">"),
                _ => None,
            };
            flipped_op.map(|op| (op, *lhs, *rhs))
        }
        _ => None,
    };
    match flipped {
        Some((op, lhs, rhs)) => ast.push(Node::BinOp { op, lhs, rhs }),
        None => ast.push(Node::UnOp { op: "!", expr: cond }),
    }
}

/// Structural equality for assignable expressions.
fn node_eq(ast: &Ast, a: NodeId, b: NodeId) -> bool {
    match (ast.node(a), ast.node(b)) {
        (Node::LocalVar(x), Node::LocalVar(y)) => x == y,
        (Node::SelfRef, Node::SelfRef) => true,
        (Node::GlobalObject(x), Node::GlobalObject(y)) => x == y,
        (Node::IntConst(x), Node::IntConst(y)) => x == y,
        (Node::StringConst(x), Node::StringConst(y)) => x == y,
        (
            Node::FieldAccess { obj: oa, field: fa },
            Node::FieldAccess { obj: ob, field: fb },
        ) => fa == fb && node_eq(ast, *oa, *ob),
        (
            Node::ArrayAccess { arr: aa, index: ia },
            Node::ArrayAccess { arr: ab, index: ib },
        ) => node_eq(ast, *aa, *ab) && node_eq(ast, *ia, *ib),
        _ => false,
    }
}

fn uses_var_in_node(ast: &Ast, id: NodeId, name: u64) -> bool {
    match ast.node(id) {
        Node::LocalVar(n) => *n == name,
        Node::FieldAccess { obj, .. } => uses_var_in_node(ast, *obj, name),
        Node::ArrayAccess { arr, index } => {
            uses_var_in_node(ast, *arr, name) || uses_var_in_node(ast, *index, name)
        }
        Node::BinOp { lhs, rhs, .. } => {
            uses_var_in_node(ast, *lhs, name) || uses_var_in_node(ast, *rhs, name)
        }
        Node::UnOp { expr, .. } | Node::IsDefined(expr) | Node::FirstArray(expr) | Node::Wait(expr) => {
            uses_var_in_node(ast, *expr, name)
        }
        Node::NextArray(a, b) => uses_var_in_node(ast, *a, name) || uses_var_in_node(ast, *b, name),
        Node::Assign { lhs, rhs, .. } => {
            uses_var_in_node(ast, *lhs, name) || uses_var_in_node(ast, *rhs, name)
        }
        Node::Call { self_obj, args, target, .. } => {
            self_obj.map(|o| uses_var_in_node(ast, o, name)).unwrap_or(false)
                || args.iter().any(|a| uses_var_in_node(ast, *a, name))
                || match target {
                    crate::ast::CallTarget::Pointer(p) => uses_var_in_node(ast, *p, name),
                    _ => false,
                }
        }
        Node::Return(Some(v)) => uses_var_in_node(ast, *v, name),
        Node::Jump { cond: Some(c), .. } => uses_var_in_node(ast, *c, name),
        _ => false,
    }
}

fn uses_var_in_block(ast: &Ast, stmts: &[Statement], name: u64) -> bool {
    stmts.iter().any(|s| {
        if uses_var_in_node(ast, s.node, name) {
            return true;
        }
        let mut found = false;
        for_child_blocks_ref(ast, s.node, &mut |inner| {
            if uses_var_in_block(ast, inner, name) {
                found = true;
            }
        });
        found
    })
}

// ---------------------------------------------------------------------------
// pass 1: developer blocks

fn pass_dev_blocks(ast: &mut Ast, stmts: &mut Vec<Statement>) {
    dev_blocks_impl(ast, stmts, false);
    recurse_all(ast, stmts, pass_dev_blocks);
}

/// `D` variant: dev-gated statements stay inline instead of nesting under a
/// `/# #/` block.
fn pass_dev_blocks_inline(ast: &mut Ast, stmts: &mut Vec<Statement>) {
    dev_blocks_impl(ast, stmts, true);
    recurse_all(ast, stmts, pass_dev_blocks_inline);
}

fn dev_blocks_impl(ast: &mut Ast, stmts: &mut Vec<Statement>, inline: bool) {
    let mut i = 0;
    while i < stmts.len() {
        let target = match ast.node(stmts[i].node) {
            Node::Jump {
                jtype: JumpType::Devblock,
                target,
                ..
            } => Some(*target),
            _ => None,
        };
        if let Some(target) = target {
            if inline {
                ast.replace(stmts[i].node, Node::Precodepos);
            } else {
                let mut end = i + 1;
                while end < stmts.len() && stmts[end].rloc < target {
                    end += 1;
                }
                let body: Vec<Statement> = stmts.drain(i + 1..end).collect();
                ast.replace(stmts[i].node, Node::DevBlock(body));
            }
        }
        i += 1;
    }
}

// ---------------------------------------------------------------------------
// pass 2: switch

fn pass_switch(ast: &mut Ast, stmts: &mut Vec<Statement>) {
    let mut i = 0;
    while i < stmts.len() {
        let pre = match ast.node(stmts[i].node) {
            Node::SwitchPre { value, cases, end } => Some((*value, cases.clone(), *end)),
            _ => None,
        };
        if let Some((value, mut cases, end)) = pre {
            // group by target; shared bodies become consecutive case labels,
            // equal keys ordered by their rendered text
            cases.sort_by(|a, b| {
                a.1.cmp(&b.1).then_with(|| case_key_text(&a.0).cmp(&case_key_text(&b.0)))
            });

            let mut body_end = i + 1;
            while body_end < stmts.len() && stmts[body_end].rloc < end {
                body_end += 1;
            }
            let mut region: Vec<Statement> = stmts.drain(i + 1..body_end).collect();

            let mut switch_cases: Vec<SwitchCase> = Vec::new();
            let mut it = cases.iter().peekable();
            while let Some((key, target)) = it.next() {
                let next_target = it.peek().map(|(_, t)| *t).unwrap_or(end);
                if next_target == *target {
                    // shared body: label falls through to the next case
                    switch_cases.push(SwitchCase {
                        key: Some(key.clone()),
                        body: Vec::new(),
                    });
                    continue;
                }
                let split = region
                    .iter()
                    .position(|s| s.rloc >= next_target)
                    .unwrap_or(region.len());
                let mut body: Vec<Statement> = region.drain(..split).collect();
                convert_exit_jumps(ast, &mut body, end, Node::Break);
                switch_cases.push(SwitchCase {
                    key: Some(key.clone()),
                    body,
                });
            }
            if !region.is_empty() {
                // statements between the last case and the end: default body
                let mut body = region;
                convert_exit_jumps(ast, &mut body, end, Node::Break);
                switch_cases.push(SwitchCase { key: None, body });
            }
            ast.replace(
                stmts[i].node,
                Node::Switch {
                    value,
                    cases: switch_cases,
                },
            );
        }
        i += 1;
    }
    recurse_all(ast, stmts, pass_switch);
}

fn case_key_text(key: &CaseKey) -> String {
    match key {
        CaseKey::Int(v) => format!("{}", v),
        CaseKey::Str(s) => s.clone(),
        CaseKey::Hash(h) => format!("#{:x}", h),
    }
}

fn convert_exit_jumps(ast: &mut Ast, stmts: &mut [Statement], exit: u32, replacement: Node) {
    for stmt in stmts.iter() {
        let is_exit = matches!(
            ast.node(stmt.node),
            Node::Jump {
                jtype: JumpType::Always,
                target,
                ..
            } if *target == exit
        );
        if is_exit {
            ast.replace(stmt.node, replacement.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// pass 3: foreach

fn pass_foreach(ast: &mut Ast, stmts: &mut Vec<Statement>) {
    'again: loop {
        let indices = real_indices(ast, stmts);
        for w in 0..indices.len() {
            if let Some(()) = try_match_foreach(ast, stmts, &indices, w) {
                continue 'again;
            }
        }
        break;
    }
    recurse_all(ast, stmts, pass_foreach);
}

/// The iterator quintet:
///   tmp = <array>; key = firstarray(tmp);
///   H: if (!isdefined(key)) goto E;
///   val = tmp[key]; ...body...; key = nextarray(tmp, key); goto H;
///   E:
fn try_match_foreach(
    ast: &mut Ast,
    stmts: &mut Vec<Statement>,
    indices: &[usize],
    w: usize,
) -> Option<()> {
    // w .. w+3: tmp assign, key init, header jump, value assign
    if w + 3 >= indices.len() {
        return None;
    }
    let (ia, ib, ic, id) = (indices[w], indices[w + 1], indices[w + 2], indices[w + 3]);

    let (tmp_var, array_expr) = match ast.node(stmts[ia].node) {
        Node::Assign { lhs, rhs, op: None } => match ast.node(*lhs) {
            Node::LocalVar(name) => (*name, *rhs),
            _ => return None,
        },
        _ => return None,
    };
    let key_var = match ast.node(stmts[ib].node) {
        Node::Assign { lhs, rhs, op: None } => match (ast.node(*lhs), ast.node(*rhs)) {
            (Node::LocalVar(key), Node::FirstArray(arr)) => {
                if !matches!(ast.node(*arr), Node::LocalVar(n) if *n == tmp_var) {
                    return None;
                }
                *key
            }
            _ => return None,
        },
        _ => return None,
    };
    let header_rloc = stmts[ic].rloc;
    let exit = match ast.node(stmts[ic].node) {
        Node::Jump {
            jtype: JumpType::OnFalse,
            cond: Some(cond),
            target,
            ..
        } => match ast.node(*cond) {
            Node::IsDefined(inner) => {
                if !matches!(ast.node(*inner), Node::LocalVar(n) if *n == key_var) {
                    return None;
                }
                *target
            }
            _ => return None,
        },
        _ => return None,
    };
    let value_var = match ast.node(stmts[id].node) {
        Node::Assign { lhs, rhs, op: None } => match (ast.node(*lhs), ast.node(*rhs)) {
            (Node::LocalVar(value), Node::ArrayAccess { arr, index }) => {
                if !matches!(ast.node(*arr), Node::LocalVar(n) if *n == tmp_var) {
                    return None;
                }
                if !matches!(ast.node(*index), Node::LocalVar(n) if *n == key_var) {
                    return None;
                }
                *value
            }
            _ => return None,
        },
        _ => return None,
    };

    // back edge to the header, preceded by the key advance
    let mut back = None;
    for (pos, &idx) in indices.iter().enumerate().skip(w + 4) {
        if stmts[idx].rloc >= exit {
            break;
        }
        if matches!(
            ast.node(stmts[idx].node),
            Node::Jump { jtype: JumpType::Always, target, .. } if *target == header_rloc
        ) {
            back = Some((pos, idx));
        }
    }
    let (back_pos, back_idx) = back?;
    let advance_idx = indices[back_pos - 1];
    match ast.node(stmts[advance_idx].node) {
        Node::Assign { lhs, rhs, op: None } => {
            let lhs_ok = matches!(ast.node(*lhs), Node::LocalVar(n) if *n == key_var);
            let rhs_ok = matches!(ast.node(*rhs), Node::NextArray(..));
            if !lhs_ok || !rhs_ok {
                return None;
            }
        }
        _ => return None,
    }
    let advance_rloc = stmts[advance_idx].rloc;

    // body: after the value assign, before the key advance
    let mut body: Vec<Statement> = stmts[id + 1..advance_idx].to_vec();
    for stmt in &body {
        let node = ast.node(stmt.node).clone();
        if let Node::Jump {
            jtype: JumpType::Always,
            target,
            ..
        } = node
        {
            if target == exit {
                ast.replace(stmt.node, Node::Break);
            } else if target == advance_rloc || target == header_rloc {
                ast.replace(stmt.node, Node::Continue);
            }
        }
    }
    let key = if uses_var_in_block(ast, &body, key_var) {
        Some(key_var)
    } else {
        None
    };
    let foreach = ast.push(Node::Foreach {
        key_var: key,
        value_var,
        array: array_expr,
        body,
    });
    let anchor_rloc = stmts[ia].rloc;
    stmts.drain(ia..=back_idx);
    stmts.insert(
        ia,
        Statement {
            node: foreach,
            rloc: anchor_rloc,
        },
    );
    Some(())
}

// ---------------------------------------------------------------------------
// pass 4: while

fn pass_while(ast: &mut Ast, stmts: &mut Vec<Statement>) {
    'again: loop {
        for j in 0..stmts.len() {
            let header = match ast.node(stmts[j].node) {
                Node::Jump {
                    jtype: JumpType::Always,
                    target,
                    delta,
                    ..
                } if *delta < 0 => Some(*target),
                _ => None,
            };
            let Some(header_rloc) = header else { continue };
            if build_while(ast, stmts, j, header_rloc) {
                continue 'again;
            }
        }
        break;
    }
    recurse_all(ast, stmts, pass_while);
}

fn build_while(ast: &mut Ast, stmts: &mut Vec<Statement>, j: usize, header_rloc: u32) -> bool {
    // first statement at or after the header location
    let Some(i) = stmts.iter().position(|s| s.rloc >= header_rloc) else {
        return false;
    };
    if i > j {
        return false;
    }
    let exit_rloc = stmts
        .get(j + 1)
        .map(|s| s.rloc)
        .unwrap_or_else(|| stmts[j].rloc + 1);

    // loop condition: a forward conditional jump at the header exiting the loop
    let mut cond = None;
    let mut body_start = i;
    for (idx, stmt) in stmts.iter().enumerate().skip(i).take(j - i) {
        match ast.node(stmt.node) {
            Node::Precodepos => continue,
            Node::Jump {
                jtype: jtype @ (JumpType::OnFalse | JumpType::OnTrue),
                cond: Some(c),
                target,
                ..
            } if *target >= exit_rloc => {
                cond = Some((*jtype, *c));
                body_start = idx + 1;
                break;
            }
            _ => break,
        }
    }

    let cond_node = match cond {
        Some((JumpType::OnFalse, c)) => Some(c),
        Some((JumpType::OnTrue, c)) => Some(negate(ast, c)),
        _ => None,
    };
    if cond.is_none() {
        body_start = i;
        // skip leading markers into the body
        while body_start < j && matches!(ast.node(stmts[body_start].node), Node::Precodepos) {
            body_start += 1;
        }
    }

    let body: Vec<Statement> = stmts[body_start..j].to_vec();
    for stmt in &body {
        let node = ast.node(stmt.node).clone();
        if let Node::Jump {
            jtype: JumpType::Always,
            target,
            ..
        } = node
        {
            if target >= exit_rloc {
                ast.replace(stmt.node, Node::Break);
            } else if target == header_rloc {
                ast.replace(stmt.node, Node::Continue);
            }
        }
    }

    let while_node = ast.push(Node::While {
        cond: cond_node,
        body,
    });
    stmts.drain(i..=j);
    stmts.insert(
        i,
        Statement {
            node: while_node,
            rloc: header_rloc,
        },
    );
    true
}

// ---------------------------------------------------------------------------
// pass 5: for

fn pass_for(ast: &mut Ast, stmts: &mut Vec<Statement>) {
    let indices = real_indices(ast, stmts);
    for w in 0..indices.len() {
        let i = indices[w];
        let (cond, body) = match ast.node(stmts[i].node) {
            Node::While {
                cond: Some(cond),
                body,
            } => (*cond, body.clone()),
            _ => continue,
        };
        // init: the immediately preceding assignment to a variable the
        // condition reads
        if w == 0 {
            continue;
        }
        let init_idx = indices[w - 1];
        let init_var = match ast.node(stmts[init_idx].node) {
            Node::Assign { lhs, .. } => match ast.node(*lhs) {
                Node::LocalVar(name) => Some(*name),
                _ => None,
            },
            _ => None,
        };
        let Some(init_var) = init_var else { continue };
        if !uses_var_in_node(ast, cond, init_var) {
            continue;
        }
        // update: the loop body's trailing assignment to the same variable
        let body_real = real_indices(ast, &body);
        let Some(&last) = body_real.last() else { continue };
        let update_ok = match ast.node(body[last].node) {
            Node::Assign { lhs, .. } => {
                matches!(ast.node(*lhs), Node::LocalVar(name) if *name == init_var)
            }
            _ => false,
        };
        if !update_ok {
            continue;
        }

        let init = stmts[init_idx].node;
        let post = body[last].node;
        let mut new_body = body;
        new_body.remove(last);
        ast.replace(
            stmts[i].node,
            Node::For {
                init: Some(init),
                cond: Some(cond),
                post: Some(post),
                body: new_body,
            },
        );
        stmts.remove(init_idx);
        // indices are stale after the removal; restart
        pass_for(ast, stmts);
        return;
    }
    recurse_all(ast, stmts, pass_for);
}

// ---------------------------------------------------------------------------
// pass 6: if / else

fn pass_if_else(ast: &mut Ast, stmts: &mut Vec<Statement>) {
    'again: loop {
        for i in 0..stmts.len() {
            let jump = match ast.node(stmts[i].node) {
                Node::Jump {
                    jtype: jtype @ (JumpType::OnFalse | JumpType::OnTrue),
                    cond: Some(cond),
                    target,
                    delta,
                    ..
                } if *delta >= 0 => Some((*jtype, *cond, *target)),
                _ => None,
            };
            let Some((jtype, cond, target)) = jump else { continue };

            let mut then_end = i + 1;
            while then_end < stmts.len() && stmts[then_end].rloc < target {
                then_end += 1;
            }
            let mut then_block: Vec<Statement> = stmts.drain(i + 1..then_end).collect();

            // forward jump over the else branch
            let mut else_block = None;
            let trailing = real_indices(ast, &then_block).last().copied();
            if let Some(t) = trailing {
                if let Node::Jump {
                    jtype: JumpType::Always,
                    target: else_end,
                    delta,
                    ..
                } = ast.node(then_block[t].node)
                {
                    if *delta > 0 && *else_end > target {
                        let else_end = *else_end;
                        then_block.remove(t);
                        let mut end = i + 1;
                        while end < stmts.len() && stmts[end].rloc < else_end {
                            end += 1;
                        }
                        let block: Vec<Statement> = stmts.drain(i + 1..end).collect();
                        if !block.is_empty() {
                            else_block = Some(block);
                        }
                    }
                }
            }

            let cond = if jtype == JumpType::OnFalse {
                cond
            } else {
                negate(ast, cond)
            };
            ast.replace(
                stmts[i].node,
                Node::IfElse {
                    cond,
                    then_block,
                    else_block,
                },
            );
            continue 'again;
        }
        break;
    }
    recurse_all(ast, stmts, pass_if_else);
}

// ---------------------------------------------------------------------------
// pass 7: return jump

fn pass_return_jump(ast: &mut Ast, stmts: &mut Vec<Statement>, end_rloc: u32) {
    for stmt in stmts.iter() {
        let is_end_jump = matches!(
            ast.node(stmt.node),
            Node::Jump { jtype: JumpType::Always, target, .. } if *target == end_rloc
        );
        if is_end_jump {
            ast.replace(stmt.node, Node::Return(None));
        }
    }
    for i in 0..stmts.len() {
        let id = stmts[i].node;
        let mut node = ast.take(id);
        match &mut node {
            Node::IfElse {
                then_block,
                else_block,
                ..
            } => {
                pass_return_jump(ast, then_block, end_rloc);
                if let Some(else_block) = else_block {
                    pass_return_jump(ast, else_block, end_rloc);
                }
            }
            Node::While { body, .. }
            | Node::For { body, .. }
            | Node::Foreach { body, .. }
            | Node::DevBlock(body) => pass_return_jump(ast, body, end_rloc),
            Node::Switch { cases, .. } => {
                for case in cases {
                    pass_return_jump(ast, &mut case.body, end_rloc);
                }
            }
            _ => {}
        }
        ast.replace(id, node);
    }
}

// ---------------------------------------------------------------------------
// pass 8: boolean return

fn pass_bool_return(ast: &mut Ast, stmts: &mut Vec<Statement>) {
    // two-armed form: if (c) { return 1; } else { return 0; }
    for i in 0..stmts.len() {
        let collapse = match ast.node(stmts[i].node) {
            Node::IfElse {
                cond,
                then_block,
                else_block: Some(else_block),
            } => {
                match (
                    single_bool_return(ast, then_block),
                    single_bool_return(ast, else_block),
                ) {
                    (Some(true), Some(false)) => Some((*cond, false)),
                    (Some(false), Some(true)) => Some((*cond, true)),
                    _ => None,
                }
            }
            _ => None,
        };
        if let Some((cond, invert)) = collapse {
            let value = if invert { negate(ast, cond) } else { cond };
            ast.replace(stmts[i].node, Node::Return(Some(value)));
        }
    }

    // fall-through form: if (c) { return 1; } return 0;
    let indices = real_indices(ast, stmts);
    for w in 0..indices.len().saturating_sub(1) {
        let (i, k) = (indices[w], indices[w + 1]);
        let collapse = match ast.node(stmts[i].node) {
            Node::IfElse {
                cond,
                then_block,
                else_block: None,
            } => match single_bool_return(ast, then_block) {
                Some(then_value) => match ast.node(stmts[k].node) {
                    Node::Return(Some(v)) => match ast.as_bool_const(*v) {
                        Some(tail_value) if tail_value != then_value => {
                            Some((*cond, !then_value))
                        }
                        _ => None,
                    },
                    _ => None,
                },
                None => None,
            },
            _ => None,
        };
        if let Some((cond, invert)) = collapse {
            let value = if invert { negate(ast, cond) } else { cond };
            ast.replace(stmts[i].node, Node::Return(Some(value)));
            stmts.remove(k);
            pass_bool_return(ast, stmts);
            return;
        }
    }
    recurse_all(ast, stmts, pass_bool_return);
}

/// A block consisting of exactly one `return 1;` or `return 0;`.
fn single_bool_return(ast: &Ast, stmts: &[Statement]) -> Option<bool> {
    let real = real_indices(ast, stmts);
    if real.len() != 1 {
        return None;
    }
    match ast.node(stmts[real[0]].node) {
        Node::Return(Some(v)) => ast.as_bool_const(*v),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// pass 9: special patterns

fn pass_special_patterns(ast: &mut Ast, stmts: &mut Vec<Statement>) {
    for i in 0..stmts.len() {
        let compound = match ast.node(stmts[i].node) {
            Node::Assign {
                lhs,
                rhs,
                op: None,
            } => match ast.node(*rhs) {
                Node::BinOp {
                    op,
                    lhs: blhs,
                    rhs: brhs,
                } if is_compoundable(op) && node_eq(ast, *lhs, *blhs) => {
                    Some((*lhs, *op, *brhs))
                }
                _ => None,
            },
            _ => None,
        };
        if let Some((lhs, op, rhs)) = compound {
            ast.replace(stmts[i].node, Node::Assign { lhs, rhs, op: Some(op) });
        }
    }
    recurse_all(ast, stmts, pass_special_patterns);
}

fn is_compoundable(op: &str) -> bool {
    matches!(op, "+" | "-" | "*" | "/" | "%" | "&" | "|" | "^" | "<<" | ">>")
}
