use std::fmt;

/// Arena handle. Nodes reference each other through ids so the structured
/// rewrites never need shared ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// One statement of a function block: a node plus the relative bytecode
/// location it was produced at.
#[derive(Debug, Clone, Copy)]
pub struct Statement {
    pub node: NodeId,
    pub rloc: u32,
}

/// Ordered statement list of one export.
#[derive(Debug, Default, Clone)]
pub struct FunctionBlock {
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaseKey {
    Int(i64),
    Str(String),
    Hash(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpType {
    Always,
    OnTrue,
    OnFalse,
    Devblock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Function,
    Thread,
    ChildThread,
    Method,
    MethodThread,
    MethodChildThread,
    Builtin,
    BuiltinMethod,
    Pointer,
    MethodPointer,
}

impl CallKind {
    pub fn is_method(self) -> bool {
        matches!(
            self,
            CallKind::Method
                | CallKind::MethodThread
                | CallKind::MethodChildThread
                | CallKind::BuiltinMethod
                | CallKind::MethodPointer
        )
    }

    /// `thread` / `childthread` keyword, if any.
    pub fn thread_keyword(self) -> Option<&'static str> {
        match self {
            CallKind::Thread | CallKind::MethodThread => Some("thread"),
            CallKind::ChildThread | CallKind::MethodChildThread => Some("childthread"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallTarget {
    Import { namespace: u64, name: u64 },
    Pointer(NodeId),
}

#[derive(Debug, Clone)]
pub struct SwitchCase {
    /// `None` is the default case.
    pub key: Option<CaseKey>,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone)]
pub enum Node {
    Undefined,
    IntConst(i64),
    FloatConst(f32),
    StringConst(String),
    HashConst(u64),
    AnimTree(String),
    Animation(String, String),
    SelfRef,
    EmptyArray,
    GlobalObject(u64),
    LocalVar(u64),
    FuncRef {
        namespace: u64,
        name: u64,
    },
    FieldAccess {
        obj: NodeId,
        field: u64,
    },
    ArrayAccess {
        arr: NodeId,
        index: NodeId,
    },
    BinOp {
        op: &'static str,
        lhs: NodeId,
        rhs: NodeId,
    },
    UnOp {
        op: &'static str,
        expr: NodeId,
    },
    IsDefined(NodeId),
    FirstArray(NodeId),
    NextArray(NodeId, NodeId),
    Assign {
        lhs: NodeId,
        rhs: NodeId,
        /// compound operator, `Some("+")` for `+=`
        op: Option<&'static str>,
    },
    Call {
        target: CallTarget,
        kind: CallKind,
        self_obj: Option<NodeId>,
        args: Vec<NodeId>,
    },
    Wait(NodeId),
    Jump {
        jtype: JumpType,
        cond: Option<NodeId>,
        /// absolute relative location of the target
        target: u32,
        delta: i64,
    },
    SwitchPre {
        value: NodeId,
        cases: Vec<(CaseKey, u32)>,
        end: u32,
    },
    Return(Option<NodeId>),
    End,
    /// Pure label marker, consumed by the reconstruction passes.
    Precodepos,
    /// Call boundary marker pushed by `PreScriptCall`; never reaches a
    /// statement list.
    PreCall,

    IfElse {
        cond: NodeId,
        then_block: Vec<Statement>,
        else_block: Option<Vec<Statement>>,
    },
    While {
        /// `None` for `while (true)`
        cond: Option<NodeId>,
        body: Vec<Statement>,
    },
    For {
        init: Option<NodeId>,
        cond: Option<NodeId>,
        post: Option<NodeId>,
        body: Vec<Statement>,
    },
    Foreach {
        key_var: Option<u64>,
        value_var: u64,
        array: NodeId,
        body: Vec<Statement>,
    },
    Switch {
        value: NodeId,
        cases: Vec<SwitchCase>,
    },
    DevBlock(Vec<Statement>),
    Break,
    Continue,
}

impl Node {
    /// Markers invisible in the emitted source.
    pub fn is_marker(&self) -> bool {
        matches!(self, Node::Precodepos | Node::End)
    }
}

/// Node arena for one export.
#[derive(Debug, Default, Clone)]
pub struct Ast {
    nodes: Vec<Node>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Swap a node out, leaving a marker behind. Used by passes that move a
    /// node's block contents into a new structured node.
    pub fn take(&mut self, id: NodeId) -> Node {
        std::mem::replace(&mut self.nodes[id.index()], Node::Precodepos)
    }

    pub fn replace(&mut self, id: NodeId, node: Node) {
        self.nodes[id.index()] = node;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// `1`/`0` integer constants, the shapes a boolean return collapses.
    pub fn as_bool_const(&self, id: NodeId) -> Option<bool> {
        match self.node(id) {
            Node::IntConst(1) => Some(true),
            Node::IntConst(0) => Some(false),
            _ => None,
        }
    }
}

/// Number of statements that actually render, ignoring markers.
pub fn count_real_statements(ast: &Ast, statements: &[Statement]) -> usize {
    statements
        .iter()
        .filter(|s| !ast.node(s.node).is_marker())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_push_and_take() {
        let mut ast = Ast::new();
        let a = ast.push(Node::IntConst(1));
        let b = ast.push(Node::UnOp { op: "!", expr: a });
        assert_eq!(ast.len(), 2);
        assert!(matches!(ast.node(b), Node::UnOp { .. }));

        let taken = ast.take(a);
        assert!(matches!(taken, Node::IntConst(1)));
        assert!(matches!(ast.node(a), Node::Precodepos));
    }

    #[test]
    fn bool_const_detection() {
        let mut ast = Ast::new();
        let one = ast.push(Node::IntConst(1));
        let zero = ast.push(Node::IntConst(0));
        let two = ast.push(Node::IntConst(2));
        assert_eq!(ast.as_bool_const(one), Some(true));
        assert_eq!(ast.as_bool_const(zero), Some(false));
        assert_eq!(ast.as_bool_const(two), None);
    }

    #[test]
    fn marker_statements_are_not_counted() {
        let mut ast = Ast::new();
        let real = ast.push(Node::IntConst(3));
        let marker = ast.push(Node::Precodepos);
        let end = ast.push(Node::End);
        let stmts = vec![
            Statement { node: real, rloc: 0 },
            Statement { node: marker, rloc: 2 },
            Statement { node: end, rloc: 4 },
        ];
        assert_eq!(count_real_statements(&ast, &stmts), 1);
    }
}
