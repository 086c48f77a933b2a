//! Abstract syntax tree

/// Binary operators, in source-level spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Str(String),
    Bool(bool),
    Null,
    Var(String),
    /// Ordered key/value pairs; keys may come from bare identifiers or
    /// string literals.
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    MethodCall {
        target: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
}

/// One statement with the line it started on.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub line: usize,
    pub kind: StmtKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    FuncDef {
        name: String,
        params: Vec<String>,
        body: Vec<Stmt>,
    },
    ClassDef {
        name: String,
        body: Vec<Stmt>,
    },
    Assign {
        name: String,
        value: Expr,
    },
    MemberAssign {
        target: Expr,
        field: String,
        value: Expr,
    },
    IndexAssign {
        target: Expr,
        index: Expr,
        value: Expr,
    },
    ExprStmt(Expr),
    Return(Option<Expr>),
    Break,
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    For {
        var: String,
        iter: Expr,
        body: Vec<Stmt>,
    },
    WithPolicy {
        overlay: Expr,
        body: Vec<Stmt>,
    },
    Retry {
        attempts: i64,
        backoff_ms: i64,
        body: Vec<Stmt>,
    },
    Timeout {
        ms: i64,
        body: Vec<Stmt>,
    },
    Guard {
        cond: Expr,
    },
}

impl StmtKind {
    /// Node-type name recorded in `stmt` events.
    pub fn node_name(&self) -> &'static str {
        match self {
            Self::FuncDef { .. } => "FuncDef",
            Self::ClassDef { .. } => "ClassDef",
            Self::Assign { .. } => "Assign",
            Self::MemberAssign { .. } => "MemberAssign",
            Self::IndexAssign { .. } => "IndexAssign",
            Self::ExprStmt(_) => "ExprStmt",
            Self::Return(_) => "Return",
            Self::Break => "Break",
            Self::If { .. } => "If",
            Self::While { .. } => "While",
            Self::For { .. } => "For",
            Self::WithPolicy { .. } => "WithPolicy",
            Self::Retry { .. } => "Retry",
            Self::Timeout { .. } => "Timeout",
            Self::Guard { .. } => "Guard",
        }
    }
}
