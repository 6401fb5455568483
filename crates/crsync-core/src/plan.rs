//! Logical query plan AST.
//!
//! This is not a SQL parser. Plans are built by whatever layer owns query
//! construction and handed here so their table dependencies can be walked.

use crate::types::Value;

/// A logical plan for one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Select(Box<Select>),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

/// A SELECT, including its CTEs and compound members.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Select {
    pub ctes: Vec<Cte>,
    pub projection: Vec<SelectItem>,
    pub from: Vec<TableExpr>,
    pub joins: Vec<Join>,
    pub selection: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<Expr>,
    /// `UNION`, `INTERSECT`, `EXCEPT` members, in order.
    pub compound: Vec<(CompoundOp, Select)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cte {
    pub name: String,
    pub query: Select,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Wildcard,
    Expr { expr: Expr, alias: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundOp {
    Union,
    UnionAll,
    Intersect,
    Except,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub target: TableExpr,
    pub on: Option<Expr>,
}

/// A table source.
#[derive(Debug, Clone, PartialEq)]
pub enum TableExpr {
    Table(TableRef),
    Alias { expr: Box<TableExpr>, alias: String },
    SubSelect(Box<Select>),
}

/// A possibly schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

/// Scalar expressions. Only the variants that can hold a sub-select matter
/// for dependency extraction; the rest are carried for completeness.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column {
        table: Option<String>,
        name: String,
    },
    Literal(Value),
    Binary {
        op: String,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: String,
        expr: Box<Expr>,
    },
    Function {
        name: String,
        args: Vec<Expr>,
    },
    Subquery(Box<Select>),
    Exists(Box<Select>),
    InSubquery {
        expr: Box<Expr>,
        subquery: Box<Select>,
        negated: bool,
    },
    Case {
        operand: Option<Box<Expr>>,
        branches: Vec<(Expr, Expr)>,
        otherwise: Option<Box<Expr>>,
    },
    /// Opaque SQL fragment. Never inspected.
    Raw(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: TableRef,
    pub columns: Vec<String>,
    pub source: InsertSource,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertSource {
    Values(Vec<Vec<Expr>>),
    Select(Box<Select>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: TableRef,
    pub assignments: Vec<(String, Expr)>,
    pub from: Vec<TableExpr>,
    pub selection: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: TableRef,
    pub selection: Option<Expr>,
}

// ============================================================================
// Construction helpers
// ============================================================================

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }
}

impl TableExpr {
    pub fn table(name: impl Into<String>) -> Self {
        TableExpr::Table(TableRef::new(name))
    }

    pub fn alias(self, alias: impl Into<String>) -> Self {
        TableExpr::Alias {
            expr: Box::new(self),
            alias: alias.into(),
        }
    }

    pub fn subselect(select: Select) -> Self {
        TableExpr::SubSelect(Box::new(select))
    }
}

impl Select {
    /// `SELECT * FROM <source>`.
    pub fn all_from(source: TableExpr) -> Self {
        Self {
            projection: vec![SelectItem::Wildcard],
            from: vec![source],
            ..Self::default()
        }
    }

    pub fn join(mut self, kind: JoinKind, target: TableExpr, on: Option<Expr>) -> Self {
        self.joins.push(Join { kind, target, on });
        self
    }

    pub fn project(mut self, expr: Expr, alias: Option<&str>) -> Self {
        self.projection.push(SelectItem::Expr {
            expr,
            alias: alias.map(str::to_string),
        });
        self
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        self.selection = Some(expr);
        self
    }

    pub fn with(mut self, name: impl Into<String>, query: Select) -> Self {
        self.ctes.push(Cte {
            name: name.into(),
            query,
        });
        self
    }

    pub fn into_plan(self) -> Plan {
        Plan::Select(Box::new(self))
    }
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column {
            table: None,
            name: name.into(),
        }
    }

    pub fn subquery(select: Select) -> Self {
        Expr::Subquery(Box::new(select))
    }
}

// ============================================================================
// Visitor
// ============================================================================

/// Read-only traversal over a plan.
///
/// Override a `visit_*` method to observe a node; call the matching `walk_*`
/// function from the override to keep descending.
pub trait Visitor {
    fn visit_plan(&mut self, plan: &Plan) {
        walk_plan(self, plan);
    }

    fn visit_select(&mut self, select: &Select) {
        walk_select(self, select);
    }

    fn visit_table_expr(&mut self, table: &TableExpr) {
        walk_table_expr(self, table);
    }

    fn visit_table_ref(&mut self, _table: &TableRef) {}

    fn visit_expr(&mut self, expr: &Expr) {
        walk_expr(self, expr);
    }
}

pub fn walk_plan<V: Visitor + ?Sized>(visitor: &mut V, plan: &Plan) {
    match plan {
        Plan::Select(select) => visitor.visit_select(select),
        Plan::Insert(insert) => {
            visitor.visit_table_ref(&insert.table);
            match &insert.source {
                InsertSource::Values(rows) => {
                    for expr in rows.iter().flatten() {
                        visitor.visit_expr(expr);
                    }
                }
                InsertSource::Select(select) => visitor.visit_select(select),
            }
        }
        Plan::Update(update) => {
            visitor.visit_table_ref(&update.table);
            for (_, expr) in &update.assignments {
                visitor.visit_expr(expr);
            }
            for source in &update.from {
                visitor.visit_table_expr(source);
            }
            if let Some(expr) = &update.selection {
                visitor.visit_expr(expr);
            }
        }
        Plan::Delete(delete) => {
            visitor.visit_table_ref(&delete.table);
            if let Some(expr) = &delete.selection {
                visitor.visit_expr(expr);
            }
        }
    }
}

pub fn walk_select<V: Visitor + ?Sized>(visitor: &mut V, select: &Select) {
    for cte in &select.ctes {
        visitor.visit_select(&cte.query);
    }
    for item in &select.projection {
        if let SelectItem::Expr { expr, .. } = item {
            visitor.visit_expr(expr);
        }
    }
    for source in &select.from {
        visitor.visit_table_expr(source);
    }
    for join in &select.joins {
        visitor.visit_table_expr(&join.target);
        if let Some(on) = &join.on {
            visitor.visit_expr(on);
        }
    }
    if let Some(expr) = &select.selection {
        visitor.visit_expr(expr);
    }
    for expr in &select.group_by {
        visitor.visit_expr(expr);
    }
    if let Some(expr) = &select.having {
        visitor.visit_expr(expr);
    }
    for expr in &select.order_by {
        visitor.visit_expr(expr);
    }
    for (_, member) in &select.compound {
        visitor.visit_select(member);
    }
}

pub fn walk_table_expr<V: Visitor + ?Sized>(visitor: &mut V, table: &TableExpr) {
    match table {
        TableExpr::Table(table_ref) => visitor.visit_table_ref(table_ref),
        TableExpr::Alias { expr, .. } => visitor.visit_table_expr(expr),
        TableExpr::SubSelect(select) => visitor.visit_select(select),
    }
}

pub fn walk_expr<V: Visitor + ?Sized>(visitor: &mut V, expr: &Expr) {
    match expr {
        Expr::Column { .. } | Expr::Literal(_) | Expr::Raw(_) => {}
        Expr::Binary { left, right, .. } => {
            visitor.visit_expr(left);
            visitor.visit_expr(right);
        }
        Expr::Unary { expr, .. } => visitor.visit_expr(expr),
        Expr::Function { args, .. } => {
            for arg in args {
                visitor.visit_expr(arg);
            }
        }
        Expr::Subquery(select) | Expr::Exists(select) => visitor.visit_select(select),
        Expr::InSubquery { expr, subquery, .. } => {
            visitor.visit_expr(expr);
            visitor.visit_select(subquery);
        }
        Expr::Case {
            operand,
            branches,
            otherwise,
        } => {
            if let Some(operand) = operand {
                visitor.visit_expr(operand);
            }
            for (when, then) in branches {
                visitor.visit_expr(when);
                visitor.visit_expr(then);
            }
            if let Some(otherwise) = otherwise {
                visitor.visit_expr(otherwise);
            }
        }
    }
}
