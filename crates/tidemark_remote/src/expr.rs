//! Subset descriptors and the where-expression tree.

use std::fmt::Write as _;
use tidemark_core::Value;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
}

impl CompareOp {
    /// The operator's textual form in the remote's query language.
    #[must_use]
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// A comparison right-hand side.
///
/// Host runtimes sometimes thread live field references through filter
/// expressions; those cannot be evaluated remotely and are rejected during
/// translation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// A literal value, bound as a query parameter.
    Value(Value),
    /// A reactive reference to another field (untranslatable).
    FieldRef(String),
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Operand::Value(value)
    }
}

impl From<&str> for Operand {
    fn from(value: &str) -> Self {
        Operand::Value(Value::from(value))
    }
}

impl From<String> for Operand {
    fn from(value: String) -> Self {
        Operand::Value(Value::from(value))
    }
}

impl From<bool> for Operand {
    fn from(value: bool) -> Self {
        Operand::Value(Value::from(value))
    }
}

impl From<i64> for Operand {
    fn from(value: i64) -> Self {
        Operand::Value(Value::from(value))
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Operand::Value(Value::from(value))
    }
}

impl From<tidemark_core::RecordId> for Operand {
    fn from(value: tidemark_core::RecordId) -> Self {
        Operand::Value(Value::Record(value))
    }
}

/// A where-expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Every branch must hold.
    And(Vec<Expr>),
    /// At least one branch must hold.
    Or(Vec<Expr>),
    /// The inner expression must not hold.
    Not(Box<Expr>),
    /// A binary comparison on a field path.
    Compare {
        /// Dot-separated field path.
        field: String,
        /// Operator.
        op: CompareOp,
        /// Right-hand side.
        value: Operand,
    },
    /// SQL-style pattern match.
    Like {
        /// Dot-separated field path.
        field: String,
        /// Pattern with `%`/`_` wildcards.
        pattern: String,
        /// Fold both sides through `string::lower` first.
        case_insensitive: bool,
    },
    /// Membership test. An empty list is unsatisfiable.
    In {
        /// Dot-separated field path.
        field: String,
        /// Candidate values.
        values: Vec<Value>,
    },
    /// The field is present and null.
    IsNull(String),
    /// The field is absent (the remote's `NONE`).
    IsNone(String),
}

impl Expr {
    /// Convenience constructor for an equality comparison.
    pub fn eq(field: impl Into<String>, value: impl Into<Operand>) -> Self {
        Expr::Compare {
            field: field.into(),
            op: CompareOp::Eq,
            value: value.into(),
        }
    }

    /// Convenience constructor for any comparison.
    pub fn cmp(field: impl Into<String>, op: CompareOp, value: impl Into<Operand>) -> Self {
        Expr::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }
}

/// An order-by clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    /// Dot-separated field path.
    pub field: String,
    /// Sort direction.
    pub descending: bool,
}

impl OrderBy {
    /// Ascending order on a field.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    /// Descending order on a field.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }
}

/// A subset descriptor: one loadable slice of a table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subset {
    /// Filter tree; `None` selects the whole table.
    pub filter: Option<Expr>,
    /// Ordering clauses.
    pub order_by: Vec<OrderBy>,
    /// Row cap.
    pub limit: Option<u64>,
    /// Rows to skip.
    pub offset: Option<u64>,
    /// Opaque continuation token; part of the identity of the subset but
    /// interpreted by the host, not by translation.
    pub cursor: Option<String>,
}

impl Subset {
    /// The whole-table subset.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Builder: sets the filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Builder: appends an ordering clause.
    #[must_use]
    pub fn with_order(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    /// Builder: sets the row cap.
    #[must_use]
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Builder: sets the offset.
    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// A stable canonical string identifying this descriptor.
    ///
    /// Equal descriptors produce equal keys regardless of how they were
    /// built; the subset cache and live-event gating key on it.
    #[must_use]
    pub fn cache_key(&self) -> String {
        let mut out = String::from("subset{");
        match &self.filter {
            None => out.push_str("where:*"),
            Some(expr) => {
                out.push_str("where:");
                write_expr_key(&mut out, expr);
            }
        }
        out.push_str(";order:");
        for clause in &self.order_by {
            let _ = write!(
                out,
                "{}{},",
                clause.field,
                if clause.descending { "-" } else { "+" }
            );
        }
        let _ = write!(
            out,
            ";limit:{:?};offset:{:?};cursor:{:?}}}",
            self.limit, self.offset, self.cursor
        );
        out
    }
}

fn write_expr_key(out: &mut String, expr: &Expr) {
    match expr {
        Expr::And(branches) => {
            out.push_str("and(");
            for b in branches {
                write_expr_key(out, b);
                out.push(',');
            }
            out.push(')');
        }
        Expr::Or(branches) => {
            out.push_str("or(");
            for b in branches {
                write_expr_key(out, b);
                out.push(',');
            }
            out.push(')');
        }
        Expr::Not(inner) => {
            out.push_str("not(");
            write_expr_key(out, inner);
            out.push(')');
        }
        Expr::Compare { field, op, value } => {
            let _ = write!(out, "cmp({field},{},", op.symbol());
            match value {
                Operand::Value(v) => {
                    let _ = write!(out, "{}", v.to_json());
                }
                Operand::FieldRef(name) => {
                    let _ = write!(out, "ref:{name}");
                }
            }
            out.push(')');
        }
        Expr::Like {
            field,
            pattern,
            case_insensitive,
        } => {
            let _ = write!(out, "like({field},{pattern:?},{case_insensitive})");
        }
        Expr::In { field, values } => {
            let _ = write!(out, "in({field},[");
            for v in values {
                let _ = write!(out, "{},", v.to_json());
            }
            out.push_str("])");
        }
        Expr::IsNull(field) => {
            let _ = write!(out, "isnull({field})");
        }
        Expr::IsNone(field) => {
            let _ = write!(out, "isnone({field})");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_stable() {
        let a = Subset::all()
            .with_filter(Expr::eq("status", "open"))
            .with_order(OrderBy::desc("updated_at"))
            .with_limit(10);
        let b = Subset::all()
            .with_filter(Expr::eq("status", "open"))
            .with_order(OrderBy::desc("updated_at"))
            .with_limit(10);
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn cache_key_distinguishes_descriptors() {
        let base = Subset::all().with_filter(Expr::eq("status", "open"));
        assert_ne!(base.cache_key(), Subset::all().cache_key());
        assert_ne!(
            base.cache_key(),
            Subset::all().with_filter(Expr::eq("status", "done")).cache_key()
        );
        assert_ne!(
            base.clone().with_limit(5).cache_key(),
            base.with_limit(6).cache_key()
        );
    }

    #[test]
    fn whole_table_key() {
        assert!(Subset::all().cache_key().contains("where:*"));
    }
}
