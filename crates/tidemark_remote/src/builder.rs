//! Translation of subset descriptors into parameterized queries.

use crate::error::{RemoteError, RemoteResult};
use crate::expr::{Expr, Operand, Subset};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tidemark_core::Value;

/// A translated query plus its parameter bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    /// Query text with `$pN` placeholders.
    pub sql: String,
    /// Placeholder name → value.
    pub bindings: BTreeMap<String, Value>,
}

/// Options the translator needs about the target table.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Append a `sync_deleted = false` filter.
    pub sync_filtered: bool,
    /// Rewrite the `from`/`to` field paths to the remote's edge fields
    /// `in`/`out`.
    pub edge_relation: bool,
}

/// Translates `SELECT * FROM <table>` with the descriptor's filter,
/// ordering, and windowing.
///
/// # Errors
///
/// Fails before any query is issued when the descriptor contains an
/// untranslatable construct (a reactive field reference on a right-hand
/// side).
pub fn build_select(table: &str, subset: &Subset, opts: BuildOptions) -> RemoteResult<BuiltQuery> {
    let mut ctx = BindCtx::default();
    let mut clauses = Vec::new();

    if let Some(filter) = &subset.filter {
        clauses.push(translate_expr(filter, opts, &mut ctx)?);
    }
    if opts.sync_filtered {
        clauses.push("sync_deleted = false".to_owned());
    }

    let mut sql = format!("SELECT * FROM {table}");
    if !clauses.is_empty() {
        let _ = write!(sql, " WHERE {}", clauses.join(" AND "));
    }
    if !subset.order_by.is_empty() {
        let rendered: Vec<String> = subset
            .order_by
            .iter()
            .map(|clause| {
                format!(
                    "{} {}",
                    field_path(&clause.field, opts),
                    if clause.descending { "DESC" } else { "ASC" }
                )
            })
            .collect();
        let _ = write!(sql, " ORDER BY {}", rendered.join(", "));
    }
    if let Some(limit) = subset.limit {
        let _ = write!(sql, " LIMIT {limit}");
    }
    if let Some(offset) = subset.offset {
        let _ = write!(sql, " START {offset}");
    }

    Ok(BuiltQuery {
        sql,
        bindings: ctx.bindings,
    })
}

/// Translates the distinct-documents discovery query for an update log.
#[must_use]
pub fn build_doc_index(log_table: &str) -> BuiltQuery {
    BuiltQuery {
        sql: format!("SELECT doc FROM {log_table} GROUP BY doc"),
        bindings: BTreeMap::new(),
    }
}

/// Translates the log-replay query: rows for one document, optionally
/// after a snapshot timestamp, in ascending time order.
#[must_use]
pub fn build_log_replay(log_table: &str, doc: Value, after: Option<Value>) -> BuiltQuery {
    let mut bindings = BTreeMap::new();
    bindings.insert("p0".to_owned(), doc);
    let mut sql = format!("SELECT * FROM {log_table} WHERE doc = $p0");
    if let Some(after) = after {
        bindings.insert("p1".to_owned(), after);
        sql.push_str(" AND ts > $p1");
    }
    sql.push_str(" ORDER BY ts ASC");
    BuiltQuery { sql, bindings }
}

/// Translates the newest-snapshot query for one document.
#[must_use]
pub fn build_latest_snapshot(snapshot_table: &str, doc: Value) -> BuiltQuery {
    let mut bindings = BTreeMap::new();
    bindings.insert("p0".to_owned(), doc);
    BuiltQuery {
        sql: format!("SELECT * FROM {snapshot_table} WHERE doc = $p0 ORDER BY ts DESC LIMIT 1"),
        bindings,
    }
}

#[derive(Default)]
struct BindCtx {
    bindings: BTreeMap<String, Value>,
}

impl BindCtx {
    fn bind(&mut self, value: Value) -> String {
        let name = format!("p{}", self.bindings.len());
        self.bindings.insert(name.clone(), value);
        format!("${name}")
    }
}

fn field_path(field: &str, opts: BuildOptions) -> String {
    if !opts.edge_relation {
        return field.to_owned();
    }
    // Edge tables expose their endpoints as `in`/`out` on the remote.
    let (head, rest) = match field.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (field, None),
    };
    let head = match head {
        "from" => "in",
        "to" => "out",
        other => other,
    };
    match rest {
        Some(rest) => format!("{head}.{rest}"),
        None => head.to_owned(),
    }
}

fn translate_expr(expr: &Expr, opts: BuildOptions, ctx: &mut BindCtx) -> RemoteResult<String> {
    match expr {
        Expr::And(branches) => translate_group(branches, "AND", opts, ctx),
        Expr::Or(branches) => translate_group(branches, "OR", opts, ctx),
        Expr::Not(inner) => Ok(format!("!({})", translate_expr(inner, opts, ctx)?)),
        Expr::Compare { field, op, value } => {
            let rhs = match value {
                Operand::Value(v) => ctx.bind(v.clone()),
                Operand::FieldRef(name) => {
                    return Err(RemoteError::translation(format!(
                        "right-hand side of {field} {} is a reactive reference to {name}",
                        op.symbol()
                    )))
                }
            };
            Ok(format!("{} {} {}", field_path(field, opts), op.symbol(), rhs))
        }
        Expr::Like {
            field,
            pattern,
            case_insensitive,
        } => {
            let rhs = ctx.bind(Value::Str(pattern.clone()));
            if *case_insensitive {
                Ok(format!(
                    "string::lower({}) LIKE string::lower({rhs})",
                    field_path(field, opts)
                ))
            } else {
                Ok(format!("{} LIKE {rhs}", field_path(field, opts)))
            }
        }
        Expr::In { field, values } => {
            if values.is_empty() {
                // Nothing is a member of the empty list.
                return Ok("false".to_owned());
            }
            let rhs = ctx.bind(Value::Array(values.clone()));
            Ok(format!("{} IN {rhs}", field_path(field, opts)))
        }
        Expr::IsNull(field) => Ok(format!("{} IS NULL", field_path(field, opts))),
        Expr::IsNone(field) => Ok(format!("{} IS NONE", field_path(field, opts))),
    }
}

fn translate_group(
    branches: &[Expr],
    joiner: &str,
    opts: BuildOptions,
    ctx: &mut BindCtx,
) -> RemoteResult<String> {
    if branches.is_empty() {
        // An empty conjunction holds, an empty disjunction does not.
        return Ok(if joiner == "AND" { "true" } else { "false" }.to_owned());
    }
    let parts: Vec<String> = branches
        .iter()
        .map(|b| translate_expr(b, opts, ctx))
        .collect::<RemoteResult<_>>()?;
    Ok(format!("({})", parts.join(&format!(" {joiner} "))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{CompareOp, OrderBy};

    #[test]
    fn plain_select() {
        let q = build_select("task", &Subset::all(), BuildOptions::default()).unwrap();
        assert_eq!(q.sql, "SELECT * FROM task");
        assert!(q.bindings.is_empty());
    }

    #[test]
    fn sync_filter_appended() {
        let opts = BuildOptions {
            sync_filtered: true,
            ..Default::default()
        };
        let q = build_select("task", &Subset::all(), opts).unwrap();
        assert_eq!(q.sql, "SELECT * FROM task WHERE sync_deleted = false");
    }

    #[test]
    fn comparison_binds_parameters() {
        let subset = Subset::all().with_filter(Expr::And(vec![
            Expr::eq("status", "open"),
            Expr::cmp("age", CompareOp::Ge, 21i64),
        ]));
        let q = build_select("person", &subset, BuildOptions::default()).unwrap();
        assert_eq!(
            q.sql,
            "SELECT * FROM person WHERE (status = $p0 AND age >= $p1)"
        );
        assert_eq!(q.bindings["p0"], Value::Str("open".into()));
        assert_eq!(q.bindings["p1"], Value::Int(21));
    }

    #[test]
    fn ilike_lowers_both_sides() {
        let subset = Subset::all().with_filter(Expr::Like {
            field: "title".into(),
            pattern: "%secret%".into(),
            case_insensitive: true,
        });
        let q = build_select("note", &subset, BuildOptions::default()).unwrap();
        assert_eq!(
            q.sql,
            "SELECT * FROM note WHERE string::lower(title) LIKE string::lower($p0)"
        );
    }

    #[test]
    fn empty_in_list_is_false() {
        let subset = Subset::all().with_filter(Expr::In {
            field: "status".into(),
            values: vec![],
        });
        let q = build_select("task", &subset, BuildOptions::default()).unwrap();
        assert_eq!(q.sql, "SELECT * FROM task WHERE false");
    }

    #[test]
    fn null_and_none_tests() {
        let subset = Subset::all().with_filter(Expr::Or(vec![
            Expr::IsNull("due".into()),
            Expr::IsNone("due".into()),
        ]));
        let q = build_select("task", &subset, BuildOptions::default()).unwrap();
        assert_eq!(
            q.sql,
            "SELECT * FROM task WHERE (due IS NULL OR due IS NONE)"
        );
    }

    #[test]
    fn not_wraps_inner() {
        let subset = Subset::all().with_filter(Expr::Not(Box::new(Expr::eq("done", true))));
        let q = build_select("task", &subset, BuildOptions::default()).unwrap();
        assert_eq!(q.sql, "SELECT * FROM task WHERE !(done = $p0)");
    }

    #[test]
    fn edge_relation_rewrites_endpoints() {
        let opts = BuildOptions {
            edge_relation: true,
            ..Default::default()
        };
        let subset = Subset::all()
            .with_filter(Expr::And(vec![
                Expr::eq("from.id", "user:1"),
                Expr::eq("to", "task:2"),
            ]))
            .with_order(OrderBy::asc("from.name"));
        let q = build_select("assigned", &subset, opts).unwrap();
        assert_eq!(
            q.sql,
            "SELECT * FROM assigned WHERE (in.id = $p0 AND out = $p1) ORDER BY in.name ASC"
        );
    }

    #[test]
    fn ordering_and_windowing() {
        let subset = Subset::all()
            .with_order(OrderBy::desc("updated_at"))
            .with_order(OrderBy::asc("title"))
            .with_limit(25)
            .with_offset(50);
        let q = build_select("task", &subset, BuildOptions::default()).unwrap();
        assert_eq!(
            q.sql,
            "SELECT * FROM task ORDER BY updated_at DESC, title ASC LIMIT 25 START 50"
        );
    }

    #[test]
    fn reactive_reference_is_fatal_before_query() {
        let subset = Subset::all().with_filter(Expr::Compare {
            field: "owner".into(),
            op: CompareOp::Eq,
            value: Operand::FieldRef("session.user".into()),
        });
        let err = build_select("task", &subset, BuildOptions::default()).unwrap_err();
        assert!(err.is_translation());
    }

    #[test]
    fn log_queries() {
        let q = build_log_replay("crdt_update", Value::Str("doc:abc".into()), None);
        assert_eq!(
            q.sql,
            "SELECT * FROM crdt_update WHERE doc = $p0 ORDER BY ts ASC"
        );
        let q = build_log_replay(
            "crdt_update",
            Value::Str("doc:abc".into()),
            Some(Value::Int(7)),
        );
        assert!(q.sql.contains("AND ts > $p1"));

        let q = build_latest_snapshot("crdt_snapshot", Value::Str("doc:abc".into()));
        assert!(q.sql.ends_with("ORDER BY ts DESC LIMIT 1"));

        assert_eq!(
            build_doc_index("crdt_update").sql,
            "SELECT doc FROM crdt_update GROUP BY doc"
        );
    }
}
