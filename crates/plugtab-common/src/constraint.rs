//! Query constraints pushed down to plugins, and their local re-application.
//!
//! Pushdown is advisory: a plugin may ignore or only partially honor the
//! constraint list, so the host re-applies every predicate to the rows it
//! receives. Re-filtering is data hygiene, not a failure path; a predicate
//! that cannot be evaluated keeps the row.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Predicate operators a plugin can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintOp {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
    Ne,
    /// UNIX-style pattern with `*` and `?`.
    Match,
    /// SQL LIKE pattern with `%` and `_`; rewritten to [`Glob`](Self::Glob)
    /// before it reaches a plugin.
    Like,
    /// Same syntax as [`Match`](Self::Match), case-sensitive.
    Glob,
    Regexp,
}

/// One WHERE predicate on a single column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnConstraint {
    pub column: usize,
    pub op: ConstraintOp,
    /// `Null` encodes an explicit null test (`IS NULL` arrives as
    /// `Eq` + `Null`, `IS NOT NULL` as `Ne` + `Null`).
    pub value: Value,
}

/// One ORDER BY term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConstraint {
    pub column: usize,
    pub descending: bool,
}

/// Everything the planner could tell us about one scan. Constructed fresh
/// for each Filter invocation; advisory only.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryConstraint {
    #[serde(default)]
    pub columns: Vec<ColumnConstraint>,
    #[serde(default)]
    pub order_by: Vec<OrderConstraint>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
}

impl QueryConstraint {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
            && self.order_by.is_empty()
            && self.limit.is_none()
            && self.offset.is_none()
    }

    /// Find the pushed-down equality value for a column, if any. Parameter
    /// columns read their value from here since plugins never return them.
    pub fn value_for(&self, column: usize) -> Option<&Value> {
        self.columns
            .iter()
            .find(|c| c.column == column && c.op == ConstraintOp::Eq)
            .map(|c| &c.value)
    }

    /// Re-apply every predicate to a row the plugin returned.
    ///
    /// `column_value` resolves a schema column index to the row's value;
    /// `None` stands for a position the plugin did not produce (read as
    /// NULL). Returns whether the row survives the WHERE clause.
    pub fn row_matches<'a, F>(&self, column_value: F) -> bool
    where
        F: Fn(usize) -> Option<&'a Value>,
    {
        self.columns
            .iter()
            .all(|c| c.matches(column_value(c.column).unwrap_or(&Value::Null)))
    }
}

impl ColumnConstraint {
    /// Evaluate this predicate against a single value.
    pub fn matches(&self, actual: &Value) -> bool {
        use ConstraintOp::*;

        // Explicit null tests are the only predicates a NULL can satisfy.
        if self.value.is_null() {
            return match self.op {
                Eq => actual.is_null(),
                Ne => !actual.is_null(),
                _ => true, // not evaluatable, keep the row
            };
        }
        if actual.is_null() {
            return match self.op {
                Ne => true,
                _ => false,
            };
        }

        match self.op {
            Eq => compare(actual, &self.value) == Some(Ordering::Equal),
            Ne => compare(actual, &self.value) != Some(Ordering::Equal),
            Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            Ge => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Lt => compare(actual, &self.value) == Some(Ordering::Less),
            Le => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Match | Glob => match (as_text(actual), as_text(&self.value)) {
                (Some(s), Some(pattern)) => glob_match(&pattern, &s),
                _ => true,
            },
            Like => match (as_text(actual), as_text(&self.value)) {
                (Some(s), Some(pattern)) => {
                    glob_match(&like_to_glob(&pattern).to_lowercase(), &s.to_lowercase())
                }
                _ => true,
            },
            Regexp => match (as_text(actual), as_text(&self.value)) {
                (Some(s), Some(pattern)) => match regex::Regex::new(&pattern) {
                    Ok(re) => re.is_match(&s),
                    Err(_) => true, // malformed pattern, keep the row
                },
                _ => true,
            },
        }
    }
}

/// Convert a SQL LIKE pattern to the UNIX glob syntax plugins understand
/// (`%` to `*`, `_` to `?`).
pub fn like_to_glob(pattern: &str) -> String {
    pattern.replace('%', "*").replace('_', "?")
}

/// Order two values, numerically when both are numeric, lexically for
/// strings, bytewise for blobs. `None` when the types cannot be ordered.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Int(y)) => Some((*x as i64).cmp(y)),
        (Value::Int(x), Value::Bool(y)) => Some(x.cmp(&(*y as i64))),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::DateTime(x), Value::DateTime(y)) => Some(x.cmp(y)),
        (Value::Blob(x), Value::Blob(y)) => Some(x.cmp(y)),
        // A string operand against a number: try the numeric reading, the
        // planner does not tell us which side was the literal.
        (Value::String(s), Value::Int(_) | Value::Float(_)) => {
            s.trim().parse::<f64>().ok().and_then(|f| compare(&Value::Float(f), b))
        }
        (Value::Int(_) | Value::Float(_), Value::String(s)) => {
            s.trim().parse::<f64>().ok().and_then(|f| compare(a, &Value::Float(f)))
        }
        _ => None,
    }
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        _ => None,
    }
}

/// Match a glob pattern supporting `*` and `?` against a string.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    // Iterative matcher with backtracking on the last `*`.
    let (mut pi, mut ti) = (0usize, 0usize);
    let (mut star, mut star_ti) = (None::<usize>, 0usize);
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            star_ti = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cst(column: usize, op: ConstraintOp, value: Value) -> ColumnConstraint {
        ColumnConstraint { column, op, value }
    }

    #[test]
    fn equality_compares_across_numeric_widths() {
        assert!(cst(0, ConstraintOp::Eq, Value::Int(2)).matches(&Value::Float(2.0)));
        assert!(cst(0, ConstraintOp::Eq, Value::Int(2)).matches(&Value::String("2".into())));
        assert!(!cst(0, ConstraintOp::Eq, Value::Int(2)).matches(&Value::Int(3)));
    }

    #[test]
    fn null_tests() {
        let is_null = cst(0, ConstraintOp::Eq, Value::Null);
        assert!(is_null.matches(&Value::Null));
        assert!(!is_null.matches(&Value::Int(1)));

        let is_not_null = cst(0, ConstraintOp::Ne, Value::Null);
        assert!(!is_not_null.matches(&Value::Null));
        assert!(is_not_null.matches(&Value::Int(1)));

        // A NULL never satisfies an ordering predicate.
        assert!(!cst(0, ConstraintOp::Gt, Value::Int(0)).matches(&Value::Null));
    }

    #[test]
    fn like_is_case_insensitive_glob_is_not() {
        let like = cst(0, ConstraintOp::Like, Value::String("al%".into()));
        assert!(like.matches(&Value::String("Alice".into())));

        let glob = cst(0, ConstraintOp::Glob, Value::String("al*".into()));
        assert!(!glob.matches(&Value::String("Alice".into())));
        assert!(glob.matches(&Value::String("alice".into())));
    }

    #[test]
    fn glob_matcher_backtracks() {
        assert!(glob_match("a*c*e", "alice"));
        assert!(glob_match("*", ""));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(!glob_match("a*d", "alice"));
    }

    #[test]
    fn regexp_keeps_row_on_bad_pattern() {
        let bad = cst(0, ConstraintOp::Regexp, Value::String("(unclosed".into()));
        assert!(bad.matches(&Value::String("anything".into())));

        let good = cst(0, ConstraintOp::Regexp, Value::String("^a.c$".into()));
        assert!(good.matches(&Value::String("abc".into())));
        assert!(!good.matches(&Value::String("xbc".into())));
    }

    #[test]
    fn row_matches_reads_missing_columns_as_null() {
        let constraint = QueryConstraint {
            columns: vec![
                cst(0, ConstraintOp::Eq, Value::Int(1)),
                cst(5, ConstraintOp::Ne, Value::Null), // column 5 absent
            ],
            ..Default::default()
        };
        let row = [Value::Int(1)];
        assert!(!constraint.row_matches(|i| row.get(i)));

        let only_first = QueryConstraint {
            columns: vec![cst(0, ConstraintOp::Eq, Value::Int(1))],
            ..Default::default()
        };
        assert!(only_first.row_matches(|i| row.get(i)));
    }

    #[test]
    fn like_to_glob_rewrites_wildcards() {
        assert_eq!(like_to_glob("%ab_c%"), "*ab?c*");
    }
}
