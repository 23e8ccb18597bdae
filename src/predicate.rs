//! Predicate tree — the tagged variant queries are expressed in.
//!
//! Leaves compare one column against byte-string values; `AND`/`OR` carry
//! two or more children.  Comparison is numeric when both sides parse as
//! finite decimals, byte-wise otherwise.  `LIKE` is SQL-style `%`/`_`
//! matching, byte-wise and case-sensitive.  `IS NULL` is true for an empty
//! or absent column value.
//!
//! The wire form is a JSON object tagged by `op`:
//!
//! ```json
//! {"op": "and", "children": [
//!   {"op": "=",  "column": "STATUS", "value": "active"},
//!   {"op": ">",  "column": "SCORE",  "value": "70"}
//! ]}
//! ```

use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Lt => "<",
            CmpOp::Ge => ">=",
            CmpOp::Le => "<=",
        }
    }

    pub fn from_symbol(s: &str) -> Option<Self> {
        match s {
            "=" => Some(CmpOp::Eq),
            "!=" => Some(CmpOp::Ne),
            ">" => Some(CmpOp::Gt),
            "<" => Some(CmpOp::Lt),
            ">=" => Some(CmpOp::Ge),
            "<=" => Some(CmpOp::Le),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Cmp { op: CmpOp, column: String, value: String },
    In { column: String, values: Vec<String> },
    Like { column: String, pattern: String },
    IsNull { column: String },
}

impl Predicate {
    // ── Wire form ────────────────────────────────────────────────────────────

    pub fn from_json(v: &Value) -> Result<Self> {
        let obj = v
            .as_object()
            .ok_or_else(|| Error::Protocol("predicate must be an object".into()))?;
        let op = obj
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("predicate is missing \"op\"".into()))?;

        let column = || -> Result<String> {
            obj.get("column")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| Error::Protocol(format!("op \"{op}\" needs a \"column\"")))
        };
        let scalar = |field: &str| -> Result<String> {
            match obj.get(field) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(Value::Number(n)) => Ok(n.to_string()),
                _ => Err(Error::Protocol(format!("op \"{op}\" needs a \"{field}\""))),
            }
        };

        match op {
            "and" | "or" => {
                let children = obj
                    .get("children")
                    .and_then(Value::as_array)
                    .ok_or_else(|| Error::Protocol(format!("op \"{op}\" needs \"children\"")))?;
                if children.len() < 2 {
                    return Err(Error::Protocol(format!(
                        "op \"{op}\" needs at least two children"
                    )));
                }
                let parsed: Vec<Predicate> =
                    children.iter().map(Predicate::from_json).collect::<Result<_>>()?;
                Ok(if op == "and" { Predicate::And(parsed) } else { Predicate::Or(parsed) })
            }
            "in" => {
                let values = obj
                    .get("values")
                    .and_then(Value::as_array)
                    .ok_or_else(|| Error::Protocol("op \"in\" needs \"values\"".into()))?
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => Ok(s.clone()),
                        Value::Number(n) => Ok(n.to_string()),
                        _ => Err(Error::Protocol("\"in\" values must be strings or numbers".into())),
                    })
                    .collect::<Result<_>>()?;
                Ok(Predicate::In { column: column()?, values })
            }
            "like" => Ok(Predicate::Like { column: column()?, pattern: scalar("pattern")? }),
            "isnull" => Ok(Predicate::IsNull { column: column()? }),
            other => match CmpOp::from_symbol(other) {
                Some(cmp) => Ok(Predicate::Cmp { op: cmp, column: column()?, value: scalar("value")? }),
                None => Err(Error::Protocol(format!("unknown op \"{other}\""))),
            },
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Predicate::And(children) => json!({
                "op": "and",
                "children": children.iter().map(Predicate::to_json).collect::<Vec<_>>(),
            }),
            Predicate::Or(children) => json!({
                "op": "or",
                "children": children.iter().map(Predicate::to_json).collect::<Vec<_>>(),
            }),
            Predicate::Cmp { op, column, value } => {
                json!({"op": op.symbol(), "column": column, "value": value})
            }
            Predicate::In { column, values } => json!({"op": "in", "column": column, "values": values}),
            Predicate::Like { column, pattern } => {
                json!({"op": "like", "column": column, "pattern": pattern})
            }
            Predicate::IsNull { column } => json!({"op": "isnull", "column": column}),
        }
    }

    /// Every column the predicate references.
    pub fn columns(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Predicate::And(children) | Predicate::Or(children) => {
                for c in children {
                    c.collect_columns(out);
                }
            }
            Predicate::Cmp { column, .. }
            | Predicate::In { column, .. }
            | Predicate::Like { column, .. }
            | Predicate::IsNull { column } => {
                out.insert(column);
            }
        }
    }

    // ── Evaluation ───────────────────────────────────────────────────────────

    /// Evaluate against one row.  An absent column reads as empty bytes.
    pub fn evaluate(&self, row: &Row<'_>) -> bool {
        match self {
            Predicate::And(children) => children.iter().all(|c| c.evaluate(row)),
            Predicate::Or(children) => children.iter().any(|c| c.evaluate(row)),
            Predicate::Cmp { op, column, value } => {
                let actual = row.field(column).unwrap_or(b"");
                let ord = compare_values(actual, value.as_bytes());
                match op {
                    CmpOp::Eq => ord == Ordering::Equal,
                    CmpOp::Ne => ord != Ordering::Equal,
                    CmpOp::Gt => ord == Ordering::Greater,
                    CmpOp::Lt => ord == Ordering::Less,
                    CmpOp::Ge => ord != Ordering::Less,
                    CmpOp::Le => ord != Ordering::Greater,
                }
            }
            Predicate::In { column, values } => {
                let actual = row.field(column).unwrap_or(b"");
                values
                    .iter()
                    .any(|v| compare_values(actual, v.as_bytes()) == Ordering::Equal)
            }
            Predicate::Like { column, pattern } => {
                like_match(pattern.as_bytes(), row.field(column).unwrap_or(b""))
            }
            Predicate::IsNull { column } => row.field(column).unwrap_or(b"").is_empty(),
        }
    }
}

/// A parsed row: the shared header plus this record's field slices.
pub struct Row<'a> {
    pub header: &'a [String],
    pub fields: Vec<&'a [u8]>,
}

impl<'a> Row<'a> {
    pub fn field(&self, column: &str) -> Option<&'a [u8]> {
        let idx = self.header.iter().position(|h| h == column)?;
        self.fields.get(idx).copied()
    }
}

// ── Value comparison ─────────────────────────────────────────────────────────

/// Numeric when both sides parse as finite decimals, byte-wise otherwise.
pub fn compare_values(a: &[u8], b: &[u8]) -> Ordering {
    if let (Some(x), Some(y)) = (parse_decimal(a), parse_decimal(b)) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    a.cmp(b)
}

fn parse_decimal(v: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(v).ok()?.trim();
    if s.is_empty() {
        return None;
    }
    let f: f64 = s.parse().ok()?;
    f.is_finite().then_some(f)
}

// ── LIKE matching ────────────────────────────────────────────────────────────

/// SQL `LIKE` over bytes: `%` matches any run, `_` matches one byte.
pub fn like_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] != b'%' && (pattern[p] == b'_' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'%' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            // Backtrack: let the last `%` swallow one more byte.
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'%' {
        p += 1;
    }
    p == pattern.len()
}

/// The literal bytes before the first wildcard; empty means the pattern
/// cannot narrow an index scan.
pub fn like_prefix(pattern: &[u8]) -> &[u8] {
    let end = pattern
        .iter()
        .position(|&b| b == b'%' || b == b'_')
        .unwrap_or(pattern.len());
    &pattern[..end]
}
