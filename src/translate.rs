//! Matcher and sort translation to Postgres SQL over a `jsonb` column `doc`.
//!
//! Every value taken from a request is passed as a bound text parameter and
//! cast in SQL (`$n::text::jsonpath`, `$n::text::jsonb`, `$n::text::text[]`),
//! so request content never lands in the statement text.

use crate::Document;
use crate::error::{Error, Result};
use crate::matcher::{Direction, clause_list, is_operator_doc};
use serde_json::Value;

/// SQL fragments sharing one parameter list.
#[derive(Debug, Default)]
pub struct SqlParams {
    pub values: Vec<String>,
}

impl SqlParams {
    fn push(&mut self, v: String) -> String {
        self.values.push(v);
        format!("${}", self.values.len())
    }

    pub fn as_refs(&self) -> Vec<&(dyn tokio_postgres::types::ToSql + Sync)> {
        self.values.iter().map(|v| v as &(dyn tokio_postgres::types::ToSql + Sync)).collect()
    }
}

/// Build a WHERE clause for `matcher`. Empty matchers become `TRUE`.
pub fn build_where(matcher: &Document, params: &mut SqlParams) -> Result<String> {
    let mut clauses: Vec<String> = Vec::new();
    for (key, cond) in matcher.iter() {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let subs = clause_list(key, cond)?
                    .into_iter()
                    .map(|m| build_where(m, params).map(|c| format!("({})", c)))
                    .collect::<Result<Vec<_>>>()?;
                let clause = match key.as_str() {
                    "$and" if subs.is_empty() => "TRUE".to_string(),
                    "$and" => format!("({})", subs.join(" AND ")),
                    "$or" if subs.is_empty() => "FALSE".to_string(),
                    "$or" => format!("({})", subs.join(" OR ")),
                    _ if subs.is_empty() => "TRUE".to_string(),
                    _ => format!("NOT ({})", subs.join(" OR ")),
                };
                clauses.push(clause);
            }
            k if k.starts_with('$') => {
                return Err(Error::validation(format!("unsupported matcher operator '{}'", k)));
            }
            field => clauses.push(build_field(field, cond, params)?),
        }
    }
    if clauses.is_empty() {
        Ok(String::from("TRUE"))
    } else {
        Ok(clauses.join(" AND "))
    }
}

fn build_field(field: &str, cond: &Value, params: &mut SqlParams) -> Result<String> {
    match cond {
        Value::Object(ops) if is_operator_doc(ops) => {
            let mut parts = Vec::with_capacity(ops.len());
            for (op, arg) in ops.iter() {
                let part = match op.as_str() {
                    "$eq" => equality(field, arg, params),
                    "$ne" => format!("NOT ({})", equality(field, arg, params)),
                    "$gt" | "$gte" | "$lt" | "$lte" => comparison(field, op, arg, params),
                    "$in" | "$nin" => {
                        let vals = arg.as_array().ok_or_else(|| Error::validation(format!("{} needs an array", op)))?;
                        let any = if vals.is_empty() {
                            "FALSE".to_string()
                        } else {
                            let alts: Vec<String> = vals.iter().map(|v| format!("({})", equality(field, v, params))).collect();
                            format!("({})", alts.join(" OR "))
                        };
                        if op == "$in" { any } else { format!("NOT ({})", any) }
                    }
                    "$exists" => {
                        let p = params.push(jsonpath_path(field));
                        let exists = format!("jsonb_path_exists(doc, {}::text::jsonpath)", p);
                        if matches!(arg, Value::Bool(false)) || arg.as_f64() == Some(0.0) {
                            format!("NOT {}", exists)
                        } else {
                            exists
                        }
                    }
                    other => return Err(Error::validation(format!("unsupported matcher operator '{}'", other))),
                };
                parts.push(part);
            }
            Ok(parts.join(" AND "))
        }
        _ => Ok(equality(field, cond, params)),
    }
}

// Field equals value, or field is an array containing value. Missing fields equal null.
fn equality(field: &str, value: &Value, params: &mut SqlParams) -> String {
    match value {
        Value::Null => {
            let p = params.push(format!("{} ? (@ != null)", jsonpath_path(field)));
            format!("NOT jsonb_path_exists(doc, {}::text::jsonpath)", p)
        }
        Value::Object(_) | Value::Array(_) => {
            let path = params.push(pg_text_array(field));
            let val = params.push(value.to_string());
            format!(
                "((doc #> {p}::text::text[]) = {v}::text::jsonb OR (jsonb_typeof(doc #> {p}::text::text[]) = 'array' AND EXISTS (SELECT 1 FROM jsonb_array_elements(doc #> {p}::text::text[]) e WHERE e = {v}::text::jsonb)))",
                p = path,
                v = val
            )
        }
        scalar => {
            let p = params.push(format!("{} ? (@ == {})", jsonpath_path(field), scalar));
            format!("jsonb_path_exists(doc, {}::text::jsonpath)", p)
        }
    }
}

fn comparison(field: &str, op: &str, value: &Value, params: &mut SqlParams) -> String {
    let op_sql = match op {
        "$gt" => ">",
        "$gte" => ">=",
        "$lt" => "<",
        _ => "<=",
    };
    match value {
        Value::Number(_) | Value::String(_) | Value::Bool(_) => {
            let p = params.push(format!("{} ? (@ {} {})", jsonpath_path(field), op_sql, value));
            format!("jsonb_path_exists(doc, {}::text::jsonpath)", p)
        }
        // jsonpath cannot order containers
        _ => "FALSE".to_string(),
    }
}

/// ORDER BY clause ranking types the document-database way, then by value,
/// with the primary key as final tie-breaker.
pub fn build_order_by(sort: &[(String, Direction)], params: &mut SqlParams) -> String {
    let mut parts: Vec<String> = Vec::new();
    for (field, dir) in sort {
        let ord = if *dir == Direction::Descending { "DESC" } else { "ASC" };
        let p = params.push(pg_text_array(field));
        let expr = format!("(doc #> {}::text::text[])", p);
        parts.push(format!(
            "(CASE jsonb_typeof({e}) WHEN 'number' THEN 2 WHEN 'string' THEN 3 WHEN 'object' THEN 4 WHEN 'array' THEN 5 WHEN 'boolean' THEN 8 ELSE 1 END) {o}",
            e = expr,
            o = ord
        ));
        parts.push(format!("{} {}", expr, ord));
    }
    parts.push("id ASC".to_string());
    format!("ORDER BY {}", parts.join(", "))
}

/// `a.b.0` → `$."a"."b"[0]`
pub fn jsonpath_path(key: &str) -> String {
    let mut out = String::from("$");
    for seg in key.split('.') {
        if !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_digit()) {
            out.push('[');
            out.push_str(seg);
            out.push(']');
        } else {
            out.push('.');
            out.push_str(&Value::String(seg.to_string()).to_string());
        }
    }
    out
}

/// `a.b` → `{"a","b"}` (a Postgres text[] literal)
pub fn pg_text_array(key: &str) -> String {
    let elems: Vec<String> = key
        .split('.')
        .map(|seg| format!("\"{}\"", seg.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("{{{}}}", elems.join(","))
}

pub fn q_ident(ident: &str) -> String {
    let escaped = ident.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn empty_matcher_is_true() {
        let mut params = SqlParams::default();
        assert_eq!(build_where(&Document::new(), &mut params).unwrap(), "TRUE");
        assert!(params.values.is_empty());
    }

    #[test]
    fn scalar_equality_binds_jsonpath() {
        let mut params = SqlParams::default();
        let sql = build_where(&doc(json!({"name": "tim", "age": 40})), &mut params).unwrap();
        assert_eq!(
            sql,
            "jsonb_path_exists(doc, $1::text::jsonpath) AND jsonb_path_exists(doc, $2::text::jsonpath)"
        );
        assert_eq!(params.values, vec![r#"$."name" ? (@ == "tim")"#, r#"$."age" ? (@ == 40)"#]);
    }

    #[test]
    fn operators_and_logical_clauses() {
        let mut params = SqlParams::default();
        let m = doc(json!({"$or": [{"age": {"$gte": 18}}, {"tags": {"$in": []}}], "x": {"$exists": false}}));
        let sql = build_where(&m, &mut params).unwrap();
        assert!(sql.starts_with("((jsonb_path_exists(doc, $1::text::jsonpath)) OR (FALSE)) AND "));
        assert!(sql.ends_with("NOT jsonb_path_exists(doc, $2::text::jsonpath)"));
        assert_eq!(params.values[0], r#"$."age" ? (@ >= 18)"#);
        assert_eq!(params.values[1], r#"$."x""#);
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let mut params = SqlParams::default();
        assert!(build_where(&doc(json!({"a": {"$where": 1}})), &mut params).is_err());
    }

    #[test]
    fn paths_are_quoted() {
        assert_eq!(jsonpath_path(r#"a.b"c.0"#), r#"$."a"."b\"c"[0]"#);
        assert_eq!(pg_text_array(r#"a.b"c"#), r#"{"a","b\"c"}"#);
        assert_eq!(q_ident(r#"we"ird"#), r#""we""ird""#);
    }

    #[test]
    fn order_by_ends_with_primary_key() {
        let mut params = SqlParams::default();
        let sql = build_order_by(&[("age".to_string(), Direction::Descending)], &mut params);
        assert!(sql.starts_with("ORDER BY (CASE jsonb_typeof((doc #> $1::text::text[]))"));
        assert!(sql.contains("(doc #> $1::text::text[]) DESC"));
        assert!(sql.ends_with("id ASC"));
        assert_eq!(params.values, vec![r#"{"age"}"#]);
    }
}
