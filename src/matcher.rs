//! In-process evaluation of matchers, sort specifications and projections
//! over JSON documents.

use crate::Document;
use crate::error::{Error, Result};
use serde_json::Value;
use std::cmp::Ordering;

const FIELD_OPERATORS: &[&str] = &["$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$exists"];

/// Reject matchers using operators we cannot evaluate, so both backends agree
/// on what is an error.
pub fn validate_matcher(matcher: &Document) -> Result<()> {
    for (key, cond) in matcher.iter() {
        if key.starts_with('$') {
            match key.as_str() {
                "$and" | "$or" | "$nor" => {
                    for clause in clause_list(key, cond)? {
                        validate_matcher(clause)?;
                    }
                }
                other => return Err(Error::validation(format!("unsupported matcher operator '{}'", other))),
            }
        } else if let Value::Object(ops) = cond {
            if is_operator_doc(ops) {
                for (op, arg) in ops.iter() {
                    if !FIELD_OPERATORS.contains(&op.as_str()) {
                        return Err(Error::validation(format!("unsupported matcher operator '{}'", op)));
                    }
                    if matches!(op.as_str(), "$in" | "$nin") && !arg.is_array() {
                        return Err(Error::validation(format!("{} needs an array", op)));
                    }
                }
            }
        }
    }
    Ok(())
}

pub(crate) fn clause_list<'a>(op: &str, cond: &'a Value) -> Result<Vec<&'a Document>> {
    let arr = cond
        .as_array()
        .ok_or_else(|| Error::validation(format!("{} needs an array of matchers", op)))?;
    arr.iter()
        .map(|c| {
            c.as_object()
                .ok_or_else(|| Error::validation(format!("{} needs an array of matchers", op)))
        })
        .collect()
}

pub(crate) fn is_operator_doc(d: &Document) -> bool {
    d.keys().next().map(|k| k.starts_with('$')).unwrap_or(false)
}

/// Does `doc` satisfy `matcher`? An empty matcher selects everything.
pub fn matches(doc: &Document, matcher: &Document) -> bool {
    matcher.iter().all(|(key, cond)| match key.as_str() {
        "$and" => sub_matchers(cond).all(|m| matches(doc, m)),
        "$or" => sub_matchers(cond).any(|m| matches(doc, m)),
        "$nor" => !sub_matchers(cond).any(|m| matches(doc, m)),
        _ => field_matches(&resolve(doc, key), cond),
    })
}

fn sub_matchers(cond: &Value) -> impl Iterator<Item = &Document> {
    cond.as_array().into_iter().flatten().filter_map(Value::as_object)
}

fn field_matches(candidates: &[&Value], cond: &Value) -> bool {
    match cond {
        Value::Object(ops) if is_operator_doc(ops) => ops.iter().all(|(op, arg)| operator_matches(candidates, op, arg)),
        _ => equals_any(candidates, cond),
    }
}

fn operator_matches(candidates: &[&Value], op: &str, arg: &Value) -> bool {
    match op {
        "$eq" => equals_any(candidates, arg),
        "$ne" => !equals_any(candidates, arg),
        "$gt" => compare_any(candidates, arg, |o| o == Ordering::Greater),
        "$gte" => compare_any(candidates, arg, |o| o != Ordering::Less),
        "$lt" => compare_any(candidates, arg, |o| o == Ordering::Less),
        "$lte" => compare_any(candidates, arg, |o| o != Ordering::Greater),
        "$in" => arg.as_array().map(|vals| vals.iter().any(|v| equals_any(candidates, v))).unwrap_or(false),
        "$nin" => !arg.as_array().map(|vals| vals.iter().any(|v| equals_any(candidates, v))).unwrap_or(false),
        "$exists" => truthy(arg) != candidates.is_empty(),
        _ => false,
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::Null => false,
        _ => true,
    }
}

// A field equals a value if it is equal, or if it is an array holding an equal element.
fn equals_any(candidates: &[&Value], target: &Value) -> bool {
    if target.is_null() && candidates.is_empty() {
        return true;
    }
    candidates.iter().any(|c| {
        values_equal(c, target)
            || matches!(c, Value::Array(arr) if arr.iter().any(|e| values_equal(e, target)))
    })
}

fn compare_any(candidates: &[&Value], target: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let check = |v: &Value| type_rank(Some(v)) == type_rank(Some(target)) && accept(value_cmp(v, target));
    candidates.iter().any(|&c| match c {
        Value::Array(arr) if !target.is_array() => arr.iter().any(check),
        other => check(other),
    })
}

/// Collect the values reachable through a dotted path. Arrays of documents
/// are traversed element-wise; numeric segments index arrays.
pub fn resolve<'a>(doc: &'a Document, path: &str) -> Vec<&'a Value> {
    let mut segs = path.split('.');
    let mut current: Vec<&Value> = match segs.next().and_then(|first| doc.get(first)) {
        Some(v) => vec![v],
        None => return Vec::new(),
    };
    for seg in segs {
        let mut next = Vec::new();
        for v in current {
            match v {
                Value::Object(m) => next.extend(m.get(seg)),
                Value::Array(arr) => match seg.parse::<usize>() {
                    Ok(idx) => next.extend(arr.get(idx)),
                    Err(_) => next.extend(arr.iter().filter_map(|e| e.as_object()?.get(seg))),
                },
                _ => {}
            }
        }
        current = next;
    }
    current
}

/// Structural equality where numbers compare by value (`40 == 40.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => x.len() == y.len() && x.iter().zip(y).all(|(p, q)| values_equal(p, q)),
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|((ka, va), (kb, vb))| ka == kb && values_equal(va, vb))
        }
        _ => a == b,
    }
}

// Missing and null < numbers < strings < objects < arrays < booleans
fn type_rank(v: Option<&Value>) -> u8 {
    match v {
        None | Some(Value::Null) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Object(_)) => 4,
        Some(Value::Array(_)) => 5,
        Some(Value::Bool(_)) => 8,
    }
}

/// Total order over JSON values following the document-database convention.
pub fn value_cmp(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(Some(a)), type_rank(Some(b)));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (p, q) in x.iter().zip(y) {
                let o = value_cmp(p, q);
                if o != Ordering::Equal {
                    return o;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((ka, va), (kb, vb)) in x.iter().zip(y.iter()) {
                let o = ka.cmp(kb).then_with(|| value_cmp(va, vb));
                if o != Ordering::Equal {
                    return o;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Parse a sort mapping (`{field: 1 | -1}`), keeping key order.
pub fn parse_sort(spec: &Document) -> Result<Vec<(String, Direction)>> {
    spec.iter()
        .map(|(field, dir)| {
            let dir = match dir.as_f64() {
                Some(n) if n == 1.0 => Direction::Ascending,
                Some(n) if n == -1.0 => Direction::Descending,
                _ => return Err(Error::validation(format!("sort direction for '{}' must be 1 or -1", field))),
            };
            Ok((field.clone(), dir))
        })
        .collect()
}

/// Stable multi-key sort.
pub fn sort_documents(docs: &mut [Document], keys: &[(String, Direction)]) {
    docs.sort_by(|a, b| {
        for (field, dir) in keys {
            let av = get_path(a, field).unwrap_or(&Value::Null);
            let bv = get_path(b, field).unwrap_or(&Value::Null);
            let o = value_cmp(av, bv);
            if o != Ordering::Equal {
                return if *dir == Direction::Ascending { o } else { o.reverse() };
            }
        }
        Ordering::Equal
    });
}

/// Follow a dotted path through nested documents only.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segs = path.split('.');
    let mut cur = doc.get(segs.next()?)?;
    for seg in segs {
        cur = match cur {
            Value::Object(m) => m.get(seg)?,
            Value::Array(arr) => arr.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc.entry(head.to_string()).or_insert_with(|| Value::Object(Document::new()));
            if !entry.is_object() {
                *entry = Value::Object(Document::new());
            }
            if let Value::Object(child) = entry {
                set_path(child, rest, value);
            }
        }
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.shift_remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = doc.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Include,
    Exclude,
}

/// A parsed `keys` mapping.
#[derive(Debug, Clone)]
pub struct Projection {
    mode: Mode,
    fields: Vec<String>,
    include_id: bool,
}

impl Projection {
    /// `None` when the mapping is empty (return whole documents).
    pub fn parse(keys: &Document) -> Result<Option<Self>> {
        if keys.is_empty() {
            return Ok(None);
        }
        let mut mode: Option<Mode> = None;
        let mut fields = Vec::new();
        let mut include_id = true;
        for (k, v) in keys.iter() {
            let on = match v {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64() != Some(0.0),
                _ => return Err(Error::validation(format!("projection value for '{}' must be 0, 1 or a boolean", k))),
            };
            if k == "_id" {
                include_id = on;
                continue;
            }
            let m = if on { Mode::Include } else { Mode::Exclude };
            match &mode {
                Some(existing) if *existing != m => {
                    return Err(Error::validation("projection cannot mix inclusion and exclusion"));
                }
                _ => mode = Some(m),
            }
            fields.push(k.clone());
        }
        Ok(Some(Self { mode: mode.unwrap_or(Mode::Exclude), fields, include_id }))
    }

    pub fn apply(&self, doc: &Document) -> Document {
        match self.mode {
            Mode::Include => {
                let mut out = Document::new();
                if self.include_id {
                    if let Some(id) = doc.get("_id") {
                        out.insert("_id".to_string(), id.clone());
                    }
                }
                for f in &self.fields {
                    if let Some(v) = get_path(doc, f) {
                        set_path(&mut out, f, v.clone());
                    }
                }
                out
            }
            Mode::Exclude => {
                let mut out = doc.clone();
                for f in &self.fields {
                    remove_path(&mut out, f);
                }
                if !self.include_id {
                    out.shift_remove("_id");
                }
                out
            }
        }
    }
}
