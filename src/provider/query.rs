//! Document matching, ordering and shaping for the in-memory provider.
//!
//! Covers the subset of the query language shell tests rely on: equality
//! and comparison filters on (dotted) fields, `$and`/`$or`, multi-key
//! sorts, inclusion/exclusion projections, a handful of pipeline stages,
//! and `$set`/`$unset`/`$inc` updates.

use std::cmp::Ordering;

use serde_json::{json, Map, Value};

use crate::error::{ShellError, ShellResult};

/// Rank of a value's type in the server's cross-type ordering.
fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Object(_) => 4,
        Value::Array(_) => 5,
        Value::Bool(_) => 8,
    }
}

/// Total order over values: by type rank, then by value.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Ordering::Equal
}

/// Value at a dotted path, if present.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |cur, key| match cur {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn is_operator_doc(v: &Value) -> bool {
    v.as_object()
        .map_or(false, |m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
}

fn field_matches_value(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(actual) => values_equal(actual, expected),
        None => expected.is_null(),
    }
}

fn compare_op(field: Option<&Value>, operand: &Value, accept: fn(Ordering) -> bool) -> bool {
    match field {
        Some(actual) if type_rank(actual) == type_rank(operand) => {
            accept(compare_values(actual, operand))
        }
        _ => false,
    }
}

fn field_matches(field: Option<&Value>, cond: &Value) -> ShellResult<bool> {
    if !is_operator_doc(cond) {
        return Ok(field_matches_value(field, cond));
    }
    let ops = cond.as_object().map(|m| m.iter()).into_iter().flatten();
    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => field_matches_value(field, operand),
            "$ne" => !field_matches_value(field, operand),
            "$gt" => compare_op(field, operand, |o| o == Ordering::Greater),
            "$gte" => compare_op(field, operand, |o| o != Ordering::Less),
            "$lt" => compare_op(field, operand, |o| o == Ordering::Less),
            "$lte" => compare_op(field, operand, |o| o != Ordering::Greater),
            "$in" | "$nin" => {
                let Some(options) = operand.as_array() else {
                    return Err(ShellError::resource_with_code("2", format!("{op} needs an array")));
                };
                let found = options.iter().any(|o| field_matches_value(field, o));
                if op == "$in" {
                    found
                } else {
                    !found
                }
            }
            "$exists" => field.is_some() == operand.as_bool().unwrap_or(true),
            other => {
                return Err(ShellError::resource_with_code(
                    "2",
                    format!("unknown operator: {other}"),
                ))
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Whether `doc` satisfies `filter`. A null or empty filter matches everything.
pub fn matches(doc: &Value, filter: &Value) -> ShellResult<bool> {
    let clauses = match filter {
        Value::Null => return Ok(true),
        Value::Object(map) => map,
        other => {
            return Err(ShellError::resource_with_code(
                "2",
                format!("filter must be a document, got {other}"),
            ))
        }
    };
    for (key, cond) in clauses {
        let ok = match key.as_str() {
            "$and" | "$or" => {
                let Some(list) = cond.as_array() else {
                    return Err(ShellError::resource_with_code("2", format!("{key} needs an array")));
                };
                let mut results = Vec::with_capacity(list.len());
                for sub in list {
                    results.push(matches(doc, sub)?);
                }
                if key == "$and" {
                    results.iter().all(|r| *r)
                } else {
                    results.iter().any(|r| *r)
                }
            }
            _ => field_matches(lookup(doc, key), cond)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Stable sort by a `{field: 1 | -1}` specification, keys in order.
pub fn sort_documents(docs: &mut [Value], spec: &Value) -> ShellResult<()> {
    let Some(keys) = spec.as_object() else {
        return Err(ShellError::resource_with_code("2", "sort must be a document"));
    };
    let mut order = Vec::with_capacity(keys.len());
    for (field, dir) in keys {
        let descending = match dir.as_i64() {
            Some(1) => false,
            Some(-1) => true,
            _ => {
                return Err(ShellError::resource_with_code(
                    "15975",
                    format!("$sort key ordering must be 1 or -1, got {dir}"),
                ))
            }
        };
        order.push((field.clone(), descending));
    }
    docs.sort_by(|a, b| {
        for (field, descending) in &order {
            let null = Value::Null;
            let l = lookup(a, field).unwrap_or(&null);
            let r = lookup(b, field).unwrap_or(&null);
            let ord = compare_values(l, r);
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

/// Apply an inclusion or exclusion projection on top-level fields.
pub fn project(doc: &Value, spec: &Value) -> ShellResult<Value> {
    let (Some(fields), Some(source)) = (spec.as_object(), doc.as_object()) else {
        return Ok(doc.clone());
    };
    if fields.is_empty() {
        return Ok(doc.clone());
    }
    let truthy = |v: &Value| v.as_bool().unwrap_or_else(|| v.as_f64().map_or(true, |n| n != 0.0));
    let inclusion: Vec<bool> = fields
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .map(|(_, v)| truthy(v))
        .collect();
    if inclusion.iter().any(|i| *i) && inclusion.iter().any(|i| !*i) {
        return Err(ShellError::resource_with_code(
            "31254",
            "Cannot do exclusion on a field in inclusion projection",
        ));
    }
    let include_mode = inclusion.first().copied().unwrap_or(false);
    let keep_id = fields.get("_id").map_or(true, truthy);

    let mut out = Map::new();
    for (key, value) in source {
        let keep = if key == "_id" {
            keep_id
        } else if include_mode {
            fields.get(key).map_or(false, truthy)
        } else {
            fields.get(key).map_or(true, truthy)
        };
        if keep {
            out.insert(key.clone(), value.clone());
        }
    }
    Ok(Value::Object(out))
}

/// Run an aggregation pipeline over `docs`.
pub fn run_pipeline(mut docs: Vec<Value>, pipeline: &[Value]) -> ShellResult<Vec<Value>> {
    for stage in pipeline {
        let Some((name, arg)) = stage
            .as_object()
            .filter(|m| m.len() == 1)
            .and_then(|m| m.iter().next())
        else {
            return Err(ShellError::resource_with_code(
                "40323",
                "A pipeline stage specification object must contain exactly one field.",
            ));
        };
        docs = match name.as_str() {
            "$documents" => arg.as_array().cloned().unwrap_or_default(),
            "$match" => {
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches(&doc, arg)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$sort" => {
                sort_documents(&mut docs, arg)?;
                docs
            }
            "$skip" => {
                let n = arg.as_u64().unwrap_or(0) as usize;
                docs.into_iter().skip(n).collect()
            }
            "$limit" => {
                let n = arg.as_u64().unwrap_or(0) as usize;
                docs.into_iter().take(n).collect()
            }
            "$project" => docs
                .iter()
                .map(|d| project(d, arg))
                .collect::<ShellResult<Vec<_>>>()?,
            "$set" | "$addFields" => {
                let fields = arg.as_object().cloned().unwrap_or_default();
                docs.into_iter()
                    .map(|mut d| {
                        if let Some(map) = d.as_object_mut() {
                            for (k, v) in &fields {
                                map.insert(k.clone(), v.clone());
                            }
                        }
                        d
                    })
                    .collect()
            }
            "$count" => {
                let mut out = Map::new();
                out.insert(arg.as_str().unwrap_or("count").to_string(), json!(docs.len()));
                vec![Value::Object(out)]
            }
            other => {
                return Err(ShellError::resource_with_code(
                    "40324",
                    format!("Unrecognized pipeline stage name: '{other}'"),
                ))
            }
        };
    }
    Ok(docs)
}

/// Apply an update document. Without `$` operators it is a replacement that
/// keeps the original `_id`.
pub fn apply_update(doc: &mut Value, update: &Value) -> ShellResult<()> {
    let Some(spec) = update.as_object() else {
        return Err(ShellError::resource_with_code("9", "update must be a document"));
    };
    let Some(target) = doc.as_object_mut() else {
        return Err(ShellError::Internal("stored document is not an object".into()));
    };
    if !spec.keys().any(|k| k.starts_with('$')) {
        let id = target.get("_id").cloned();
        *target = spec.clone();
        if let Some(id) = id {
            target.insert("_id".to_string(), id);
        }
        return Ok(());
    }
    for (op, fields) in spec {
        let Some(fields) = fields.as_object() else {
            return Err(ShellError::resource_with_code("9", format!("{op} needs a document")));
        };
        for (field, value) in fields {
            match op.as_str() {
                "$set" => {
                    target.insert(field.clone(), value.clone());
                }
                "$unset" => {
                    target.remove(field);
                }
                "$inc" => {
                    let current = target.get(field).and_then(Value::as_f64).unwrap_or(0.0);
                    let delta = value.as_f64().ok_or_else(|| {
                        ShellError::resource_with_code("14", "Cannot increment with non-numeric argument")
                    })?;
                    let sum = current + delta;
                    let next = if sum.fract() == 0.0 && value.is_i64() {
                        json!(sum as i64)
                    } else {
                        json!(sum)
                    };
                    target.insert(field.clone(), next);
                }
                other => {
                    return Err(ShellError::resource_with_code(
                        "9",
                        format!("Unknown modifier: {other}"),
                    ))
                }
            }
        }
    }
    Ok(())
}

/// Seed document for an upsert: the filter's plain equality fields.
pub fn upsert_seed(filter: &Value) -> Value {
    let mut seed = Map::new();
    if let Some(map) = filter.as_object() {
        for (k, v) in map {
            if !k.starts_with('$') && !k.contains('.') && !is_operator_doc(v) {
                seed.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(seed)
}
