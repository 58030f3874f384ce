//! Command parser: turns wire-format DAG tokens into a populated
//! [`RunInfo`], performing alpha-conversion as it goes.
//!
//! `parse` expects tokens *after* the command name (`DAGRUN`/`DAGRUN_RO`
//! itself is stripped by the caller, see [`crate::engine`]).

pub mod alpha;
pub mod tokens;

use std::collections::HashMap;

use alpha::AlphaConverter;
use tokens::Cursor;

use crate::error::{DagError, DagResult};
use crate::keyspace::Keyspace;
use crate::op::{DagOp, OpKind, ReplyFormat, TensorSetSource};
use crate::run_info::RunInfo;
use crate::tensor::{DType, TensorHandle};

/// Whether PERSIST is allowed for this submission (`DAGRUN` vs `DAGRUN_RO`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DagMode {
    ReadWrite,
    ReadOnly,
}

pub fn parse(tokens: &[String], keyspace: &dyn Keyspace, mode: DagMode) -> DagResult<RunInfo> {
    let mut cur = Cursor::new(tokens);

    let mut load_keys: Vec<String> = Vec::new();
    if cur.eat_keyword("LOAD") {
        let n = cur.take_usize()?;
        for _ in 0..n {
            load_keys.push(cur.take_token()?);
        }
    }

    let mut persist_keys: Vec<String> = Vec::new();
    if cur.eat_keyword("PERSIST") {
        if mode == DagMode::ReadOnly {
            return Err(DagError::Parse("PERSIST is not allowed in DAGRUN_RO".to_string()));
        }
        let m = cur.take_usize()?;
        for _ in 0..m {
            persist_keys.push(cur.take_token()?);
        }
    }

    let mut timeout_ms: Option<u64> = None;
    if cur.eat_keyword("TIMEOUT") {
        let t = cur.take_u64()?;
        if t == 0 {
            return Err(DagError::Parse("TIMEOUT must be a positive integer".to_string()));
        }
        timeout_ms = Some(t);
    }

    let clauses = cur.remaining_clauses()?;
    if clauses.is_empty() {
        return Err(DagError::Parse("DAG must contain at least one op".to_string()));
    }
    if timeout_ms.is_some() && clauses.len() > 1 {
        return Err(DagError::Parse(
            "TIMEOUT is only allowed on a single-op DAG".to_string(),
        ));
    }

    let mut alpha = AlphaConverter::new();
    let mut tensors: Vec<Option<TensorHandle>> = Vec::new();

    for key in &load_keys {
        let tensor = keyspace
            .get_tensor(key)
            .map_err(|_| DagError::Parse(format!("tensor key is empty: {key}")))?;
        let slot = tensors.len();
        tensors.push(Some(tensor));
        alpha.load(key, slot);
    }

    let mut ops = Vec::with_capacity(clauses.len());
    for clause in &clauses {
        ops.push(parse_clause(clause, keyspace, &mut alpha, &mut tensors)?);
    }

    let mut persist_slots = HashMap::new();
    for key in &persist_keys {
        let slot = alpha
            .read(key)
            .ok_or_else(|| DagError::Parse(format!("PERSIST key never produced: {key}")))?;
        persist_slots.insert(key.clone(), slot);
    }

    Ok(RunInfo::new(tensors, ops, persist_slots, timeout_ms))
}

fn parse_clause(
    clause: &[String],
    keyspace: &dyn Keyspace,
    alpha: &mut AlphaConverter,
    tensors: &mut Vec<Option<TensorHandle>>,
) -> DagResult<DagOp> {
    let label = clause
        .first()
        .ok_or_else(|| DagError::Parse("empty op clause".to_string()))?
        .to_ascii_uppercase();
    let rest = &clause[1..];

    if label != "SCRIPTRUN" && rest.iter().any(|t| t == "$") {
        return Err(DagError::Parse(
            "'$' marker is only valid inside a SCRIPTRUN INPUTS section".to_string(),
        ));
    }

    match label.as_str() {
        "TENSORSET" => parse_tensorset(rest, alpha, tensors),
        "TENSORGET" => parse_tensorget(rest, alpha),
        "MODELRUN" => parse_modelrun(rest, keyspace, alpha, tensors),
        "SCRIPTRUN" => parse_scriptrun(rest, keyspace, alpha, tensors),
        other => Err(DagError::Parse(format!("unknown op clause: {other}"))),
    }
}

fn parse_tensorset(
    toks: &[String],
    alpha: &mut AlphaConverter,
    tensors: &mut Vec<Option<TensorHandle>>,
) -> DagResult<DagOp> {
    let mut cur = Cursor::new(toks);
    let key = cur.take_token()?;
    let dtype_tok = cur.take_token()?;
    let dtype = DType::parse(&dtype_tok)
        .ok_or_else(|| DagError::Parse(format!("invalid tensor dtype: {dtype_tok}")))?;

    let mut shape = Vec::new();
    loop {
        match cur.peek() {
            Some(t) if t.eq_ignore_ascii_case("BLOB") || t.eq_ignore_ascii_case("VALUES") => break,
            Some(_) => shape.push(cur.take_u64()?),
            None => return Err(DagError::Parse("TENSORSET missing BLOB or VALUES".to_string())),
        }
    }

    let source = if cur.eat_keyword("BLOB") {
        TensorSetSource::Blob(cur.take_token()?)
    } else {
        cur.eat_keyword("VALUES");
        let mut values = Vec::new();
        while cur.peek().is_some() {
            values.push(cur.take_token()?);
        }
        TensorSetSource::Values(values)
    };

    let out_slot = tensors.len();
    tensors.push(None);
    alpha.write(&key, out_slot);

    let mut op = DagOp::new(
        OpKind::TensorSet { dtype, shape, source },
        "CPU".to_string(),
        None,
    );
    op.out_indices = vec![out_slot];
    Ok(op)
}

fn parse_tensorget(toks: &[String], alpha: &AlphaConverter) -> DagResult<DagOp> {
    let mut cur = Cursor::new(toks);
    let key = cur.take_token()?;

    let mut formats = Vec::new();
    while let Some(tok) = cur.peek() {
        let fmt = ReplyFormat::parse(tok)
            .ok_or_else(|| DagError::Parse(format!("invalid TENSORGET format: {tok}")))?;
        formats.push(fmt);
        cur.take_token()?;
    }
    if formats.is_empty() {
        return Err(DagError::Parse(
            "TENSORGET requires at least one reply format".to_string(),
        ));
    }

    let in_slot = alpha
        .read(&key)
        .ok_or_else(|| DagError::Parse(format!("tensor key is empty: {key}")))?;

    let mut op = DagOp::new(OpKind::TensorGet { formats }, "CPU".to_string(), None);
    op.in_indices = vec![in_slot];
    Ok(op)
}

fn resolve_reads(names: &[String], alpha: &AlphaConverter) -> DagResult<Vec<usize>> {
    names
        .iter()
        .map(|n| {
            alpha
                .read(n)
                .ok_or_else(|| DagError::Parse(format!("tensor key is empty: {n}")))
        })
        .collect()
}

fn allocate_writes(
    names: &[String],
    alpha: &mut AlphaConverter,
    tensors: &mut Vec<Option<TensorHandle>>,
) -> Vec<usize> {
    names
        .iter()
        .map(|n| {
            let slot = tensors.len();
            tensors.push(None);
            alpha.write(n, slot);
            slot
        })
        .collect()
}

fn parse_modelrun(
    toks: &[String],
    keyspace: &dyn Keyspace,
    alpha: &mut AlphaConverter,
    tensors: &mut Vec<Option<TensorHandle>>,
) -> DagResult<DagOp> {
    let mut cur = Cursor::new(toks);
    let key = cur.take_token()?;
    let meta = keyspace.get_model_metadata(&key)?;

    if !cur.eat_keyword("INPUTS") {
        return Err(DagError::Parse("MODELRUN requires an INPUTS section".to_string()));
    }
    let mut input_names = Vec::new();
    while cur.peek().map(|t| !t.eq_ignore_ascii_case("OUTPUTS")).unwrap_or(false) {
        input_names.push(cur.take_token()?);
    }
    if !cur.eat_keyword("OUTPUTS") {
        return Err(DagError::Parse("MODELRUN requires an OUTPUTS section".to_string()));
    }
    let mut output_names = Vec::new();
    while cur.peek().is_some() {
        output_names.push(cur.take_token()?);
    }

    if input_names.len() != meta.input_names.len() {
        return Err(DagError::Parse(format!(
            "{key}: expected {} inputs, got {}",
            meta.input_names.len(),
            input_names.len()
        )));
    }
    if output_names.len() != meta.output_names.len() {
        return Err(DagError::Parse(format!(
            "{key}: expected {} outputs, got {}",
            meta.output_names.len(),
            output_names.len()
        )));
    }

    let in_indices = resolve_reads(&input_names, alpha)?;
    let out_indices = allocate_writes(&output_names, alpha, tensors);

    let mut op = DagOp::new(
        OpKind::ModelRun {
            input_names: input_names.into_iter().map(Some).collect(),
            output_names: output_names.into_iter().map(Some).collect(),
            batch_size: meta.batch_size,
            min_batch_size: meta.min_batch_size,
            min_batch_timeout_ms: meta.min_batch_timeout_ms,
        },
        meta.device,
        Some(key),
    );
    op.in_indices = in_indices;
    op.out_indices = out_indices;
    Ok(op)
}

fn parse_scriptrun(
    toks: &[String],
    keyspace: &dyn Keyspace,
    alpha: &mut AlphaConverter,
    tensors: &mut Vec<Option<TensorHandle>>,
) -> DagResult<DagOp> {
    let dollar_count = toks.iter().filter(|t| t.as_str() == "$").count();
    if dollar_count > 1 {
        return Err(DagError::Parse(
            "'$' variadic marker may appear at most once".to_string(),
        ));
    }

    let mut cur = Cursor::new(toks);
    let key = cur.take_token()?;
    let fn_name = cur.take_token()?;
    let meta = keyspace.get_script_metadata(&key)?;

    let mut input_names = Vec::new();
    let mut variadic_from = None;
    if cur.eat_keyword("INPUTS") {
        if cur.peek() == Some("$") {
            cur.take_token()?;
            variadic_from = Some(0);
        }
        while cur.peek().map(|t| !t.eq_ignore_ascii_case("OUTPUTS")).unwrap_or(false) {
            input_names.push(cur.take_token()?);
        }
    }
    if dollar_count > 0 && variadic_from.is_none() {
        return Err(DagError::Parse(
            "'$' marker is only valid as the first token of a SCRIPTRUN INPUTS section".to_string(),
        ));
    }
    if !cur.eat_keyword("OUTPUTS") {
        return Err(DagError::Parse("SCRIPTRUN requires an OUTPUTS section".to_string()));
    }
    let mut output_names = Vec::new();
    while cur.peek().is_some() {
        output_names.push(cur.take_token()?);
    }

    let in_indices = resolve_reads(&input_names, alpha)?;
    let out_indices = allocate_writes(&output_names, alpha, tensors);

    let mut op = DagOp::new(
        OpKind::ScriptRun {
            fn_name,
            input_names: input_names.into_iter().map(Some).collect(),
            variadic_from,
        },
        meta.device,
        Some(key),
    );
    op.in_indices = in_indices;
    op.out_indices = out_indices;
    Ok(op)
}
