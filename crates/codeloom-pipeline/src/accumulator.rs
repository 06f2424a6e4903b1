//! File accumulation: merging generated fragments into per-file buffers.
//!
//! Every function here is pure. It takes a borrowed [`FileRecord`] and
//! returns a new one, so a rejected fragment leaves the caller's record
//! exactly as it was.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use codeloom_types::{Draft, FileRecord, Fragment, LoomError, Result, Task};

/// Longest purpose string derived from a task description.
const HEALED_PURPOSE_LEN: usize = 50;

static TOP_LEVEL_SYMBOL: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:def|class|fn|struct|enum|trait)\s+([A-Za-z_][A-Za-z0-9_]*)",
    )
    .ok()
});

/// Top-level definitions in `code`, in order of appearance, without repeats.
///
/// Indented definitions (methods, nested functions) are not top-level and are
/// skipped.
pub fn infer_symbols(code: &str) -> Vec<String> {
    let mut seen = Vec::new();
    let Some(re) = TOP_LEVEL_SYMBOL.as_ref() else {
        return seen;
    };
    for caps in re.captures_iter(code) {
        let name = caps[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

fn dedup(symbols: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(symbols.len());
    for s in symbols {
        let s = s.trim().to_string();
        if !s.is_empty() && !out.contains(&s) {
            out.push(s);
        }
    }
    out
}

fn mentions(code: &str, symbol: &str) -> bool {
    match Regex::new(&format!(r"\b{}\b", regex::escape(symbol))) {
        Ok(re) => re.is_match(code),
        Err(_) => code.contains(symbol),
    }
}

/// Append `fragment` to `record`, rejecting it whole on any conflict.
///
/// Fails with [`LoomError::DuplicateSymbol`] when a declared symbol is
/// already present (whichever task added it), and with
/// [`LoomError::MalformedFragment`] for empty code or a declared symbol that
/// the code never mentions.
pub fn accumulate(record: &FileRecord, fragment: Fragment) -> Result<FileRecord> {
    if fragment.code.trim().is_empty() {
        return Err(LoomError::MalformedFragment {
            file: record.path.clone(),
            message: format!("task {} produced no code", fragment.task),
        });
    }
    let symbols = dedup(fragment.symbols);
    if let Some(missing) = symbols.iter().find(|s| !mentions(&fragment.code, s)) {
        return Err(LoomError::MalformedFragment {
            file: record.path.clone(),
            message: format!("declared symbol '{}' does not appear in the code", missing),
        });
    }
    if let Some(dup) = symbols.iter().find(|s| record.contains_symbol(s)) {
        return Err(LoomError::DuplicateSymbol {
            file: record.path.clone(),
            symbol: dup.clone(),
        });
    }

    let mut updated = record.clone();
    updated.symbols.extend(symbols.iter().cloned());
    updated.fragments.push(Fragment {
        task: fragment.task,
        code: fragment.code,
        symbols,
    });
    Ok(updated)
}

/// Remove every fragment contributed by `task`, along with its symbols.
/// Fragments of other tasks are untouched.
pub fn retract(record: &FileRecord, task: usize) -> FileRecord {
    let mut updated = record.clone();
    updated.fragments.retain(|f| f.task != task);
    updated.symbols = updated.declared_symbols();
    updated
}

/// Merge the active task's draft into its target file.
///
/// A target missing from `files` gets a fresh empty record first. The task's
/// own fragment from an earlier attempt is retracted before the new one is
/// accumulated, so a retry replaces rather than duplicates.
pub fn merge_draft(
    files: &BTreeMap<String, FileRecord>,
    task: &Task,
    draft: &Draft,
) -> Result<FileRecord> {
    let record = match files.get(&task.target_file) {
        Some(record) => retract(record, task.index),
        None => {
            tracing::warn!(
                task = task.index,
                file = %task.target_file,
                "Target file missing from plan, creating it"
            );
            let purpose: String = task.description.chars().take(HEALED_PURPOSE_LEN).collect();
            FileRecord::new(task.target_file.clone(), purpose)
        }
    };
    let symbols = if draft.symbols.is_empty() {
        infer_symbols(&draft.code)
    } else {
        draft.symbols.clone()
    };
    accumulate(
        &record,
        Fragment {
            task: task.index,
            code: draft.code.clone(),
            symbols,
        },
    )
}
