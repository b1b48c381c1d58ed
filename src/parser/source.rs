//! Top-level line shapes of a grammar definition: comments, blank lines,
//! named definitions, choice continuations and foreign-grammar inclusions.

use std::path::Path;

use log::debug;

use crate::error::{GrammarError, ParseError};
use crate::grammar::{ChoiceSymbol, Grammar, RepeatSymbol, SymbolId, SymbolKind};
use crate::parser::defn;

/// Parse the whole definition text into the grammar's symbol table.
pub(crate) fn parse_source(source: &str, grmr: &mut Grammar, base_dir: &Path) -> Result<(), GrammarError> {
    let mut current: Option<SymbolId> = None;
    let mut joined = String::new();
    let mut allow_cfg = true;
    let mut last_line = 0;
    for (idx, raw) in source.lines().enumerate() {
        let line_no = idx + 1;
        last_line = line_no;
        debug!("parsing line #{}: {}", line_no, raw.trim_end());
        let line = if joined.is_empty() {
            raw.to_string()
        } else {
            format!("{}{}", joined, raw)
        };
        // A trailing backslash joins the logical line with the next physical one.
        if let Some(stripped) = line.strip_suffix('\\') {
            joined = stripped.to_string();
            continue;
        }
        joined.clear();
        parse_line(&line, line_no, grmr, base_dir, &mut current, &mut allow_cfg)?;
    }
    if !joined.is_empty() {
        return Err(ParseError::UnexpectedEof(last_line).into());
    }
    Ok(())
}

fn parse_line(
    line: &str,
    line_no: usize,
    grmr: &mut Grammar,
    base_dir: &Path,
    current: &mut Option<SymbolId>,
    allow_cfg: &mut bool,
) -> Result<(), GrammarError> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() {
        return Ok(());
    }
    if trimmed.starts_with('#') {
        // only the first comment of the file may carry cfg directives
        if *allow_cfg {
            if let Some(limit) = cfg_max_depth(trimmed, line_no)? {
                grmr.set_max_depth(limit);
            }
            *allow_cfg = false;
        }
        return Ok(());
    }
    *allow_cfg = false;
    if line.starts_with(char::is_whitespace) {
        return parse_continuation(trimmed, line_no, grmr, base_dir, current);
    }
    parse_named(line, line_no, grmr, base_dir, current)
}

/// `  W Def` below a choice definition: another weighted branch.
fn parse_continuation(
    body: &str,
    line_no: usize,
    grmr: &mut Grammar,
    base_dir: &Path,
    current: &mut Option<SymbolId>,
) -> Result<(), GrammarError> {
    let choice_id = match *current {
        Some(id) if matches!(grmr.symbol(id).kind, SymbolKind::Choice(_)) => id,
        _ => return Err(ParseError::UnexpectedContinuation(line_no).into()),
    };
    let (weight, def) = continuation_weight(body, line_no)?;
    let value = defn::parse_definition(def, line_no, grmr, base_dir)?;
    append_choice(grmr, choice_id, value, weight);
    Ok(())
}

fn continuation_weight(body: &str, line_no: usize) -> Result<(f64, &str), GrammarError> {
    if let Some(stripped) = body.strip_prefix('|') {
        let def = stripped.trim_start();
        if def.is_empty() {
            return Err(ParseError::MalformedLine(line_no).into());
        }
        return Ok((1.0, def));
    }
    if body.starts_with(|ch: char| ch.is_ascii_digit() || ch == '.') {
        let run = body
            .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
            .unwrap_or(body.len());
        let def = body[run..].trim_start();
        if !def.is_empty() {
            let weight = body[..run].parse().map_err(|_| ParseError::BadWeight(line_no))?;
            return Ok((weight, def));
        }
    }
    Err(ParseError::MalformedLine(line_no).into())
}

/// `Name <type-marker> Definition`.
fn parse_named(
    line: &str,
    line_no: usize,
    grmr: &mut Grammar,
    base_dir: &Path,
    current: &mut Option<SymbolId>,
) -> Result<(), GrammarError> {
    let name_end = line
        .find(|ch: char| !(ch.is_alphanumeric() || ch == '_'))
        .unwrap_or(line.len());
    if name_end == 0 {
        return Err(ParseError::MalformedLine(line_no).into());
    }
    let name = &line[..name_end];
    let rest = &line[name_end..];
    if rest.is_empty() {
        return Err(ParseError::MalformedLine(line_no).into());
    }
    let body = rest.trim_start();
    let had_ws = body.len() != rest.len();

    // `Name | Def` opens a choice with an implicit weight of 1
    if let Some(stripped) = body.strip_prefix('|') {
        let def = stripped.trim_start();
        if def.is_empty() {
            return Err(ParseError::MalformedLine(line_no).into());
        }
        return define_choice(name, 1.0, def, line_no, grmr, base_dir, current);
    }
    // `Name W Def` opens a choice with an explicit first weight
    if body.starts_with(|ch: char| ch.is_ascii_digit() || ch == '.') {
        let run = body
            .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
            .unwrap_or(body.len());
        let def = body[run..].trim_start();
        if !def.is_empty() {
            let weight = body[..run].parse().map_err(|_| ParseError::BadWeight(line_no))?;
            return define_choice(name, weight, def, line_no, grmr, base_dir, current);
        }
        // a lone number is an ordinary definition token, not a weight
    }
    // `Name {a,b} Def` is a bounded repeat; braces that don't parse as bounds
    // belong to the definition (scope markers)
    if body.starts_with('{') {
        if let Some((min, max, after)) = repeat_marker(body) {
            let def = after.trim_start();
            if !def.is_empty() {
                if min > max {
                    return Err(ParseError::BadRepeatBounds(line_no).into());
                }
                return define_repeat(name, min, max, def, line_no, grmr, base_dir, current);
            }
        }
    }
    // `Name !file` includes a foreign grammar
    if had_ws {
        if let Some(spec) = body.strip_prefix('!') {
            return define_foreign(name, spec, line_no, grmr, base_dir, current);
        }
    }
    if !had_ws {
        return Err(ParseError::MalformedLine(line_no).into());
    }
    if body.is_empty() && rest.len() < 2 {
        return Err(ParseError::MalformedLine(line_no).into());
    }
    define_concat(name, body, line_no, grmr, base_dir, current)
}

fn repeat_marker(body: &str) -> Option<(u32, u32, &str)> {
    let bytes = body.as_bytes();
    let mut c = 1;
    skip_spaces(bytes, &mut c);
    let min = read_u32(bytes, &mut c)?;
    skip_spaces(bytes, &mut c);
    let max = if bytes.get(c) == Some(&b',') {
        c += 1;
        skip_spaces(bytes, &mut c);
        let max = read_u32(bytes, &mut c)?;
        skip_spaces(bytes, &mut c);
        max
    } else {
        min
    };
    if bytes.get(c) != Some(&b'}') {
        return None;
    }
    Some((min, max, &body[c + 1..]))
}

fn skip_spaces(bytes: &[u8], c: &mut usize) {
    while bytes.get(*c).is_some_and(|b| b.is_ascii_whitespace()) {
        *c += 1;
    }
}

fn read_u32(bytes: &[u8], c: &mut usize) -> Option<u32> {
    let start = *c;
    while bytes.get(*c).is_some_and(|b| b.is_ascii_digit()) {
        *c += 1;
    }
    if *c == start {
        return None;
    }
    std::str::from_utf8(&bytes[start..*c]).unwrap().parse().ok()
}

fn define_choice(
    name: &str,
    weight: f64,
    def: &str,
    line_no: usize,
    grmr: &mut Grammar,
    base_dir: &Path,
    current: &mut Option<SymbolId>,
) -> Result<(), GrammarError> {
    let id = grmr.declare(name, line_no, SymbolKind::Choice(ChoiceSymbol::new()))?;
    debug!("\tchoice {}", name);
    let value = defn::parse_definition(def, line_no, grmr, base_dir)?;
    append_choice(grmr, id, value, weight);
    *current = Some(id);
    Ok(())
}

fn define_repeat(
    name: &str,
    min: u32,
    max: u32,
    def: &str,
    line_no: usize,
    grmr: &mut Grammar,
    base_dir: &Path,
    current: &mut Option<SymbolId>,
) -> Result<(), GrammarError> {
    let id = grmr.declare(
        name,
        line_no,
        SymbolKind::Repeat(RepeatSymbol {
            children: Vec::new(),
            min,
            max,
        }),
    )?;
    debug!("\trepeat {}", name);
    let children = defn::parse_definition(def, line_no, grmr, base_dir)?;
    match &mut grmr.symbol_mut(id).kind {
        SymbolKind::Repeat(r) => r.children = children,
        _ => unreachable!(),
    }
    *current = Some(id);
    Ok(())
}

fn define_concat(
    name: &str,
    def: &str,
    line_no: usize,
    grmr: &mut Grammar,
    base_dir: &Path,
    current: &mut Option<SymbolId>,
) -> Result<(), GrammarError> {
    let id = grmr.declare(name, line_no, SymbolKind::Concat(Vec::new()))?;
    debug!("\tconcat {}", name);
    let children = defn::parse_definition(def, line_no, grmr, base_dir)?;
    match &mut grmr.symbol_mut(id).kind {
        SymbolKind::Concat(c) => *c = children,
        _ => unreachable!(),
    }
    *current = Some(id);
    Ok(())
}

fn define_foreign(
    name: &str,
    spec: &str,
    line_no: usize,
    grmr: &mut Grammar,
    base_dir: &Path,
    current: &mut Option<SymbolId>,
) -> Result<(), GrammarError> {
    let end = spec.find(char::is_whitespace).unwrap_or(spec.len());
    if end == 0 {
        return Err(ParseError::MalformedLine(line_no).into());
    }
    let filename = &spec[..end];
    let rest = spec[end..].trim_start();
    let path = base_dir.join(filename);
    let source = std::fs::read_to_string(&path).map_err(|source| GrammarError::Include {
        path: path.clone(),
        source,
    })?;
    // nested inclusions keep resolving against the original base directory
    let mut builder = Grammar::builder().source(source).base_dir(base_dir);
    if !rest.is_empty() {
        if !rest.starts_with('#') {
            return Err(ParseError::MalformedLine(line_no).into());
        }
        if let Some(limit) = cfg_max_depth(rest, line_no)? {
            builder = builder.max_depth(limit);
        }
    }
    let sub = builder.build().map_err(|e| GrammarError::Foreign {
        path,
        source: Box::new(e),
    })?;
    debug!("\tforeign {}: {}", name, filename);
    let id = grmr.declare(name, line_no, SymbolKind::Foreign(Box::new(sub)))?;
    *current = Some(id);
    Ok(())
}

fn append_choice(grmr: &mut Grammar, choice_id: SymbolId, value: Vec<SymbolId>, weight: f64) {
    // A branch that is a lone reference to an already-defined choice inherits
    // that choice's current total. Later weight changes of the sub-choice do
    // not propagate back.
    let weight = if value.len() == 1 {
        match &grmr.symbol(value[0]).kind {
            SymbolKind::Choice(sub) => sub.choice.total,
            _ => weight,
        }
    } else {
        weight
    };
    match &mut grmr.symbol_mut(choice_id).kind {
        SymbolKind::Choice(c) => c.choice.append(value, weight),
        _ => unreachable!(),
    }
}

/// Extract a `max-depth` value from a `# cfg: key=value, ...` comment.
fn cfg_max_depth(comment: &str, line_no: usize) -> Result<Option<usize>, GrammarError> {
    let body = comment.trim_start_matches('#').trim_start();
    let body = match body.strip_prefix("cfg:") {
        Some(body) => body,
        None => return Ok(None),
    };
    let mut max_depth = None;
    for entry in body.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match entry.split_once('=') {
            Some((key, value)) if key.trim() == "max-depth" => match value.trim().parse() {
                Ok(limit) => max_depth = Some(limit),
                Err(_) => {
                    return Err(ParseError::BadCfg {
                        line: line_no,
                        entry: entry.to_string(),
                    }
                    .into());
                }
            },
            _ => {
                return Err(ParseError::BadCfg {
                    line: line_no,
                    entry: entry.to_string(),
                }
                .into());
            }
        }
    }
    Ok(max_depth)
}
