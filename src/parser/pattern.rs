//! The `/.../` pattern mini-language. Patterns are generators, not matchers:
//! every part is compiled down to ordinary choice/repeat/text symbols.

use log::debug;

use crate::error::{GrammarError, ParseError};
use crate::grammar::{CharClass, ChoiceSymbol, Grammar, RepeatSymbol, SymbolId, SymbolKind, WeightedChoice};

/// Every byte the `.` class and inverted classes can produce.
pub(crate) const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ\
abcdefghijklmnopqrstuvwxyz\
0123456789\
,./<>?;':\"[]\\{}|=_+`~!@#$%^&*() -";

/// Parse a pattern starting at the opening `/`. Returns the regex symbol and
/// the remainder after the closing `/`.
pub(crate) fn parse_pattern<'a>(
    defn: &'a str,
    line_no: usize,
    grmr: &mut Grammar,
) -> Result<(SymbolId, &'a str), GrammarError> {
    let name = format!("[regex {}]", grmr.implicit());
    debug!("\tregex {}", name);
    let regex_id = grmr.define_implicit(name.clone(), line_no, SymbolKind::Regex(Vec::new()));
    let stem = name[..name.len() - 1].to_string();

    let bytes = defn.as_bytes();
    debug_assert_eq!(bytes[0], b'/');
    let mut parts: Vec<SymbolId> = Vec::new();
    let mut pending: Option<SymbolId> = None;
    let mut n_sub = 0usize;
    let mut c = 1usize;
    while c < bytes.len() {
        match bytes[c] {
            b'/' => {
                if let Some(sym) = pending.take() {
                    parts.push(sym);
                }
                match &mut grmr.symbol_mut(regex_id).kind {
                    SymbolKind::Regex(slot) => *slot = parts,
                    _ => unreachable!(),
                }
                return Ok((regex_id, &defn[c + 1..]));
            }
            b'[' => {
                if let Some(sym) = pending.take() {
                    parts.push(sym);
                }
                let (choice, next) = parse_class(bytes, c, line_no, grmr, &stem, &mut n_sub)?;
                pending = Some(choice);
                c = next;
            }
            b'.' => {
                if let Some(sym) = pending.take() {
                    parts.push(sym);
                }
                pending = Some(alpha_choice(grmr));
                c += 1;
            }
            b'\\' => {
                if let Some(sym) = pending.take() {
                    parts.push(sym);
                }
                if c + 1 >= bytes.len() {
                    return Err(ParseError::UnterminatedPattern(line_no).into());
                }
                pending = Some(text_byte(grmr, line_no, bytes[c + 1]));
                c += 2;
            }
            b'+' => {
                let sym = pending
                    .take()
                    .ok_or(ParseError::DanglingQuantifier(line_no))?;
                add_repeat(grmr, line_no, &stem, &mut n_sub, &mut parts, sym, 1, 5);
                c += 1;
            }
            b'*' => {
                let sym = pending
                    .take()
                    .ok_or(ParseError::DanglingQuantifier(line_no))?;
                add_repeat(grmr, line_no, &stem, &mut n_sub, &mut parts, sym, 0, 5);
                c += 1;
            }
            b'{' => {
                let sym = pending
                    .take()
                    .ok_or(ParseError::DanglingQuantifier(line_no))?;
                let (min, max, next) = parse_quantifier(bytes, c, line_no)?;
                if min > max {
                    return Err(ParseError::BadRepeatBounds(line_no).into());
                }
                add_repeat(grmr, line_no, &stem, &mut n_sub, &mut parts, sym, min, max);
                c = next;
            }
            other => {
                if let Some(sym) = pending.take() {
                    parts.push(sym);
                }
                pending = Some(text_byte(grmr, line_no, other));
                c += 1;
            }
        }
    }
    Err(ParseError::UnterminatedPattern(line_no).into())
}

/// `[...]` / `[^...]` with `a-z` range expansion. A dash is literal when it
/// cannot form a range, i.e. in the last position.
fn parse_class(
    bytes: &[u8],
    start: usize,
    line_no: usize,
    grmr: &mut Grammar,
    stem: &str,
    n_sub: &mut usize,
) -> Result<(SymbolId, usize), GrammarError> {
    let mut c = start + 1;
    let inverted = bytes.get(c) == Some(&b'^');
    if inverted {
        c += 1;
    }
    let mut alpha: Vec<u8> = Vec::new();
    let mut closed = false;
    while c < bytes.len() {
        match bytes[c] {
            b'\\' => {
                if c + 1 >= bytes.len() {
                    break;
                }
                alpha.push(bytes[c + 1]);
                c += 2;
            }
            b']' => {
                c += 1;
                closed = true;
                break;
            }
            other => {
                alpha.push(other);
                c += 1;
            }
        }
        if alpha.len() >= 3 && alpha[alpha.len() - 2] == b'-' {
            let end = alpha.pop().unwrap();
            alpha.pop();
            let first = alpha.pop().unwrap();
            alpha.extend(first..=end);
            if alpha.last() == Some(&b'-') {
                // keep an expansion ending in '-' from starting a bogus range
                let dash = alpha.pop().unwrap();
                alpha.insert(0, dash);
            }
        }
    }
    if !closed {
        return Err(ParseError::UnterminatedPattern(line_no).into());
    }
    alpha.sort_unstable();
    alpha.dedup();

    let class = CharClass {
        chars: Some(alpha.clone()),
        inverted,
    };
    let members: Vec<u8> = if inverted {
        ALPHABET.iter().copied().filter(|b| !alpha.contains(b)).collect()
    } else {
        alpha
    };
    let mut wc = WeightedChoice::default();
    for byte in members {
        let text = text_byte(grmr, line_no, byte);
        wc.append(vec![text], 1.0);
    }
    let choice_name = format!("{}.{}]", stem, *n_sub);
    *n_sub += 1;
    let choice_id = grmr.define_implicit(
        choice_name,
        line_no,
        SymbolKind::Choice(ChoiceSymbol {
            choice: wc,
            class: Some(class),
        }),
    );
    Ok((choice_id, c))
}

/// `{n}` / `{n,m}` quantifier after a part.
fn parse_quantifier(bytes: &[u8], start: usize, line_no: usize) -> Result<(u32, u32, usize), GrammarError> {
    let mut c = start + 1;
    skip_spaces(bytes, &mut c);
    let min = read_u32(bytes, &mut c).ok_or(ParseError::BadQuantifier(line_no))?;
    skip_spaces(bytes, &mut c);
    let max = if bytes.get(c) == Some(&b',') {
        c += 1;
        skip_spaces(bytes, &mut c);
        let max = read_u32(bytes, &mut c).ok_or(ParseError::BadQuantifier(line_no))?;
        skip_spaces(bytes, &mut c);
        max
    } else {
        min
    };
    if bytes.get(c) != Some(&b'}') {
        return Err(ParseError::BadQuantifier(line_no).into());
    }
    Ok((min, max, c + 1))
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

#[allow(clippy::too_many_arguments)]
fn add_repeat(
    grmr: &mut Grammar,
    line_no: usize,
    stem: &str,
    n_sub: &mut usize,
    parts: &mut Vec<SymbolId>,
    sym: SymbolId,
    min: u32,
    max: u32,
) {
    let name = format!("{}.{}]", stem, *n_sub);
    *n_sub += 1;
    let rep = grmr.define_implicit(
        name,
        line_no,
        SymbolKind::Repeat(RepeatSymbol {
            children: vec![sym],
            min,
            max,
        }),
    );
    parts.push(rep);
}

fn text_byte(grmr: &mut Grammar, line_no: usize, byte: u8) -> SymbolId {
    let name = format!("[text {}]", grmr.implicit());
    grmr.define_implicit(name, line_no, SymbolKind::Text(vec![byte]))
}

/// The `.` any-char choice is shared per grammar.
fn alpha_choice(grmr: &mut Grammar) -> SymbolId {
    if let Some(id) = grmr.lookup("[regex alpha]") {
        return id;
    }
    let mut wc = WeightedChoice::default();
    for byte in ALPHABET {
        let text = text_byte(grmr, 0, *byte);
        wc.append(vec![text], 1.0);
    }
    grmr.define_implicit(
        "[regex alpha]".to_string(),
        0,
        SymbolKind::Choice(ChoiceSymbol {
            choice: wc,
            class: Some(CharClass {
                chars: None,
                inverted: false,
            }),
        }),
    )
}
