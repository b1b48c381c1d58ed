//! Sub-parser for the token stream of a single definition.

use std::path::Path;

use log::debug;

use crate::error::{GrammarError, ParseError};
use crate::grammar::{FuncSymbol, Grammar, SymbolId, SymbolKind};
use crate::parser::pattern;

fn is_word(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

/// Parse a full definition into a sequence of symbol ids.
pub(crate) fn parse_definition(
    defn: &str,
    line_no: usize,
    grmr: &mut Grammar,
    base_dir: &Path,
) -> Result<Vec<SymbolId>, GrammarError> {
    let (result, rest) = parse_tokens(defn, line_no, grmr, base_dir, false)?;
    debug_assert!(rest.is_empty());
    Ok(result)
}

/// Consume tokens until the definition ends or, inside a function call, a
/// `,`/`)` delimiter is reached. Returns the parsed symbols and the unparsed
/// remainder starting at the delimiter.
fn parse_tokens<'a>(
    mut defn: &'a str,
    line_no: usize,
    grmr: &mut Grammar,
    base_dir: &Path,
    in_func: bool,
) -> Result<(Vec<SymbolId>, &'a str), GrammarError> {
    let mut result = Vec::new();
    while let Some(first) = defn.chars().next() {
        if first.is_whitespace() {
            defn = defn.trim_start();
            continue;
        }
        match first {
            '\'' | '"' => {
                let (id, rest) = parse_text(defn, line_no, grmr)?;
                result.push(id);
                defn = rest;
            }
            'x' if defn[1..].starts_with('\'') || defn[1..].starts_with('"') => {
                let (id, rest) = parse_binary(defn, line_no, grmr)?;
                result.push(id);
                defn = rest;
            }
            '/' => {
                let (id, rest) = pattern::parse_pattern(defn, line_no, grmr)?;
                result.push(id);
                defn = rest;
            }
            ',' | ')' => {
                if !in_func {
                    return Err(ParseError::UnexpectedToken {
                        line: line_no,
                        rest: defn.to_string(),
                    }
                    .into());
                }
                break;
            }
            '#' => {
                defn = "";
                break;
            }
            '@' => {
                let (id, rest) = parse_ref(defn, line_no, grmr, false)?;
                result.push(id);
                defn = rest;
            }
            '$' => {
                let (id, rest) = parse_ref(defn, line_no, grmr, true)?;
                result.push(id);
                defn = rest;
            }
            '{' => {
                result.push(grmr.lookup("{").unwrap());
                defn = &defn[1..];
            }
            '}' => {
                result.push(grmr.lookup("}").unwrap());
                defn = &defn[1..];
            }
            '&' => {
                let (id, rest) = parse_file(defn, line_no, grmr, base_dir, in_func)?;
                result.push(id);
                defn = rest;
            }
            ch if is_word(ch) => {
                let end = defn.find(|c: char| !is_word(c)).unwrap_or(defn.len());
                let word = &defn[..end];
                let rest = &defn[end..];
                if let Some(call) = rest.strip_prefix('(') {
                    if matches!(word, "rndint" | "rndflt") {
                        if let Some((id, after)) = parse_numeric_call(word, call, line_no, grmr) {
                            result.push(id);
                            defn = after;
                            continue;
                        }
                    }
                    let (id, rest) = parse_func(word, call, line_no, grmr, base_dir)?;
                    result.push(id);
                    defn = rest;
                } else {
                    result.push(grmr.forward(word, line_no));
                    defn = rest;
                }
            }
            _ => {
                return Err(ParseError::BadDefinition {
                    line: line_no,
                    rest: defn.to_string(),
                }
                .into());
            }
        }
    }
    Ok((result, defn))
}

/// `'...'` / `"..."`. The escape table knows `\t \n \v \r`; any other escaped
/// character passes through without the backslash, the non-delimiter quote
/// character is literal.
fn parse_text<'a>(defn: &'a str, line_no: usize, grmr: &mut Grammar) -> Result<(SymbolId, &'a str), GrammarError> {
    let mut chars = defn.char_indices();
    let (_, qchar) = chars.next().unwrap();
    let mut out = String::new();
    while let Some((idx, ch)) = chars.next() {
        if ch == qchar {
            let name = format!("[text {}]", grmr.implicit());
            debug!("\ttext {}: {:?}", name, out);
            let id = grmr.define_implicit(name, line_no, SymbolKind::Text(out.into_bytes()));
            return Ok((id, &defn[idx + ch.len_utf8()..]));
        }
        if ch == '\\' {
            match chars.next() {
                Some((_, esc)) => out.push(match esc {
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    'v' => '\u{B}',
                    other => other,
                }),
                None => break,
            }
        } else {
            out.push(ch);
        }
    }
    Err(ParseError::UnterminatedString(line_no).into())
}

/// `x'68656c6c6f'`, hex-decoded at parse time.
fn parse_binary<'a>(defn: &'a str, line_no: usize, grmr: &mut Grammar) -> Result<(SymbolId, &'a str), GrammarError> {
    let qchar = defn[1..].chars().next().unwrap();
    let body = &defn[2..];
    let end = match body.find(qchar) {
        Some(end) => end,
        None => return Err(ParseError::UnterminatedBinary(line_no).into()),
    };
    let hex: String = body[..end].chars().filter(|ch| !ch.is_whitespace()).collect();
    if hex.len() % 2 != 0 || !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(ParseError::BadHexLiteral(line_no).into());
    }
    let value = hex
        .as_bytes()
        .chunks(2)
        .map(|pair| u8::from_str_radix(std::str::from_utf8(pair).unwrap(), 16).unwrap())
        .collect();
    let name = format!("[bin {}]", grmr.implicit());
    debug!("\tbin {}: {}", name, hex);
    let id = grmr.define_implicit(name, line_no, SymbolKind::Binary(value));
    Ok((id, &body[end + qchar.len_utf8()..]))
}

/// `@name` / `$name`: reference to a tracked symbol. The target is forward
/// declared if necessary and marked tracked.
fn parse_ref<'a>(
    defn: &'a str,
    line_no: usize,
    grmr: &mut Grammar,
    scoped: bool,
) -> Result<(SymbolId, &'a str), GrammarError> {
    let body = &defn[1..];
    let end = body.find(|ch: char| !is_word(ch)).unwrap_or(body.len());
    if end == 0 {
        return Err(ParseError::BadDefinition {
            line: line_no,
            rest: defn.to_string(),
        }
        .into());
    }
    let target_name = &body[..end];
    let sigil = if scoped { '$' } else { '@' };
    let ref_name = format!("{}{}", sigil, target_name);
    let id = match grmr.lookup(&ref_name) {
        Some(id) => id,
        None => {
            let target = grmr.forward(target_name, line_no);
            grmr.track(target);
            debug!("\tref {}{}", sigil, target_name);
            let kind = if scoped {
                SymbolKind::ScopedRef(target)
            } else {
                SymbolKind::Ref(target)
            };
            grmr.define_implicit(ref_name, line_no, kind)
        }
    };
    Ok((id, &body[end..]))
}

/// `&filename`: a text symbol whose content is read from a file at parse time.
fn parse_file<'a>(
    defn: &'a str,
    line_no: usize,
    grmr: &mut Grammar,
    base_dir: &Path,
    in_func: bool,
) -> Result<(SymbolId, &'a str), GrammarError> {
    let body = &defn[1..];
    let end = body
        .find(|ch: char| ch.is_whitespace() || (in_func && (ch == ',' || ch == ')')))
        .unwrap_or(body.len());
    if end == 0 {
        return Err(ParseError::BadDefinition {
            line: line_no,
            rest: defn.to_string(),
        }
        .into());
    }
    let path = base_dir.join(&body[..end]);
    let value = std::fs::read(&path).map_err(|source| GrammarError::Include {
        path: path.clone(),
        source,
    })?;
    let name = format!("[file {}]", grmr.implicit());
    debug!("\tfile {}: {}", name, path.display());
    let id = grmr.define_implicit(name, line_no, SymbolKind::Text(value));
    Ok((id, &body[end..]))
}

/// The built-ins accept bare numeric literals: `rndint(1, 10)`,
/// `rndflt(0.5, 2e3)`. Anything else falls back to ordinary symbol arguments.
fn parse_numeric_call<'a>(
    fname: &str,
    defn: &'a str,
    line_no: usize,
    grmr: &mut Grammar,
) -> Option<(SymbolId, &'a str)> {
    let float = fname == "rndflt";
    let (a, rest) = numeric_token(defn, float)?;
    let rest = rest.trim_start().strip_prefix(',')?;
    let (b, rest) = numeric_token(rest, float)?;
    let rest = rest.trim_start().strip_prefix(')')?;
    let name = format!("[{} {}]", fname, grmr.implicit());
    let stem = name[..name.len() - 1].to_string();
    let arg_a = grmr.define_implicit(format!("{}.0]", stem), line_no, SymbolKind::Text(a));
    let arg_b = grmr.define_implicit(format!("{}.1]", stem), line_no, SymbolKind::Text(b));
    let id = grmr.define_implicit(
        name,
        line_no,
        SymbolKind::Func(FuncSymbol {
            fname: fname.to_string(),
            args: vec![arg_a, arg_b],
        }),
    );
    Some((id, rest))
}

fn numeric_token(defn: &str, float: bool) -> Option<(Vec<u8>, &str)> {
    let defn = defn.trim_start();
    let set: &[u8] = if float { b"0123456789.e+-" } else { b"0123456789+-" };
    let end = defn
        .bytes()
        .position(|b| !set.contains(&b))
        .unwrap_or(defn.len());
    if end == 0 {
        return None;
    }
    Some((defn[..end].as_bytes().to_vec(), &defn[end..]))
}

/// `funcname(arg, ...)`. Each argument is wrapped in an implicit concatenation
/// so the callback receives one generated string per argument.
fn parse_func<'a>(
    fname: &str,
    mut defn: &'a str,
    line_no: usize,
    grmr: &mut Grammar,
    base_dir: &Path,
) -> Result<(SymbolId, &'a str), GrammarError> {
    let name = format!("[{} {}]", fname, grmr.implicit());
    let func_id = grmr.define_implicit(
        name.clone(),
        line_no,
        SymbolKind::Func(FuncSymbol {
            fname: fname.to_string(),
            args: Vec::new(),
        }),
    );
    let stem = &name[..name.len() - 1];
    let mut args = Vec::new();
    loop {
        let (arg, rest) = parse_tokens(defn, line_no, grmr, base_dir, true)?;
        let done = match rest.chars().next() {
            Some(')') => true,
            Some(',') => false,
            _ => {
                return Err(ParseError::UnbalancedCall {
                    name: fname.to_string(),
                    line: line_no,
                }
                .into());
            }
        };
        defn = &rest[1..];
        if !arg.is_empty() || !done {
            let arg_name = format!("{}.{}]", stem, args.len());
            let arg_id = grmr.define_implicit(arg_name, line_no, SymbolKind::Concat(arg));
            args.push(arg_id);
        }
        if done {
            break;
        }
    }
    match &mut grmr.symbol_mut(func_id).kind {
        SymbolKind::Func(f) => f.args = args,
        _ => unreachable!(),
    }
    Ok((func_id, defn))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(defn: &str) -> Result<Vec<SymbolId>, GrammarError> {
        let mut grmr = Grammar::empty();
        parse_definition(defn, 1, &mut grmr, Path::new("."))
    }

    #[test]
    fn test_text_escapes() {
        let mut grmr = Grammar::empty();
        let ids = parse_definition("'a\\tb\\nc\\\\d\\q'", 1, &mut grmr, Path::new(".")).unwrap();
        assert_eq!(ids.len(), 1);
        match &grmr.symbol(ids[0]).kind {
            SymbolKind::Text(value) => assert_eq!(value, b"a\tb\nc\\dq"),
            _ => panic!("expected text"),
        }
    }

    #[test]
    fn test_binary_literal() {
        let mut grmr = Grammar::empty();
        let ids = parse_definition("x'68656c6c6f'", 1, &mut grmr, Path::new(".")).unwrap();
        match &grmr.symbol(ids[0]).kind {
            SymbolKind::Binary(value) => assert_eq!(value, b"hello"),
            _ => panic!("expected binary"),
        }
    }

    #[test]
    fn test_bad_binary() {
        assert!(matches!(
            parse_one("x'6865"),
            Err(GrammarError::Parse(ParseError::UnterminatedBinary(1)))
        ));
        assert!(matches!(
            parse_one("x'zz'"),
            Err(GrammarError::Parse(ParseError::BadHexLiteral(1)))
        ));
        assert!(matches!(
            parse_one("x'123'"),
            Err(GrammarError::Parse(ParseError::BadHexLiteral(1)))
        ));
    }

    #[test]
    fn test_unterminated_text() {
        assert!(matches!(
            parse_one("'abc"),
            Err(GrammarError::Parse(ParseError::UnterminatedString(1)))
        ));
        // the closing quote is escaped away
        assert!(matches!(
            parse_one("'abc\\'"),
            Err(GrammarError::Parse(ParseError::UnterminatedString(1)))
        ));
    }

    #[test]
    fn test_stray_delimiter() {
        assert!(matches!(
            parse_one("'a' ) 'b'"),
            Err(GrammarError::Parse(ParseError::UnexpectedToken { line: 1, .. }))
        ));
    }

    #[test]
    fn test_unbalanced_call() {
        assert!(matches!(
            parse_one("f('a'"),
            Err(GrammarError::Parse(ParseError::UnbalancedCall { line: 1, .. }))
        ));
    }

    #[test]
    fn test_func_args_are_concats() {
        let mut grmr = Grammar::empty();
        let ids = parse_definition("esc('a' sym, 'b')", 1, &mut grmr, Path::new(".")).unwrap();
        assert_eq!(ids.len(), 1);
        match &grmr.symbol(ids[0]).kind {
            SymbolKind::Func(f) => {
                assert_eq!(f.fname, "esc");
                assert_eq!(f.args.len(), 2);
                match &grmr.symbol(f.args[0]).kind {
                    SymbolKind::Concat(children) => assert_eq!(children.len(), 2),
                    _ => panic!("expected concat arg"),
                }
            }
            _ => panic!("expected func"),
        }
    }

    #[test]
    fn test_ref_marks_target_tracked() {
        let mut grmr = Grammar::empty();
        let ids = parse_definition("@id", 1, &mut grmr, Path::new(".")).unwrap();
        match &grmr.symbol(ids[0]).kind {
            SymbolKind::Ref(target) => assert!(grmr.is_tracked(*target)),
            _ => panic!("expected ref"),
        }
        // a second use reuses the same reference symbol
        let again = parse_definition("@id", 2, &mut grmr, Path::new(".")).unwrap();
        assert_eq!(ids[0], again[0]);
    }

    #[test]
    fn test_numeric_builtin_args() {
        let mut grmr = Grammar::empty();
        let ids = parse_definition("rndint(1, 10)", 1, &mut grmr, Path::new(".")).unwrap();
        match &grmr.symbol(ids[0]).kind {
            SymbolKind::Func(f) => {
                assert_eq!(f.fname, "rndint");
                assert_eq!(f.args.len(), 2);
                match &grmr.symbol(f.args[0]).kind {
                    SymbolKind::Text(value) => assert_eq!(value, b"1"),
                    _ => panic!("expected literal arg"),
                }
            }
            _ => panic!("expected func"),
        }
        // quoted args still go through the generic call parser
        let ids = parse_definition("rndint('1', '10')", 1, &mut grmr, Path::new(".")).unwrap();
        match &grmr.symbol(ids[0]).kind {
            SymbolKind::Func(f) => match &grmr.symbol(f.args[0]).kind {
                SymbolKind::Concat(children) => assert_eq!(children.len(), 1),
                _ => panic!("expected concat arg"),
            },
            _ => panic!("expected func"),
        }
    }

    #[test]
    fn test_comment_ends_definition() {
        let mut grmr = Grammar::empty();
        let ids = parse_definition("'a' # 'b'", 1, &mut grmr, Path::new(".")).unwrap();
        assert_eq!(ids.len(), 1);
    }
}
