//! This is the frontend that parses grammar definitions and owns the compiled
//! symbol table.
//!
//! Use it like so:
//! ```
//! use starling_fuzz::grammar::Grammar;
//!
//! let grammar = Grammar::builder()
//!     // The grammar definition, inline or via .grammar_file(path)
//!     .source("root  tag\n\
//!              tag   '<' upper(/[a-z]{1,8}/) '/>'\n")
//!     // Callbacks for function symbols used in the definition
//!     .function("upper", |args| {
//!         Ok(args[0].to_ascii_uppercase())
//!     })
//!     // Optional soft limit on symbol nesting
//!     .max_depth(50)
//!     .build().unwrap();
//! ```
//! A built [`Grammar`] is immutable and can be shared between threads; every
//! `generate()` call keeps its own state.

mod symbol;
mod wchoice;

pub(crate) use symbol::{CharClass, ChoiceSymbol, FuncSymbol, RepeatSymbol, Symbol, SymbolId, SymbolKind};
pub(crate) use wchoice::WeightedChoice;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use indexmap::IndexMap;
use itertools::Itertools;
use log::debug;
use rand::Rng;

use crate::error::{GenerationError, GrammarError};
use crate::generator::GenState;
use crate::parser;

/// Name of the symbol where generation starts.
pub const ROOT_SYMBOL: &str = "root";

/// Result type of external callbacks.
pub type FuncResult = Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;

/// An external callback: receives the generated bytes of each argument and
/// returns the bytes to emit in place of the call. Errors are passed through
/// to the caller of `generate()` unmodified.
pub type GrammarFunc = Box<dyn Fn(&[Vec<u8>]) -> FuncResult + Send + Sync>;

pub(crate) type FuncMap = AHashMap<String, GrammarFunc>;

/// A compiled grammar: a flat arena of symbols plus the name table, the set of
/// tracked symbols and the external callbacks.
///
/// Construct with [`Grammar::builder()`] or [`Grammar::parse()`].
#[derive(Clone)]
pub struct Grammar {
    symbols: Vec<Symbol>,
    names: IndexMap<String, SymbolId, ahash::RandomState>,
    tracked: AHashSet<SymbolId>,
    funcs: Arc<FuncMap>,
    max_depth: Option<usize>,
    n_implicit: usize,
}

impl Grammar {
    /// Returns a [`GrammarBuilder`] to load a grammar with.
    pub fn builder() -> GrammarBuilder {
        GrammarBuilder::new()
    }

    /// Shortcut for building a grammar from source text with no external
    /// callbacks beyond the built-in `rndint`/`rndflt`.
    pub fn parse(source: &str) -> Result<Grammar, GrammarError> {
        Grammar::builder().source(source).build()
    }

    /// Generate one string of the language, starting at `root`.
    pub fn generate(&self) -> Result<Vec<u8>, GenerationError> {
        self.generate_from(ROOT_SYMBOL)
    }

    /// Generate one string of the language, starting at the named symbol.
    pub fn generate_from(&self, start: &str) -> Result<Vec<u8>, GenerationError> {
        let mut rng = rand::thread_rng();
        self.generate_with(start, &mut rng)
    }

    /// Generate with a caller-supplied RNG, e.g. a seeded `StdRng` for
    /// reproducible runs. Note that the built-in `rndint`/`rndflt` callbacks
    /// draw from the thread RNG and stay non-deterministic.
    pub fn generate_with<R: Rng>(&self, start: &str, rng: &mut R) -> Result<Vec<u8>, GenerationError> {
        let id = self
            .lookup(start)
            .ok_or_else(|| GenerationError::UnknownStart(start.to_string()))?;
        GenState::new(self, rng).run(id, 0)
    }

    pub(crate) fn empty() -> Grammar {
        let mut grammar = Grammar {
            symbols: Vec::new(),
            names: IndexMap::default(),
            tracked: AHashSet::new(),
            funcs: Arc::new(FuncMap::default()),
            max_depth: None,
            n_implicit: 0,
        };
        // Scope markers are referenced as bare `{` / `}` tokens in definitions.
        grammar.insert("{".to_string(), "[scope enter]".to_string(), 0, SymbolKind::ScopeEnter);
        grammar.insert("}".to_string(), "[scope exit]".to_string(), 0, SymbolKind::ScopeExit);
        grammar
    }

    fn insert(&mut self, key: String, sym_name: String, line_no: usize, kind: SymbolKind) -> SymbolId {
        let id = SymbolId(self.symbols.len());
        self.symbols.push(Symbol {
            name: sym_name,
            line_no,
            kind,
        });
        self.names.insert(key, id);
        id
    }

    /// Define the named symbol, reusing an `Abstract` placeholder in place if
    /// one exists so that ids held by earlier references stay valid.
    pub(crate) fn declare(&mut self, name: &str, line_no: usize, kind: SymbolKind) -> Result<SymbolId, GrammarError> {
        if let Some(&id) = self.names.get(name) {
            let existing = &mut self.symbols[id.index()];
            if matches!(existing.kind, SymbolKind::Abstract) {
                existing.kind = kind;
                existing.line_no = line_no;
                return Ok(id);
            }
            return Err(GrammarError::Redefinition {
                name: name.to_string(),
                line: line_no,
                prev: existing.line_no,
            });
        }
        Ok(self.insert(name.to_string(), name.to_string(), line_no, kind))
    }

    /// Resolve a bare word against the table, creating an `Abstract` forward
    /// placeholder on first use.
    pub(crate) fn forward(&mut self, name: &str, line_no: usize) -> SymbolId {
        if let Some(&id) = self.names.get(name) {
            return id;
        }
        debug!("\tabstract {}", name);
        self.insert(name.to_string(), name.to_string(), line_no, SymbolKind::Abstract)
    }

    /// Register an implicit (unnamed in the source) symbol.
    pub(crate) fn define_implicit(&mut self, name: String, line_no: usize, kind: SymbolKind) -> SymbolId {
        debug_assert!(!self.names.contains_key(&name));
        self.insert(name.clone(), name, line_no, kind)
    }

    /// Next value of the per-grammar implicit-name counter.
    pub(crate) fn implicit(&mut self) -> usize {
        let n = self.n_implicit;
        self.n_implicit += 1;
        n
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.names.get(name).copied()
    }

    pub(crate) fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.index()]
    }

    pub(crate) fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.index()]
    }

    pub(crate) fn track(&mut self, id: SymbolId) {
        self.tracked.insert(id);
    }

    pub(crate) fn is_tracked(&self, id: SymbolId) -> bool {
        self.tracked.contains(&id)
    }

    pub(crate) fn func(&self, name: &str) -> Option<&GrammarFunc> {
        self.funcs.get(name)
    }

    pub(crate) fn max_depth(&self) -> Option<usize> {
        self.max_depth
    }

    pub(crate) fn set_max_depth(&mut self, limit: usize) {
        self.max_depth = Some(limit);
    }

    /// Structural copy with zeroed choice weights and repeat bounds. The
    /// cracker fills the zeroed state from observed statistics; symbol ids are
    /// preserved so branch lists carry over unchanged.
    pub(crate) fn copy0(&self) -> Grammar {
        let mut copy = self.clone();
        for sym in &mut copy.symbols {
            match &mut sym.kind {
                SymbolKind::Choice(c) => {
                    for weight in &mut c.choice.weights {
                        *weight = 0.0;
                    }
                    c.choice.total = 0.0;
                }
                SymbolKind::Repeat(r) => {
                    r.min = 0;
                    r.max = 0;
                }
                _ => {}
            }
        }
        copy
    }

    /// Post-parse sanity check: no abstract symbol survives, every called
    /// function has a callback and every callback is called.
    fn validate(&self) -> Result<(), GrammarError> {
        let mut funcs_used: AHashSet<&str> = ["rndint", "rndflt"].into_iter().collect();
        for (name, &id) in &self.names {
            let sym = self.symbol(id);
            match &sym.kind {
                SymbolKind::Abstract => {
                    return Err(GrammarError::UndefinedSymbol {
                        name: name.clone(),
                        line: sym.line_no,
                    });
                }
                SymbolKind::Func(f) => {
                    if !self.funcs.contains_key(&f.fname) {
                        return Err(GrammarError::UndefinedFunction {
                            name: f.fname.clone(),
                            line: sym.line_no,
                        });
                    }
                    funcs_used.insert(&f.fname);
                }
                _ => {}
            }
        }
        let unused = self
            .funcs
            .keys()
            .filter(|name| !funcs_used.contains(name.as_str()))
            .sorted()
            .join(", ");
        if !unused.is_empty() {
            return Err(GrammarError::UnusedFunctions(unused));
        }
        if !self.names.contains_key(ROOT_SYMBOL) {
            return Err(GrammarError::MissingRoot(ROOT_SYMBOL.to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Grammar({} symbols)", self.symbols.len())
    }
}

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Symbols:")?;
        for (name, &id) in &self.names {
            let sym = self.symbol(id);
            writeln!(f, "  {} [{}] (L{})", name, sym.kind.kind_name(), sym.line_no)?;
        }
        Ok(())
    }
}

/// The GrammarBuilder collects the definition source, the external callbacks
/// and the generation limits, then parses everything into a [`Grammar`].
///
/// Use it like so:
/// ```
/// use starling_fuzz::grammar::Grammar;
///
/// let grammar = Grammar::builder()
///     .source("root  'x=' rndint(0, 100)")
///     .build().unwrap();
/// ```
pub struct GrammarBuilder {
    source: Option<String>,
    path: Option<PathBuf>,
    base_dir: Option<PathBuf>,
    funcs: FuncMap,
    max_depth: Option<usize>,
}

impl GrammarBuilder {
    pub(crate) fn new() -> Self {
        Self {
            source: None,
            path: None,
            base_dir: None,
            funcs: FuncMap::default(),
            max_depth: None,
        }
    }

    /// Use the given text as the grammar definition.
    pub fn source<S: Into<String>>(mut self, source: S) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Read the grammar definition from a file. Unless overridden with
    /// [`base_dir`](GrammarBuilder::base_dir), `&file`/`!file` inclusions
    /// resolve relative to the file's directory.
    pub fn grammar_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Directory against which `&file` and `!file` inclusions are resolved.
    pub fn base_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.base_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Supply the callback for a function symbol used in the definition.
    pub fn function<S, F>(mut self, name: S, func: F) -> Self
    where
        S: Into<String>,
        F: Fn(&[Vec<u8>]) -> FuncResult + Send + Sync + 'static,
    {
        self.funcs.insert(name.into(), Box::new(func));
        self
    }

    /// Soft limit on symbol nesting depth during generation. Takes precedence
    /// over a `# cfg: max-depth=N` directive in the definition.
    pub fn max_depth(mut self, limit: usize) -> Self {
        self.max_depth = Some(limit);
        self
    }

    /// Parse and validate, yielding the immutable [`Grammar`].
    pub fn build(mut self) -> Result<Grammar, GrammarError> {
        let source = match (self.source.take(), self.path.as_deref()) {
            (Some(source), _) => source,
            (None, Some(path)) => std::fs::read_to_string(path).map_err(|source| GrammarError::Include {
                path: path.to_path_buf(),
                source,
            })?,
            (None, None) => String::new(),
        };
        let base_dir = match (self.base_dir.take(), self.path.as_deref()) {
            (Some(dir), _) => dir,
            (None, Some(path)) => path.parent().unwrap_or(Path::new(".")).to_path_buf(),
            (None, None) => PathBuf::from("."),
        };

        if !self.funcs.contains_key("rndint") {
            self.funcs.insert("rndint".to_string(), Box::new(builtin_rndint));
        }
        if !self.funcs.contains_key("rndflt") {
            self.funcs.insert("rndflt".to_string(), Box::new(builtin_rndflt));
        }

        let mut grammar = Grammar::empty();
        parser::parse_source(&source, &mut grammar, &base_dir)?;
        if let Some(limit) = self.max_depth {
            grammar.max_depth = Some(limit);
        }
        grammar.funcs = Arc::new(self.funcs);
        grammar.validate()?;
        Ok(grammar)
    }
}

fn builtin_rndint(args: &[Vec<u8>]) -> FuncResult {
    if args.len() != 2 {
        return Err(format!("rndint expects 2 arguments, got {}", args.len()).into());
    }
    let a = parse_arg::<i64>(&args[0])?;
    let b = parse_arg::<i64>(&args[1])?;
    if a > b {
        return Err(format!("rndint range is empty: ({}, {})", a, b).into());
    }
    Ok(rand::thread_rng().gen_range(a..=b).to_string().into_bytes())
}

fn builtin_rndflt(args: &[Vec<u8>]) -> FuncResult {
    if args.len() != 2 {
        return Err(format!("rndflt expects 2 arguments, got {}", args.len()).into());
    }
    let a = parse_arg::<f64>(&args[0])?;
    let b = parse_arg::<f64>(&args[1])?;
    if a > b {
        return Err(format!("rndflt range is empty: ({}, {})", a, b).into());
    }
    Ok(rand::thread_rng().gen_range(a..=b).to_string().into_bytes())
}

fn parse_arg<T: std::str::FromStr>(arg: &[u8]) -> Result<T, Box<dyn std::error::Error + Send + Sync>>
where
    T::Err: std::fmt::Display,
{
    let text = std::str::from_utf8(arg).map_err(|e| format!("argument is not valid UTF-8: {}", e))?;
    text.trim()
        .parse::<T>()
        .map_err(|e| format!("invalid numeric argument {:?}: {}", text, e).into())
}
