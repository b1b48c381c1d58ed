//! All error types of this crate.
//!
//! Construction-time errors ([`ParseError`], [`GrammarError`]) abort the whole
//! grammar load, no partial grammar is usable. [`GenerationError`] aborts a
//! single `generate()` call, the grammar object remains valid afterwards.

use std::path::PathBuf;
use thiserror::Error;

/// Syntax-level errors raised while parsing a grammar definition.
/// Line numbers are 1-based.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The line matches none of the known line shapes.
    #[error("parse error on line {0}")]
    MalformedLine(usize),

    /// A definition contains a token the sub-parser does not recognize.
    #[error("failed to parse definition on line {line} at: {rest}")]
    BadDefinition {
        /// Source line of the definition.
        line: usize,
        /// Remaining unparsed definition text.
        rest: String,
    },

    /// A `,` or `)` appeared outside of a function call.
    #[error("unexpected token in definition on line {line} at: {rest}")]
    UnexpectedToken {
        /// Source line of the definition.
        line: usize,
        /// Remaining unparsed definition text.
        rest: String,
    },

    /// A quoted text literal is missing its closing quote.
    #[error("unterminated string literal on line {0}")]
    UnterminatedString(usize),

    /// A hex-quoted binary literal is missing its closing quote.
    #[error("unterminated binary literal on line {0}")]
    UnterminatedBinary(usize),

    /// A hex-quoted binary literal holds something other than hex digit pairs.
    #[error("invalid binary literal on line {0}")]
    BadHexLiteral(usize),

    /// A `/.../` pattern is missing its closing slash.
    #[error("unterminated regular expression on line {0}")]
    UnterminatedPattern(usize),

    /// A pattern quantifier has nothing to repeat.
    #[error("quantifier without a target in pattern on line {0}")]
    DanglingQuantifier(usize),

    /// A `{...}` quantifier in a pattern is not of the form `{n}` or `{n,m}`.
    #[error("malformed quantifier in pattern on line {0}")]
    BadQuantifier(usize),

    /// A function call is missing its closing parenthesis.
    #[error("unbalanced parentheses in call to {name} on line {line}")]
    UnbalancedCall {
        /// Name of the called function.
        name: String,
        /// Source line of the call.
        line: usize,
    },

    /// A weighted line continues a symbol that is not a choice.
    #[error("unexpected continuation of choice symbol on line {0}")]
    UnexpectedContinuation(usize),

    /// A choice weight is not a non-negative decimal number.
    #[error("invalid weight on line {0}")]
    BadWeight(usize),

    /// Repeat bounds are not `min <= max`.
    #[error("repeat bounds must satisfy min <= max on line {0}")]
    BadRepeatBounds(usize),

    /// A `# cfg:` directive names an unknown parameter or a bad value.
    #[error("invalid cfg directive on line {line}: {entry}")]
    BadCfg {
        /// Source line of the directive.
        line: usize,
        /// The offending `key=value` entry.
        entry: String,
    },

    /// The final line ends with a continuation backslash.
    #[error("unexpected end of input on line {0}")]
    UnexpectedEof(usize),
}

/// Errors raised while constructing a [`Grammar`](crate::grammar::Grammar).
#[derive(Debug, Error)]
pub enum GrammarError {
    /// The definition text is malformed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A symbol name is defined twice.
    #[error("redefinition of symbol {name} on line {line} (previously declared on line {prev})")]
    Redefinition {
        /// The redefined symbol name.
        name: String,
        /// Line of the conflicting definition.
        line: usize,
        /// Line of the previous definition.
        prev: usize,
    },

    /// A symbol is referenced but never defined.
    #[error("symbol {name} used on line {line} but not defined")]
    UndefinedSymbol {
        /// The undefined symbol name.
        name: String,
        /// Line of the first use.
        line: usize,
    },

    /// A function is called but no callback was supplied for it.
    #[error("function {name} used on line {line} but not defined")]
    UndefinedFunction {
        /// The undefined function name.
        name: String,
        /// Line of the first call.
        line: usize,
    },

    /// Callbacks were supplied that no `Func` symbol ever calls.
    #[error("unused keyword function(s): {0}")]
    UnusedFunctions(String),

    /// The grammar never defines its entry point.
    #[error("grammar does not define the entry point '{0}'")]
    MissingRoot(String),

    /// A `&file` or `!file` inclusion could not be read.
    #[error("failed to read {}: {}", .path.display(), .source)]
    Include {
        /// Path of the included file.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A foreign grammar failed to load.
    #[error("in foreign grammar {}: {}", .path.display(), .source)]
    Foreign {
        /// Path of the foreign grammar file.
        path: PathBuf,
        /// The construction error inside the foreign grammar.
        source: Box<GrammarError>,
    },
}

/// Errors raised by a single `generate()` call.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The safety net against unbounded recursion fired. The grammar expands
    /// a symbol through itself without a converging branch.
    #[error("hit hard recursion limit while generating {0}")]
    RunawayRecursion(String),

    /// The user-configured `max-depth` was exceeded.
    #[error("exceeded max-depth of {limit} while generating {symbol}")]
    DepthLimit {
        /// Symbol that was being expanded when the limit was hit.
        symbol: String,
        /// The configured depth limit.
        limit: usize,
    },

    /// A choice symbol has no weight left to sample from.
    #[error("choice {0} has no weight left to sample")]
    EmptyChoice(String),

    /// The requested start symbol does not exist.
    #[error("no symbol named {0} to start generation from")]
    UnknownStart(String),

    /// The symbol kind cannot be expanded.
    #[error("can't generate symbol {0}")]
    Ungeneratable(String),

    /// An external callback returned an error. It is passed through unmodified.
    #[error("function {name} failed: {source}")]
    Callback {
        /// Name of the failing callback.
        name: String,
        /// The callback's own error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Errors raised while compiling a grammar into the cracker's NFA.
///
/// A failed *match* is not an error: [`crack`](crate::cracker::GrammarCracker::crack)
/// returns `None` for inputs that do not derive from the grammar.
#[derive(Debug, Error)]
pub enum CrackError {
    /// The grammar calls an external function that has no reverse matcher.
    /// Only `rndint` and `rndflt` have built-in ones.
    #[error("cannot crack grammars using external function calls: {0}")]
    ExternalFunction(String),

    /// The symbol kind has no NFA equivalent.
    #[error("cannot crack using symbol {name} of kind {kind}")]
    Unsupported {
        /// Name of the offending symbol.
        name: String,
        /// Kind of the offending symbol.
        kind: &'static str,
    },

    /// A symbol expands to nothing and therefore can never consume input.
    #[error("cannot crack using empty symbol {0}")]
    EmptySymbol(String),

    /// The symbol graph reachable from the entry point contains a cycle.
    #[error("grammar is recursive at {0}; cracking requires an acyclic symbol graph")]
    RecursiveGrammar(String),
}
