//! Reverse-derive grammar statistics from concrete inputs.
//!
//! The cracker compiles a grammar into a Thompson-style NFA, replays an input
//! string against it and, on a match, produces a sibling grammar whose choice
//! weights and repeat bounds mimic the decisions that derivation took.
//!
//! Use it like so:
//! ```
//! use starling_fuzz::{grammar::Grammar, cracker::GrammarCracker};
//!
//! let grammar = Grammar::parse("root {1,8} digit\n\
//!                               digit | '0'\n\
//!                               \t| '1'\n").unwrap();
//! let cracker = GrammarCracker::new(&grammar).unwrap();
//!
//! // `None` means the input does not derive from the grammar.
//! let mimic = cracker.crack(b"0010").unwrap();
//! ```

mod nfa;

use ahash::{AHashMap, AHashSet};
use itertools::{Itertools, MinMaxResult};
use log::debug;
use petgraph::{algo::toposort, graph::DiGraph};

use crate::error::CrackError;
use crate::grammar::{Grammar, SymbolId, SymbolKind, ROOT_SYMBOL};
use nfa::{BranchKey, History, NfaToken, Predicate, State, StateId, StepOutcome};

/// Takes a grammar and uses it to crack generated data: [`crack`](GrammarCracker::crack)
/// returns a new grammar instance with weights updated to reflect what was
/// seen in the data, so that the returned grammar generates testcases similar
/// to the input.
pub struct GrammarCracker<'g> {
    grammar: &'g Grammar,
    states: Vec<State>,
    start: StateId,
}

impl<'g> GrammarCracker<'g> {
    /// Compile the grammar's NFA. Fails for grammars the matcher cannot
    /// express: external function calls other than `rndint`/`rndflt`, scope
    /// constructs, foreign inclusions, and cyclic symbol graphs.
    pub fn new(grammar: &'g Grammar) -> Result<Self, CrackError> {
        check_acyclic(grammar)?;
        let infix = traverse_infix(grammar)?;
        let postfix = nfa::to_postfix(infix);
        let (states, start) = nfa::build(postfix);
        debug!("compiled cracker NFA with {} states", states.len());
        Ok(Self {
            grammar,
            states,
            start,
        })
    }

    /// Run the NFA against `input`. `None` means no derivation was found,
    /// which is a valid outcome, not an error.
    pub fn crack(&self, input: &[u8]) -> Option<Grammar> {
        let mut threads = AHashSet::new();
        nfa::add(&self.states, &mut threads, self.start, History::default(), 0);
        let history = loop {
            if threads.is_empty() {
                return None;
            }
            match nfa::step(&self.states, self.grammar, &threads, input) {
                StepOutcome::Matched(history) => break history,
                StepOutcome::Next(next) => threads = next,
            }
        };
        Some(self.apply(history))
    }

    /// Rebuild a `copy0` sibling of the source grammar from the decision
    /// history of a successful match.
    fn apply(&self, history: History) -> Grammar {
        let mut grammar = self.grammar.copy0();
        for ((sym, index), count) in &history.choices {
            if let SymbolKind::Choice(c) = &mut grammar.symbol_mut(*sym).kind {
                c.choice.weights[*index] += *count as f64;
                // decision counts are cumulative along the branch chain, so a
                // non-first branch takes its count back out of the previous one
                if *index > 1 {
                    c.choice.weights[*index - 1] -= *count as f64;
                }
            }
        }
        for sym in history.choices.keys().map(|(sym, _)| *sym).dedup() {
            if let SymbolKind::Choice(c) = &mut grammar.symbol_mut(sym).kind {
                c.choice.recompute_total();
            }
        }
        for (sym, counts) in &history.repeats {
            if let SymbolKind::Repeat(r) = &mut grammar.symbol_mut(*sym).kind {
                let (min, max) = match counts.iter().minmax() {
                    MinMaxResult::MinMax(min, max) => (*min, *max),
                    MinMaxResult::OneElement(one) => (*one, *one),
                    MinMaxResult::NoElements => unreachable!(),
                };
                r.min = min;
                r.max = max;
            }
        }
        grammar
    }
}

/// Reject grammars whose reachable symbol graph is cyclic; NFA compilation of
/// a cyclic graph cannot terminate.
fn check_acyclic(grammar: &Grammar) -> Result<(), CrackError> {
    let root = match grammar.lookup(ROOT_SYMBOL) {
        Some(root) => root,
        None => return Ok(()),
    };
    let mut graph = DiGraph::<SymbolId, ()>::new();
    let mut nodes = AHashMap::new();
    let mut togo = vec![root];
    while let Some(id) = togo.pop() {
        let src = *nodes.entry(id).or_insert_with(|| graph.add_node(id));
        let children: Vec<SymbolId> = match &grammar.symbol(id).kind {
            SymbolKind::Concat(children) => children.clone(),
            SymbolKind::Regex(parts) => parts.clone(),
            SymbolKind::Choice(c) => c.choice.values.iter().flatten().copied().collect(),
            SymbolKind::Repeat(r) if !(r.min == 0 && r.max == 0) => r.children.clone(),
            SymbolKind::Ref(target) => vec![*target],
            _ => Vec::new(),
        };
        for child in children {
            let known = nodes.contains_key(&child);
            let dst = *nodes.entry(child).or_insert_with(|| graph.add_node(child));
            graph.add_edge(src, dst, ());
            if !known {
                togo.push(child);
            }
        }
    }
    match toposort(&graph, None) {
        Ok(_) => Ok(()),
        Err(cycle) => Err(CrackError::RecursiveGrammar(
            grammar.symbol(graph[cycle.node_id()]).name.clone(),
        )),
    }
}

/// Walk the symbol graph from `root`, yielding the NFA token stream in infix
/// order. Mirrors the stack discipline of the generator: container symbols
/// become parenthesized groups, atomic symbols become match predicates.
fn traverse_infix(grammar: &Grammar) -> Result<Vec<NfaToken>, CrackError> {
    enum Item {
        Sym(SymbolId),
        Tok(NfaToken),
    }

    let root = match grammar.lookup(ROOT_SYMBOL) {
        Some(root) => root,
        None => return Ok(Vec::new()),
    };
    let mut out = Vec::new();
    let mut togo = vec![Item::Sym(root)];
    while let Some(item) = togo.pop() {
        let id = match item {
            Item::Tok(token) => {
                out.push(token);
                continue;
            }
            Item::Sym(id) => id,
        };
        let sym = grammar.symbol(id);
        match &sym.kind {
            SymbolKind::Text(_) | SymbolKind::Binary(_) => {
                out.push(NfaToken::Pred(Predicate::Literal(id)));
            }
            SymbolKind::Concat(children) => {
                if children.is_empty() {
                    return Err(CrackError::EmptySymbol(sym.name.clone()));
                }
                togo.push(Item::Tok(NfaToken::RParen));
                togo.extend(children.iter().rev().map(|&c| Item::Sym(c)));
                out.push(NfaToken::LParen);
            }
            SymbolKind::Regex(parts) => {
                if parts.is_empty() {
                    return Err(CrackError::EmptySymbol(sym.name.clone()));
                }
                togo.push(Item::Tok(NfaToken::RParen));
                togo.extend(parts.iter().rev().map(|&c| Item::Sym(c)));
                out.push(NfaToken::LParen);
            }
            SymbolKind::Choice(c) => {
                if c.class.is_some() {
                    out.push(NfaToken::Pred(Predicate::Class(id)));
                } else {
                    let mut sub: Vec<Item> = Vec::new();
                    for (i, branch) in c.choice.values.iter().enumerate() {
                        if branch.is_empty() {
                            return Err(CrackError::EmptySymbol(sym.name.clone()));
                        }
                        if i == 1 {
                            sub.push(Item::Tok(NfaToken::Branch(BranchKey {
                                sym: id,
                                first: Some(0),
                                index: 1,
                            })));
                        } else if i > 1 {
                            sub.push(Item::Tok(NfaToken::Branch(BranchKey {
                                sym: id,
                                first: None,
                                index: i,
                            })));
                        }
                        sub.extend(branch.iter().map(|&c| Item::Sym(c)));
                    }
                    togo.push(Item::Tok(NfaToken::RParen));
                    togo.extend(sub.into_iter().rev());
                    out.push(NfaToken::LParen);
                }
            }
            SymbolKind::Repeat(r) => {
                if r.min == 0 && r.max == 0 {
                    continue;
                }
                if r.children.is_empty() {
                    return Err(CrackError::EmptySymbol(sym.name.clone()));
                }
                togo.push(Item::Tok(NfaToken::Loop {
                    sym: id,
                    min: r.min,
                    max: r.max,
                }));
                togo.push(Item::Tok(NfaToken::RParen));
                togo.extend(r.children.iter().rev().map(|&c| Item::Sym(c)));
                out.push(NfaToken::LParen);
            }
            SymbolKind::Func(f) => match f.fname.as_str() {
                "rndflt" => out.push(NfaToken::Pred(Predicate::RndFlt)),
                "rndint" => out.push(NfaToken::Pred(Predicate::RndInt)),
                _ => return Err(CrackError::ExternalFunction(f.fname.clone())),
            },
            SymbolKind::Ref(target) => {
                // a back-reference re-derives the referenced symbol's language
                togo.push(Item::Sym(*target));
            }
            other => {
                return Err(CrackError::Unsupported {
                    name: sym.name.clone(),
                    kind: other.kind_name(),
                });
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crack_self_generated() {
        let w = Grammar::parse(
            "root   \"a\" b c\n\
             b  0   \"\"\n\
             \t1   \"1\"\n\
             \t1   \"2\"\n\
             \t1   \"3\"\n\
             \t1   \"4\"\n\
             c{0,2} \"c\"",
        )
        .unwrap();
        let cracker = GrammarCracker::new(&w).unwrap();
        for _ in 0..50 {
            let input = w.generate().unwrap();
            assert!(cracker.crack(&input).is_some(), "no match for {:?}", input);
        }
    }

    #[test]
    fn test_crack_any_pattern() {
        let w = Grammar::parse("root /.*/").unwrap();
        let cracker = GrammarCracker::new(&w).unwrap();
        for _ in 0..100 {
            let input = w.generate().unwrap();
            assert!(cracker.crack(&input).is_some(), "no match for {:?}", input);
        }
    }

    #[test]
    fn test_crack_no_match() {
        let w = Grammar::parse("root 'abc'").unwrap();
        let cracker = GrammarCracker::new(&w).unwrap();
        assert!(cracker.crack(b"abc").is_some());
        assert!(cracker.crack(b"xyz").is_none());
        assert!(cracker.crack(b"ab").is_none());
        // trailing unconsumed input is not a match either
        assert!(cracker.crack(b"abcd").is_none());
    }

    #[test]
    fn test_crack_weights_mimic_input() {
        let w = Grammar::parse(
            "root   b\n\
             b{7}  c\n\
             c  1   \"1\"\n\
             \t1   \"2\"\n\
             \t1   \"3\"\n\
             \t4   \"4\"",
        )
        .unwrap();
        let cracker = GrammarCracker::new(&w).unwrap();
        for _ in 0..10 {
            let input = w.generate().unwrap();
            let mimic = cracker.crack(&input).unwrap();

            let mut reference: AHashMap<u8, usize> = AHashMap::new();
            for byte in &input {
                *reference.entry(*byte).or_insert(0) += 1;
            }
            let mut observed: AHashMap<u8, usize> = AHashMap::new();
            const RUNS: usize = 100;
            for _ in 0..RUNS {
                let out = mimic.generate().unwrap();
                assert_eq!(out.len(), 7);
                for byte in out {
                    *observed.entry(byte).or_insert(0) += 1;
                }
            }
            for (byte, count) in observed {
                let per_run = count as f64 / RUNS as f64;
                let expected = *reference.get(&byte).unwrap_or(&0) as f64;
                assert!(
                    (per_run - expected).abs() < 1.0,
                    "byte {} came out {} per run, expected {}",
                    byte as char,
                    per_run,
                    expected
                );
            }
        }
    }

    #[test]
    fn test_crack_exact_weights() {
        let w = Grammar::parse(
            "root {1,8} digit\n\
             digit | '0'\n\
             \t| '1'\n\
             \t| '2'\n",
        )
        .unwrap();
        let cracker = GrammarCracker::new(&w).unwrap();
        let mimic = cracker.crack(b"01102").unwrap();

        let digit = mimic.lookup("digit").unwrap();
        match &mimic.symbol(digit).kind {
            SymbolKind::Choice(c) => {
                assert_eq!(c.choice.weights, vec![2.0, 2.0, 1.0]);
                assert_eq!(c.choice.total, 5.0);
            }
            _ => panic!("expected choice"),
        }
        let rep = mimic.lookup("root").unwrap();
        match &mimic.symbol(rep).kind {
            SymbolKind::Repeat(r) => assert_eq!((r.min, r.max), (5, 5)),
            _ => panic!("expected repeat"),
        }
    }

    #[test]
    fn test_crack_tracked_reference() {
        let w = Grammar::parse("root id @id\nid /[0-9]{2}/").unwrap();
        let cracker = GrammarCracker::new(&w).unwrap();
        for _ in 0..20 {
            let input = w.generate().unwrap();
            assert_eq!(input.len(), 4);
            assert!(cracker.crack(&input).is_some());
        }
    }

    #[test]
    fn test_crack_rndint() {
        let w = Grammar::parse("root 'n=' rndint(0, 999)").unwrap();
        let cracker = GrammarCracker::new(&w).unwrap();
        for _ in 0..20 {
            let input = w.generate().unwrap();
            assert!(cracker.crack(&input).is_some());
        }
        assert!(cracker.crack(b"n=abc").is_none());
    }

    #[test]
    fn test_external_function_uncrackable() {
        let w = Grammar::builder()
            .source("root f('a')")
            .function("f", |args| Ok(args[0].clone()))
            .build()
            .unwrap();
        assert!(matches!(
            GrammarCracker::new(&w),
            Err(CrackError::ExternalFunction(name)) if name == "f"
        ));
    }

    #[test]
    fn test_recursive_grammar_uncrackable() {
        let w = Grammar::parse(
            "root 'a' b\n\
             b | root\n\
             \t| 'x'",
        )
        .unwrap();
        assert!(matches!(
            GrammarCracker::new(&w),
            Err(CrackError::RecursiveGrammar(_))
        ));
    }

    #[test]
    fn test_scope_symbols_uncrackable() {
        let w = Grammar::parse("root { id } $id\nid '4'").unwrap();
        assert!(matches!(
            GrammarCracker::new(&w),
            Err(CrackError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_cracked_grammar_is_independent() {
        let w = Grammar::parse(
            "root {2,4} digit\n\
             digit | '7'\n\
             \t| '8'\n",
        )
        .unwrap();
        let cracker = GrammarCracker::new(&w).unwrap();
        let input = w.generate().unwrap();
        let _ = cracker.crack(&input).unwrap();
        // the source grammar still has its parse-time weights and bounds
        let digit = w.lookup("digit").unwrap();
        match &w.symbol(digit).kind {
            SymbolKind::Choice(c) => assert_eq!(c.choice.total, 2.0),
            _ => unreachable!(),
        }
        let root = w.lookup("root").unwrap();
        match &w.symbol(root).kind {
            SymbolKind::Repeat(r) => assert_eq!((r.min, r.max), (2, 4)),
            _ => unreachable!(),
        }
        // and the cracked grammar still generates
        let mimic = cracker.crack(&input).unwrap();
        let out = mimic.generate().unwrap();
        assert_eq!(out.len(), input.len());
    }
}
