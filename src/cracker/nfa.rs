//! Thompson-style NFA: postfix construction and the thread-set simulation.

use std::collections::BTreeMap;

use ahash::AHashSet;

use crate::grammar::{Grammar, SymbolId};

pub(crate) type StateId = usize;

const DANGLING: StateId = usize::MAX;

/// Match predicates of consuming states.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Predicate {
    /// A text/binary literal, matched as an input prefix.
    Literal(SymbolId),
    /// A one-byte character class attached to a pattern choice.
    Class(SymbolId),
    /// The numeric token shape of the built-in `rndint`.
    RndInt,
    /// The numeric token shape of the built-in `rndflt`.
    RndFlt,
}

impl Predicate {
    pub(crate) fn match_at(&self, grmr: &Grammar, input: &[u8], pos: usize) -> usize {
        match self {
            Predicate::Literal(id) | Predicate::Class(id) => grmr.symbol(*id).match_at(input, pos),
            Predicate::RndInt => token_len(input, pos, b"0123456789+-"),
            Predicate::RndFlt => token_len(input, pos, b"0123456789e.+-"),
        }
    }
}

fn token_len(input: &[u8], pos: usize, set: &[u8]) -> usize {
    input[pos..].iter().take_while(|b| set.contains(b)).count()
}

/// Identity of a branch decision state. The first decision state of a choice
/// charges branch 0 on its `out` path and branch 1 on `out2`; every following
/// state charges only its own branch index on `out2`. Together the per-path
/// counts form the cumulative encoding the weight update relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BranchKey {
    pub(crate) sym: SymbolId,
    pub(crate) first: Option<usize>,
    pub(crate) index: usize,
}

#[derive(Debug)]
pub(crate) enum State {
    /// Accepting state.
    Match,
    /// Consumes input via a match predicate.
    Consume { pred: Predicate, out: StateId },
    /// Splits between one choice branch (`out`) and the rest of the branch
    /// chain (`out2`).
    Branch {
        key: BranchKey,
        out: StateId,
        out2: StateId,
    },
    /// Counting loop of a bounded repeat. `body` re-enters the repeated
    /// sequence, `out` continues past the loop.
    Loop {
        sym: SymbolId,
        min: u32,
        max: u32,
        body: StateId,
        out: StateId,
    },
}

/// Tokens of the infix/postfix state stream.
#[derive(Debug, Clone, Copy)]
pub(crate) enum NfaToken {
    LParen,
    RParen,
    Concat,
    Pred(Predicate),
    Branch(BranchKey),
    Loop { sym: SymbolId, min: u32, max: u32 },
}

/// Convert the infix token stream to postfix, inserting explicit
/// concatenation operators.
pub(crate) fn to_postfix(infix: Vec<NfaToken>) -> Vec<NfaToken> {
    let mut out = Vec::with_capacity(infix.len() * 2);
    let mut nalt: Vec<BranchKey> = Vec::new();
    let mut natom = 0usize;
    let mut parens: Vec<(Vec<BranchKey>, usize)> = Vec::new();
    for token in infix {
        match token {
            NfaToken::LParen => {
                if natom > 1 {
                    natom -= 1;
                    out.push(NfaToken::Concat);
                }
                parens.push((std::mem::take(&mut nalt), natom));
                natom = 0;
            }
            NfaToken::Branch(key) => {
                debug_assert!(natom > 0);
                for _ in 1..natom {
                    out.push(NfaToken::Concat);
                }
                natom = 0;
                nalt.push(key);
            }
            NfaToken::RParen => {
                debug_assert!(natom > 0);
                for _ in 1..natom {
                    out.push(NfaToken::Concat);
                }
                for key in nalt.drain(..).rev() {
                    out.push(NfaToken::Branch(key));
                }
                let (prev_nalt, prev_natom) = parens.pop().unwrap();
                nalt = prev_nalt;
                natom = prev_natom + 1;
            }
            NfaToken::Loop { .. } => {
                debug_assert!(natom > 0);
                out.push(token);
            }
            NfaToken::Pred(_) => {
                if natom > 1 {
                    out.push(NfaToken::Concat);
                } else {
                    natom += 1;
                }
                out.push(token);
            }
            NfaToken::Concat => unreachable!(),
        }
    }
    debug_assert!(parens.is_empty());
    for _ in 1..natom {
        out.push(NfaToken::Concat);
    }
    for key in nalt.into_iter().rev() {
        out.push(NfaToken::Branch(key));
    }
    out
}

struct Frag {
    start: StateId,
    /// States whose `out` still dangles.
    outs: Vec<StateId>,
}

/// Build the state arena from the postfix stream. Returns the arena and the
/// start state; the single `Match` state is created last.
pub(crate) fn build(postfix: Vec<NfaToken>) -> (Vec<State>, StateId) {
    let mut states: Vec<State> = Vec::new();
    let mut stack: Vec<Frag> = Vec::new();
    for token in postfix {
        match token {
            NfaToken::Concat => {
                let f2 = stack.pop().unwrap();
                let f1 = stack.pop().unwrap();
                patch(&mut states, &f1.outs, f2.start);
                stack.push(Frag {
                    start: f1.start,
                    outs: f2.outs,
                });
            }
            NfaToken::Branch(key) => {
                let f2 = stack.pop().unwrap();
                let f1 = stack.pop().unwrap();
                let id = states.len();
                states.push(State::Branch {
                    key,
                    out: f1.start,
                    out2: f2.start,
                });
                let mut outs = f1.outs;
                outs.extend(f2.outs);
                stack.push(Frag { start: id, outs });
            }
            NfaToken::Loop { sym, min, max } => {
                let f = stack.pop().unwrap();
                let id = states.len();
                states.push(State::Loop {
                    sym,
                    min,
                    max,
                    body: f.start,
                    out: DANGLING,
                });
                patch(&mut states, &f.outs, id);
                stack.push(Frag {
                    start: id,
                    outs: vec![id],
                });
            }
            NfaToken::Pred(pred) => {
                let id = states.len();
                states.push(State::Consume { pred, out: DANGLING });
                stack.push(Frag {
                    start: id,
                    outs: vec![id],
                });
            }
            NfaToken::LParen | NfaToken::RParen => unreachable!(),
        }
    }
    let frag = stack.pop().unwrap();
    debug_assert!(stack.is_empty());
    let matchstate = states.len();
    states.push(State::Match);
    patch(&mut states, &frag.outs, matchstate);
    (states, frag.start)
}

fn patch(states: &mut [State], outs: &[StateId], target: StateId) {
    for &id in outs {
        match &mut states[id] {
            State::Consume { out, .. } | State::Loop { out, .. } => *out = target,
            _ => unreachable!(),
        }
    }
}

/// Per-path decision history. Copied on write at every decision point so that
/// concurrent NFA threads stay independent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub(crate) struct History {
    /// Live loop counters, keyed by loop state.
    counters: BTreeMap<StateId, u32>,
    /// Branch hit counts per `(choice, branch index)`.
    pub(crate) choices: BTreeMap<(SymbolId, usize), u32>,
    /// Iteration count of every completed pass through a repeat.
    pub(crate) repeats: BTreeMap<SymbolId, Vec<u32>>,
}

pub(crate) type Thread = (StateId, History, usize);

/// Advance `start` into the thread set, expanding decision states on the way.
/// Only `Match` and `Consume` states appear in the set itself.
pub(crate) fn add(states: &[State], set: &mut AHashSet<Thread>, start: StateId, hist: History, pos: usize) {
    let mut work = vec![(start, hist, pos)];
    while let Some((id, mut hist, pos)) = work.pop() {
        match &states[id] {
            State::Match | State::Consume { .. } => {
                set.insert((id, hist, pos));
            }
            State::Branch { key, out, out2 } => {
                let mut taken = hist.clone();
                if let Some(first) = key.first {
                    *taken.choices.entry((key.sym, first)).or_insert(0) += 1;
                }
                work.push((*out, taken, pos));
                *hist.choices.entry((key.sym, key.index)).or_insert(0) += 1;
                work.push((*out2, hist, pos));
            }
            State::Loop {
                sym,
                min,
                max,
                body,
                out,
            } => {
                let counter = hist.counters.get(&id).copied().unwrap_or(0);
                if counter >= *min && counter <= *max {
                    // exit the loop, record the completed iteration count
                    let mut exited = hist.clone();
                    exited.counters.remove(&id);
                    exited.repeats.entry(*sym).or_default().push(counter);
                    work.push((*out, exited, pos));
                }
                let counter = counter + 1;
                if counter <= *max {
                    hist.counters.insert(id, counter);
                    work.push((*body, hist, pos));
                }
            }
        }
    }
}

/// Outcome of stepping the whole thread set past one consumed chunk.
pub(crate) enum StepOutcome {
    /// Some thread reached the match state with the input consumed.
    Matched(History),
    /// The surviving thread set.
    Next(AHashSet<Thread>),
}

pub(crate) fn step(states: &[State], grmr: &Grammar, set: &AHashSet<Thread>, input: &[u8]) -> StepOutcome {
    let mut next = AHashSet::new();
    for (id, hist, pos) in set {
        match &states[*id] {
            State::Match => {
                if *pos >= input.len() {
                    return StepOutcome::Matched(hist.clone());
                }
            }
            State::Consume { pred, out } => {
                let bite = pred.match_at(grmr, input, *pos);
                if bite > 0 {
                    add(states, &mut next, *out, hist.clone(), pos + bite);
                }
            }
            _ => unreachable!(),
        }
    }
    StepOutcome::Next(next)
}
