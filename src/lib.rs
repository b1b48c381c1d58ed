//! This library contains the grammar engine of a generation-based fuzzer.
//!
//! It consists of
//! - __frontend__: Parse a textual grammar definition into a flat symbol table.
//! - __generation__: Stochastically produce strings of the described language
//!   with a stack-based interpreter.
//! - __cracking__: Replay a concrete string against the grammar's NFA to recover
//!   which choices and repeat counts would have produced it, and derive a
//!   re-weighted grammar that mimics the input.
//!
//! ## Getting Started
//! The first step always is to load a grammar. Use the
//! [`Grammar::builder()`](grammar::Grammar::builder) method like this:
//! ```
//! use starling_fuzz::grammar::Grammar;
//!
//! let grammar = Grammar::builder()
//!     .source("root  'hello ' name '\\n'\n\
//!              name  /[a-z]{3,8}/\n")
//!     .build().unwrap();
//!
//! let testcase = grammar.generate().unwrap();
//! ```
//! Then, to steer generation towards an interesting corpus input, crack it:
//! ```
//! # use starling_fuzz::{grammar::Grammar, cracker::GrammarCracker};
//! let grammar = Grammar::builder()
//!     .source("root {1,8} digit\n\
//!              digit | '0'\n\
//!             \t| '1'\n")
//!     .build().unwrap();
//! let cracker = GrammarCracker::new(&grammar).unwrap();
//!
//! if let Some(mimic) = cracker.crack(b"0110") {
//!     // generates four-digit strings that are mostly 0s and 1s in equal parts
//!     let similar = mimic.generate().unwrap();
//!     assert_eq!(similar.len(), 4);
//! }
//! ```

#![deny(missing_docs)]

pub(crate) mod generator;
pub(crate) mod parser;

pub mod cracker;
pub mod error;
pub mod grammar;
