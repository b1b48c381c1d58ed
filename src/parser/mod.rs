//! Line-oriented recursive-descent parser for the grammar definition dialect.

mod defn;
mod pattern;
mod source;

pub(crate) use source::parse_source;
