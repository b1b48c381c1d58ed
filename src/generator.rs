//! The stack-based generation engine.
//!
//! Symbol expansion runs on an explicit work stack so that deeply recursive
//! grammars cannot exhaust the host call stack. The only recursion left is
//! per function-call argument, which is bounded by call nesting in the
//! definition text.

use ahash::AHashMap;
use log::trace;
use rand::Rng;

use crate::error::GenerationError;
use crate::grammar::{Grammar, SymbolId, SymbolKind};

/// Safety net against grammars that expand a symbol through itself without a
/// converging branch.
pub(crate) const HARD_DEPTH_LIMIT: usize = 10_000;

type InstanceMap = AHashMap<SymbolId, Vec<Vec<u8>>>;

enum Job {
    Expand(SymbolId, usize),
    /// Marks the end of a tracked symbol's capture.
    EndCapture(SymbolId),
}

/// State of one `generate()` call: the RNG plus the instance pool. The work
/// stack and output buffer live per [`run`](GenState::run) so that function
/// arguments generate into isolated buffers while sharing the pool.
pub(crate) struct GenState<'a, R: Rng> {
    grmr: &'a Grammar,
    rng: &'a mut R,
    /// All recorded instances, resolved by unscoped `@name` references.
    instances: InstanceMap,
    /// Scope overlays for `$name` references; index 0 is the global scope.
    scopes: Vec<InstanceMap>,
}

impl<'a, R: Rng> GenState<'a, R> {
    pub(crate) fn new(grmr: &'a Grammar, rng: &'a mut R) -> Self {
        Self {
            grmr,
            rng,
            instances: InstanceMap::new(),
            scopes: vec![InstanceMap::new()],
        }
    }

    pub(crate) fn run(&mut self, start: SymbolId, base_depth: usize) -> Result<Vec<u8>, GenerationError> {
        let grmr = self.grmr;
        let mut stack = vec![Job::Expand(start, base_depth)];
        let mut output: Vec<u8> = Vec::new();
        let mut captures: Vec<usize> = Vec::new();
        while let Some(job) = stack.pop() {
            let (id, depth) = match job {
                Job::EndCapture(id) => {
                    let offset = captures.pop().unwrap();
                    let instance = output[offset..].to_vec();
                    self.record(id, instance);
                    continue;
                }
                Job::Expand(id, depth) => (id, depth),
            };
            let sym = grmr.symbol(id);
            if depth > HARD_DEPTH_LIMIT {
                return Err(GenerationError::RunawayRecursion(sym.name.clone()));
            }
            if let Some(limit) = grmr.max_depth() {
                if depth > limit {
                    return Err(GenerationError::DepthLimit {
                        symbol: sym.name.clone(),
                        limit,
                    });
                }
            }
            if grmr.is_tracked(id) {
                stack.push(Job::EndCapture(id));
                captures.push(output.len());
            }
            trace!("generating {}", sym.name);
            match &sym.kind {
                SymbolKind::Text(value) | SymbolKind::Binary(value) => {
                    output.extend_from_slice(value);
                }
                SymbolKind::Concat(children) => {
                    for &child in children.iter().rev() {
                        stack.push(Job::Expand(child, depth + 1));
                    }
                }
                SymbolKind::Regex(parts) => {
                    for &child in parts.iter().rev() {
                        stack.push(Job::Expand(child, depth + 1));
                    }
                }
                SymbolKind::Choice(c) => {
                    let index = c
                        .choice
                        .choose(self.rng)
                        .ok_or_else(|| GenerationError::EmptyChoice(sym.name.clone()))?;
                    for &child in c.choice.values[index].iter().rev() {
                        stack.push(Job::Expand(child, depth + 1));
                    }
                }
                SymbolKind::Repeat(r) => {
                    // nested draw, biases the count towards the lower bound
                    let upper = self.rng.gen_range(r.min..=r.max);
                    let count = self.rng.gen_range(r.min..=upper);
                    for _ in 0..count {
                        for &child in r.children.iter().rev() {
                            stack.push(Job::Expand(child, depth + 1));
                        }
                    }
                }
                SymbolKind::Func(f) => {
                    let mut args = Vec::with_capacity(f.args.len());
                    for &arg in &f.args {
                        args.push(self.run(arg, depth + 1)?);
                    }
                    let func = grmr.func(&f.fname).ok_or_else(|| {
                        GenerationError::Ungeneratable(sym.name.clone())
                    })?;
                    let value = func(&args).map_err(|source| GenerationError::Callback {
                        name: f.fname.clone(),
                        source,
                    })?;
                    output.extend_from_slice(&value);
                }
                SymbolKind::Ref(target) => {
                    // no instance recorded yet leaves the reference empty
                    if let Some(instance) = self.pick(*target) {
                        output.extend_from_slice(&instance);
                    }
                }
                SymbolKind::ScopedRef(target) => {
                    if let Some(instance) = self.pick_scoped(*target) {
                        output.extend_from_slice(&instance);
                    }
                }
                SymbolKind::ScopeEnter => {
                    self.scopes.push(InstanceMap::new());
                }
                SymbolKind::ScopeExit => {
                    // an unbalanced exit clears the global overlay instead
                    if self.scopes.len() > 1 {
                        self.scopes.pop();
                    } else {
                        self.scopes[0].clear();
                    }
                }
                SymbolKind::Foreign(sub) => {
                    let value = sub.generate()?;
                    output.extend_from_slice(&value);
                }
                SymbolKind::Abstract => {
                    return Err(GenerationError::Ungeneratable(sym.name.clone()));
                }
            }
        }
        debug_assert!(captures.is_empty());
        Ok(output)
    }

    /// Record a tracked instance for `@name` lookups and in the innermost
    /// scope overlay for `$name` lookups.
    fn record(&mut self, id: SymbolId, instance: Vec<u8>) {
        self.scopes
            .last_mut()
            .unwrap()
            .entry(id)
            .or_default()
            .push(instance.clone());
        self.instances.entry(id).or_default().push(instance);
    }

    fn pick(&mut self, target: SymbolId) -> Option<Vec<u8>> {
        let instances = self.instances.get(&target)?;
        if instances.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..instances.len());
        Some(instances[index].clone())
    }

    fn pick_scoped(&mut self, target: SymbolId) -> Option<Vec<u8>> {
        for scope in self.scopes.iter().rev() {
            if let Some(instances) = scope.get(&target) {
                if !instances.is_empty() {
                    let index = self.rng.gen_range(0..instances.len());
                    return Some(instances[index].clone());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use crate::error::GenerationError;
    use crate::grammar::Grammar;

    fn gen_str(grammar: &Grammar) -> String {
        String::from_utf8(grammar.generate().unwrap()).unwrap()
    }

    #[test]
    fn test_literal_round_trip() {
        let w = Grammar::parse("root 'hello'").unwrap();
        for _ in 0..10 {
            assert_eq!(gen_str(&w), "hello");
        }
    }

    #[test]
    fn test_basic() {
        let w = Grammar::parse("root    ok\nok      '1'").unwrap();
        assert_eq!(gen_str(&w), "1");

        let w = Grammar::parse(
            "root   a\n\
             a      '1234' /[a-z]/ b\n\
             b      | c\n\
             \t| d\n\
             c      'C'\n\
             d      'D'",
        )
        .unwrap();
        let mut c_hits = 0;
        let mut d_hits = 0;
        for _ in 0..1000 {
            let v = gen_str(&w);
            assert_eq!(v.len(), 6);
            assert!(v.starts_with("1234"));
            let ch = v.as_bytes()[4];
            assert!(ch.is_ascii_lowercase());
            match v.as_bytes()[5] {
                b'C' => c_hits += 1,
                b'D' => d_hits += 1,
                other => panic!("unexpected tail {}", other as char),
            }
        }
        assert!((c_hits as f64 - 500.0).abs() < 80.0, "c_hits = {}", c_hits);
        assert!((d_hits as f64 - 500.0).abs() < 80.0, "d_hits = {}", d_hits);
    }

    #[test]
    fn test_broken_line() {
        let w = Grammar::parse("root 'a' 'b'\\\n     'c'\n").unwrap();
        assert_eq!(gen_str(&w), "abc");
    }

    #[test]
    fn test_quo1() {
        let w = Grammar::parse("root    '\\\\'").unwrap();
        assert_eq!(gen_str(&w), "\\");
        let w = Grammar::parse("root    \"\\\\\"").unwrap();
        assert_eq!(gen_str(&w), "\\");
    }

    #[test]
    fn test_quo2() {
        let w = Grammar::parse("root    '\\''").unwrap();
        assert_eq!(gen_str(&w), "'");
        let w = Grammar::parse("root    \"\\\"\"").unwrap();
        assert_eq!(gen_str(&w), "\"");
    }

    #[test]
    fn test_quo3() {
        let w = Grammar::parse("root    '\\'some'").unwrap();
        assert_eq!(gen_str(&w), "'some");
        let w = Grammar::parse("root    \"\\\"some\"").unwrap();
        assert_eq!(gen_str(&w), "\"some");
    }

    #[test]
    fn test_quo4() {
        let w = Grammar::parse("root    'some\\''").unwrap();
        assert_eq!(gen_str(&w), "some'");
        let w = Grammar::parse("root    \"some\\\"\"").unwrap();
        assert_eq!(gen_str(&w), "some\"");
    }

    #[test]
    fn test_quo5() {
        // the closing quote is escaped, which must raise
        assert!(Grammar::parse(r"root    '\\\\\\\'").is_err());
        assert!(Grammar::parse(r#"root    "\\\\\\\""#).is_err());
    }

    #[test]
    fn test_quo6() {
        let w = Grammar::parse(r"root    '\\\\\\\'\\'").unwrap();
        assert_eq!(gen_str(&w), "\\\\\\'\\");
        let w = Grammar::parse(r#"root    "\\\\\\\"\\""#).unwrap();
        assert_eq!(gen_str(&w), "\\\\\\\"\\");
    }

    #[test]
    fn test_quo7() {
        let w = Grammar::parse("root    \"'some\"").unwrap();
        assert_eq!(gen_str(&w), "'some");
        let w = Grammar::parse("root    '\"some'").unwrap();
        assert_eq!(gen_str(&w), "\"some");
    }

    #[test]
    fn test_quo8() {
        let w = Grammar::parse("root    \"'''\"").unwrap();
        assert_eq!(gen_str(&w), "'''");
        let w = Grammar::parse("root    '\"\"\"'").unwrap();
        assert_eq!(gen_str(&w), "\"\"\"");
    }

    #[test]
    fn test_bin() {
        let w = Grammar::parse("root x'68656c6c6f2c20776f726c6400'").unwrap();
        assert_eq!(w.generate().unwrap(), b"hello, world\0");
    }

    #[test]
    fn test_tyson() {
        let w = Grammar::parse("root   /[0-1]{1}/ \"]\"").unwrap();
        for _ in 0..100 {
            let o = gen_str(&w);
            assert!(o == "0]" || o == "1]", "unexpected output {:?}", o);
        }
    }

    #[test]
    fn test_repeat_bounds() {
        let w = Grammar::parse("root {2,6} 'a'").unwrap();
        let mut seen = [0usize; 7];
        for _ in 0..10000 {
            let o = gen_str(&w);
            assert!(o.len() >= 2 && o.len() <= 6, "bad repeat count {}", o.len());
            seen[o.len()] += 1;
        }
        // the nested draw reaches both bounds
        assert!(seen[2] > 0);
        assert!(seen[6] > 0);
    }

    #[test]
    fn test_plus() {
        let w = Grammar::parse(
            "var     | 'a'\n\
             \t| 'b'\n\
             \t| 'c'\n\
             root    | var\n\
             \t| 'd'",
        )
        .unwrap();
        let mut hits = std::collections::HashMap::new();
        const ITERS: usize = 10000;
        for _ in 0..ITERS {
            *hits.entry(gen_str(&w)).or_insert(0usize) += 1;
        }
        for v in ["a", "b", "c", "d"] {
            let f = *hits.get(v).unwrap_or(&0) as f64 / ITERS as f64;
            assert!((f - 0.25).abs() < 0.03, "{} came out at {}", v, f);
        }
    }

    #[test]
    fn test_tracked() {
        let w = Grammar::parse("root    id ' ' @id\nid      'id' /[0-9]/").unwrap();
        for _ in 0..100 {
            let o = gen_str(&w);
            let (first, second) = o.split_once(' ').unwrap();
            assert_eq!(first.len(), 3);
            assert!(first.starts_with("id"));
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_tracked_before_instance() {
        // a reference before any instance exists contributes nothing
        let w = Grammar::parse("root    @id\nid      'id' /[0-9]/").unwrap();
        assert_eq!(gen_str(&w), "");
    }

    #[test]
    fn test_tracked_through_empty_func() {
        let w = Grammar::builder()
            .source("root    esc(id) @id\nid      'id' /[0-9]/")
            .function("esc", |_| Ok(Vec::new()))
            .build()
            .unwrap();
        for _ in 0..20 {
            let o = gen_str(&w);
            assert_eq!(o.len(), 3);
            assert!(o.starts_with("id"));
        }
    }

    #[test]
    fn test_tracked_func_arg() {
        let w = Grammar::builder()
            .source("root    id '\\n' esc(\"'\" @id \"'\")\nid      'id' /[0-9]/")
            .function("esc", |args| {
                let mut out = Vec::new();
                for b in &args[0] {
                    if *b == b'\'' {
                        out.extend_from_slice(b"\\'");
                    } else {
                        out.push(*b);
                    }
                }
                Ok(out)
            })
            .build()
            .unwrap();
        for _ in 0..20 {
            let o = gen_str(&w);
            let (defn, useref) = o.split_once('\n').unwrap();
            assert!(defn.starts_with("id"));
            assert_eq!(useref, format!("\\'{}\\'", defn));
        }
    }

    #[test]
    fn test_func_nest_tracked() {
        let w = Grammar::builder()
            .source("root   id a(b(@id))\nid     'i'")
            .function("a", |args| {
                let mut out = b"a".to_vec();
                out.extend_from_slice(&args[0]);
                Ok(out)
            })
            .function("b", |args| {
                let mut out = b"b".to_vec();
                out.extend_from_slice(&args[0]);
                Ok(out)
            })
            .build()
            .unwrap();
        assert_eq!(gen_str(&w), "iabi");
    }

    #[test]
    fn test_func_multiple_args() {
        let w = Grammar::builder()
            .source("root    pick('not', @id)\nid      'id' /[0-9]/")
            .function("pick", |args| Ok(args[0].clone()))
            .build()
            .unwrap();
        assert_eq!(gen_str(&w), "not");
    }

    #[test]
    fn test_callback_error_propagates() {
        let w = Grammar::builder()
            .source("root    boom('x')")
            .function("boom", |_| Err("exploded".into()))
            .build()
            .unwrap();
        match w.generate().unwrap_err() {
            GenerationError::Callback { name, source } => {
                assert_eq!(name, "boom");
                assert_eq!(source.to_string(), "exploded");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_rndint() {
        let w = Grammar::parse("root 'n=' rndint(5, 9)").unwrap();
        for _ in 0..100 {
            let o = gen_str(&w);
            let n: i64 = o.strip_prefix("n=").unwrap().parse().unwrap();
            assert!((5..=9).contains(&n));
        }
    }

    #[test]
    fn test_scoped_refs() {
        // inside the scope $id resolves, after the exit only @id still does
        let w = Grammar::parse(
            "root    { id '|' $id } '|' $id '|' @id\n\
             id      /[0-9]{4}/",
        )
        .unwrap();
        for _ in 0..50 {
            let o = gen_str(&w);
            let parts: Vec<&str> = o.split('|').collect();
            assert_eq!(parts.len(), 4);
            assert_eq!(parts[0], parts[1]);
            assert_eq!(parts[2], "");
            assert_eq!(parts[3], parts[0]);
        }
    }

    #[test]
    fn test_unbalanced_scope_exit_clears_global() {
        let w = Grammar::parse(
            "root    id '|' } $id '|' @id\n\
             id      /[0-9]{4}/",
        )
        .unwrap();
        for _ in 0..20 {
            let o = gen_str(&w);
            let parts: Vec<&str> = o.split('|').collect();
            assert_eq!(parts.len(), 3);
            assert_eq!(parts[1], "");
            assert_eq!(parts[2], parts[0]);
        }
    }

    #[test]
    fn test_hard_recursion_limit() {
        let w = Grammar::parse("root 'a' root").unwrap();
        assert!(matches!(
            w.generate().unwrap_err(),
            GenerationError::RunawayRecursion(_)
        ));
    }

    #[test]
    fn test_soft_depth_limit() {
        let w = Grammar::parse("# cfg: max-depth=5\nroot 'a' root").unwrap();
        match w.generate().unwrap_err() {
            GenerationError::DepthLimit { limit, .. } => assert_eq!(limit, 5),
            other => panic!("unexpected error: {}", other),
        }
        // the grammar object stays usable
        let w = Grammar::builder()
            .source("root 'a'")
            .max_depth(5)
            .build()
            .unwrap();
        assert_eq!(gen_str(&w), "a");
    }

    #[test]
    fn test_unknown_start() {
        let w = Grammar::parse("root 'a'").unwrap();
        assert!(matches!(
            w.generate_from("nope").unwrap_err(),
            GenerationError::UnknownStart(_)
        ));
    }

    #[test]
    fn test_seeded_generation_is_reproducible() {
        use rand::{rngs::StdRng, SeedableRng};
        let w = Grammar::parse("root {1,9} /[a-z0-9]/").unwrap();
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        for _ in 0..20 {
            assert_eq!(
                w.generate_with("root", &mut a).unwrap(),
                w.generate_with("root", &mut b).unwrap()
            );
        }
    }

    #[test]
    fn test_foreign_grammar() {
        let w = Grammar::builder()
            .grammar_file("test-data/grammars/outer.gram")
            .build()
            .unwrap();
        for _ in 0..20 {
            let o = gen_str(&w);
            let color = o.strip_prefix("color=").unwrap().strip_suffix('\n').unwrap();
            assert!(["red", "green", "blue"].contains(&color), "got {:?}", color);
        }
    }

    #[test]
    fn test_file_symbol() {
        let w = Grammar::builder()
            .source("root 'x' banner\nbanner &banner.txt")
            .base_dir("test-data/grammars")
            .build()
            .unwrap();
        assert_eq!(gen_str(&w), "xBANNER");
    }
}
