use clap::Parser;
use rand::{rngs::StdRng, SeedableRng};
use std::fs::File;
use std::io::{stdout, BufWriter, Write};

use starling_fuzz::grammar::Grammar;

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate testcases from a grammar definition", long_about = None)]
struct Args {
    /// Grammar definition file
    grammar: String,

    /// Write testcases here instead of stdout
    #[arg(short, long)]
    output: Option<String>,

    /// Symbol to start generation from
    #[arg(long, default_value_t = String::from("root"))]
    start: String,

    /// Number of testcases to generate
    #[arg(long, short, default_value_t = 1)]
    count: usize,

    /// Seed for the generation RNG
    #[arg(long, short)]
    seed: Option<u64>,

    /// Abort generation beyond this symbol nesting depth
    #[arg(long)]
    max_depth: Option<usize>,
}

fn main() {
    pretty_env_logger::init();
    let args = Args::parse();

    let mut builder = Grammar::builder().grammar_file(&args.grammar);
    if let Some(limit) = args.max_depth {
        builder = builder.max_depth(limit);
    }
    let grammar = builder.build().unwrap();

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut stream: BufWriter<Box<dyn Write>> = BufWriter::new(match &args.output {
        Some(path) => Box::new(File::create(path).unwrap()),
        None => Box::new(stdout()),
    });

    for _ in 0..args.count {
        let testcase = grammar.generate_with(&args.start, &mut rng).unwrap();
        stream.write_all(&testcase).unwrap();
    }

    stream.flush().unwrap();
}
