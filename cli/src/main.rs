use std::fs::File;
use std::io;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use jsgf::{BuildOptions, Grammar, TagAssignment, build_fsg, build_fsg_raw, parse_tag_list};

type Err = Box<dyn std::error::Error + 'static>;

/// Compile JSGF grammars to FSGs, or match utterances against them
#[derive(Parser, Debug)]
#[command(name = "jsgf", version, about, long_about = None)]
struct Args {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Write the automaton for a public rule in Sphinx FSG format
  Fsg {
    /// Grammar file
    file: PathBuf,

    /// Rule to build (defaults to the first public rule)
    #[arg(short, long)]
    rule: Option<String>,

    /// Keep epsilon transitions and unreachable states
    #[arg(long)]
    raw: bool,

    /// Language weight applied to every log probability
    #[arg(long, default_value_t = 1.0)]
    lw: f32,

    /// Output file (defaults to stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,
  },

  /// Read utterances from stdin and print every derivation of each
  Deduce {
    /// Grammar file
    file: PathBuf,

    /// Public rule to match against
    #[arg(short, long)]
    rule: String,

    /// Tags to add to every derivation, as a JSON list or object
    #[arg(long)]
    tags: Option<String>,

    /// Directory holding `<source>.dict` vocabulary files
    #[arg(long, requires = "source")]
    vocab: Option<PathBuf>,

    /// Vocabulary to load from the vocabulary directory
    #[arg(long, requires = "vocab")]
    source: Option<String>,
  },
}

fn write_fsg(
  file: PathBuf,
  rule: Option<String>,
  raw: bool,
  lw: f32,
  output: Option<PathBuf>,
) -> Result<(), Err> {
  let g = Grammar::read_from_file(&file, None)?;
  let rule = match rule.or_else(|| g.first_public_rule().map(|r| r.name().to_string())) {
    Some(rule) => rule,
    None => return Err(format!("{} has no public rules", file.display()).into()),
  };

  let opts = BuildOptions {
    language_weight: lw,
  };
  let fsg = if raw {
    build_fsg_raw(&g, &rule, &opts)?
  } else {
    build_fsg(&g, &rule, &opts)?
  };

  match output {
    Some(path) => {
      let mut out = BufWriter::new(File::create(path)?);
      fsg.write_to(&mut out)?;
      out.flush()?;
    }
    None => fsg.write_to(&mut io::stdout().lock())?,
  }
  Ok(())
}

fn deduce(g: &Grammar, rule: &str, utterance: &str, tags: &[TagAssignment]) -> Result<(), Err> {
  let mut deduction = g.deduce_str(rule, utterance, tags)?;

  println!(
    "Found {} derivation{}",
    deduction.len(),
    if deduction.len() == 1 { "" } else { "s" }
  );
  while let Some(json) = deduction.next_json() {
    println!("{}", json?);
  }
  println!();

  Ok(())
}

fn repl(
  file: PathBuf,
  rule: String,
  tags: Option<String>,
  vocab: Option<PathBuf>,
  source: Option<String>,
) -> Result<(), Err> {
  let mut g = Grammar::read_from_file(&file, None)?;
  if let (Some(dir), Some(source)) = (vocab, source) {
    g.load_vocab(dir, &source)?;
  }
  let tags = match tags {
    Some(json) => parse_tag_list(&json)?,
    None => Vec::new(),
  };
  // fail early on a missing or broken rule
  g.deduce_str(&rule, "", &tags)?;

  let mut input = String::new();
  loop {
    print!("> ");
    io::stdout().flush()?;

    match io::stdin().read_line(&mut input) {
      Ok(_) => {
        if input.is_empty() {
          // ctrl+d
          return Ok(());
        }
        deduce(&g, &rule, input.trim(), &tags)?;
        input.clear();
      }
      Err(error) => return Err(error.into()),
    }
  }
}

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
    .with_writer(io::stderr)
    .init();

  let args = Args::parse();
  let result = match args.command {
    Command::Fsg {
      file,
      rule,
      raw,
      lw,
      output,
    } => write_fsg(file, rule, raw, lw, output),
    Command::Deduce {
      file,
      rule,
      tags,
      vocab,
      source,
    } => repl(file, rule, tags, vocab, source),
  };

  if let Err(e) = result {
    eprintln!("error: {}", e);
    process::exit(1);
  }
}
