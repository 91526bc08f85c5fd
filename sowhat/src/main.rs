use std::{
    collections::{BTreeSet, HashSet},
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sowhat::{Grammar, Lexer, Record, Settings, Token, assemble};

const NOTE_EXTENSIONS: [&str; 2] = ["sw", "sowhat"];

#[derive(Debug, Parser)]
#[command(
    name = "sowhat",
    about = "Tokenize and parse SoWhat notes",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// JSON settings file with custom TODO/DONE keywords.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the token stream of each input.
    Tokenize(TokenizeArgs),

    /// Assemble each input into a structured record.
    Parse(ParseArgs),
}

#[derive(Debug, Args)]
struct TokenizeArgs {
    /// Note files, directories containing notes, or `-` for stdin.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Note files, directories containing notes, or `-` for stdin.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
    /// Treat every non-empty line as its own note.
    #[arg(long)]
    lines: bool,
}

/// Text read from one input, labelled for output.
#[derive(Debug)]
struct Source {
    label: String,
    text: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;
    init_logging(verbose);

    let settings = match &cli.config {
        Some(path) => {
            if verbose {
                eprintln!("Loading settings from {:?}", path);
            }
            Settings::load(path).with_context(|| format!("loading settings {:?}", path))?
        }
        None => Settings::default(),
    };
    let grammar = Grammar::new(settings).context("building grammar")?;

    match cli.command {
        Commands::Tokenize(args) => handle_tokenize(args, &grammar, verbose),
        Commands::Parse(args) => handle_parse(args, &grammar, verbose),
    }
}

fn handle_tokenize(args: TokenizeArgs, grammar: &Grammar, verbose: bool) -> Result<()> {
    let TokenizeArgs { inputs, json } = args;
    let sources = read_sources(&inputs, verbose)?;
    let lexer = Lexer::new(grammar);

    let tokenized: Vec<(String, Vec<Token>)> = sources
        .into_iter()
        .map(|source| {
            if verbose {
                eprintln!("Tokenizing {}", source.label);
            }
            (source.label, lexer.tokenize(&source.text))
        })
        .collect();

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            source: &'a str,
            tokens: &'a [Token],
        }

        let payload: Vec<JsonOutput<'_>> = tokenized
            .iter()
            .map(|(source, tokens)| JsonOutput { source, tokens })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (source, tokens) in &tokenized {
            if tokenized.len() > 1 {
                println!("== {} ==", source);
            }
            for token in tokens {
                println!(
                    "{}:{}\t{}\t{:?}",
                    token.line, token.col, token.kind, token.text
                );
            }
        }
    }
    Ok(())
}

fn handle_parse(args: ParseArgs, grammar: &Grammar, verbose: bool) -> Result<()> {
    let ParseArgs {
        inputs,
        json,
        lines,
    } = args;
    let sources = read_sources(&inputs, verbose)?;
    let lexer = Lexer::new(grammar);

    let mut parsed = Vec::new();
    for source in &sources {
        if verbose {
            eprintln!("Parsing {}", source.label);
        }
        for (line, note) in notes(&source.text, lines) {
            let record = assemble(&lexer.tokenize(note));
            if verbose && record.has_errors() {
                eprintln!(
                    "{}:{} has {} error(s)",
                    source.label,
                    line,
                    record.error.len()
                );
            }
            parsed.push((source.label.as_str(), line, record));
        }
    }

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            source: &'a str,
            line: usize,
            record: &'a Record,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(source, line, record)| JsonOutput {
                source,
                line: *line,
                record,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (source, line, record)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {}:{} ==", source, line);
            }
            println!("{:#?}", record);
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}

/// Splits `text` into notes paired with their 1-based starting line.
fn notes(text: &str, by_line: bool) -> Vec<(usize, &str)> {
    if !by_line {
        return vec![(1, text)];
    }
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| (idx + 1, line))
        .collect()
}

fn read_sources(inputs: &[PathBuf], verbose: bool) -> Result<Vec<Source>> {
    let mut sources = Vec::new();
    let mut paths = Vec::new();
    for input in inputs {
        if input.as_os_str() == "-" {
            let mut text = String::new();
            io::stdin()
                .read_to_string(&mut text)
                .context("reading stdin")?;
            sources.push(Source {
                label: "<stdin>".to_string(),
                text,
            });
        } else {
            paths.push(input.clone());
        }
    }

    if !paths.is_empty() {
        let expanded = expand_inputs(&paths, verbose)?;
        if expanded.is_empty() && sources.is_empty() {
            anyhow::bail!("no note files found in the provided inputs");
        }
        for path in expanded {
            let text =
                fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
            sources.push(Source {
                label: path.display().to_string(),
                text,
            });
        }
    }
    Ok(sources)
}

fn is_note_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| NOTE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

fn collect_note_files(dir: &Path, verbose: bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(dir, &mut out, &mut visited, verbose)?;
    out.sort();
    out.dedup();
    Ok(out)
}

/// Explicitly named files are taken as-is; directories contribute only note files.
fn expand_inputs(paths: &[PathBuf], verbose: bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            if verbose {
                eprintln!("Scanning directory {:?}", canonical);
            }
            for file in collect_note_files(&canonical, verbose)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if verbose {
                eprintln!("Adding file {:?}", canonical);
            }
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn visit_dir(
    path: &Path,
    out: &mut Vec<PathBuf>,
    visited: &mut HashSet<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        if verbose {
            eprintln!("Visiting directory {:?}", canonical);
        }
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited, verbose)?;
        }
    } else if metadata.is_file() && is_note_file(&canonical) {
        if verbose {
            eprintln!("Found note file {:?}", canonical);
        }
        out.push(canonical);
    }
    Ok(())
}

/* ------------------------------- Logging ------------------------------- */

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging(verbose: bool) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn expand_inputs_filters_directories_by_extension() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        let nested = root.join("2024");
        fs::create_dir_all(&nested).expect("mkdir nested");
        fs::write(root.join("a.sw"), "#a").expect("write a");
        fs::write(nested.join("b.sowhat"), "#b").expect("write b");
        fs::write(root.join("readme.md"), "# readme").expect("write readme");

        let found = expand_inputs(&[root.to_path_buf()], false).expect("expand");
        let names: Vec<_> = found
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"a.sw"));
        assert!(names.contains(&"b.sowhat"));
    }

    #[test]
    fn explicit_files_are_kept_once() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let note = tmp.path().join("today.txt");
        fs::write(&note, "TODO call").expect("write note");

        let found = expand_inputs(&[note.clone(), note.clone()], false).expect("expand");
        assert_eq!(found, vec![fs::canonicalize(&note).expect("canonical")]);
    }

    #[test]
    fn read_sources_fails_on_missing_path() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let missing = tmp.path().join("nope.sw");
        assert!(read_sources(&[missing], false).is_err());
    }

    #[test]
    fn read_sources_rejects_directory_without_notes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("x.md"), "x").expect("write");
        assert!(read_sources(&[tmp.path().to_path_buf()], false).is_err());
    }

    #[test]
    fn notes_split_on_non_empty_lines() {
        let text = "2020-01-20 foo\n\n#bar\n";
        assert_eq!(notes(text, true), vec![(1, "2020-01-20 foo"), (3, "#bar")]);
        assert_eq!(notes(text, false), vec![(1, text)]);
    }

    #[test]
    fn file_round_trip_through_parser() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let note = tmp.path().join("n.sw");
        fs::write(&note, "/work TODO ship #release").expect("write note");

        let sources = read_sources(&[note], false).expect("read");
        let grammar = Grammar::new(Settings::default()).expect("grammar");
        let record = assemble(&Lexer::new(&grammar).tokenize(&sources[0].text));
        assert!(record.todo.is_some());
        assert_eq!(record.body, "ship #release");
        assert_eq!(record.folder[0].value, "/work");
    }
}
