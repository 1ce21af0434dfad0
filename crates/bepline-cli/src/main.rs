#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::error::Error;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use rayon::prelude::{IntoParallelRefIterator, ParallelIterator};

use bepline_config::Settings;
use bepline_engine::{
    cache_file_name, fetcher_for, load_json, parse_build_flags, parse_test_results, save_json,
    ArtifactParser, ArtifactResolver, DefaultArtifactParser, OutputArtifact, OutputPaths,
    ParsedBepOutput, RemoteOutputArtifacts, StateRecord, TargetSet, TrackedOutputArtifacts,
};
use bepline_stream::EventStreamReader;

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Debug, Parser)]
#[command(name = "bepline", about = "Inspect build event streams and track build outputs")]
#[command(version)]
struct Cli {
    /// Path to the settings file
    #[arg(long, global = true, default_value = "bepline.toml")]
    config: PathBuf,
    /// Log engine decisions to stderr
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the output artifacts of one or more event streams
    Artifacts {
        /// Event stream files (length-delimited, or JSON lines when named *.json)
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Only artifacts reachable from this output group (repeatable)
        #[arg(long = "group", conflicts_with = "target")]
        groups: Vec<String>,
        /// Only artifacts produced directly by this target
        #[arg(long)]
        target: Option<String>,
        /// Only artifacts whose relative path matches this glob
        #[arg(long)]
        glob: Option<String>,
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show test results recorded in an event stream
    Tests {
        /// Event stream file
        file: PathBuf,
    },
    /// Show the options a build was invoked with
    Flags {
        /// Event stream file
        file: PathBuf,
    },
    /// Merge a build's outputs into the tracked state
    Track {
        /// Event stream file
        file: PathBuf,
        /// State file (defaults to [state].file from the settings)
        #[arg(long)]
        state: Option<PathBuf>,
        /// Prune outputs not owned by these targets (repeatable)
        #[arg(long)]
        keep: Vec<String>,
    },
    /// Find a tracked output by relative, exec-root or genfiles path
    Lookup {
        /// Path to look up
        path: String,
        /// State file (defaults to [state].file from the settings)
        #[arg(long)]
        state: Option<PathBuf>,
        /// Write the artifact contents to stdout
        #[arg(long)]
        cat: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = Settings::from_path(&cli.config)
        .map_err(Box::<dyn Error>::from)
        .and_then(|settings| run(&settings, cli.command));

    if let Err(msg) = result {
        eprintln!("error: {msg}");
        process::exit(1);
    }
}

/// Log to stderr; `RUST_LOG` overrides the level chosen by `--verbose`.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(settings: &Settings, command: Command) -> CliResult {
    match command {
        Command::Artifacts {
            files,
            groups,
            target,
            glob,
            json,
        } => cmd_artifacts(settings, &files, &groups, target.as_deref(), glob.as_deref(), json),
        Command::Tests { file } => cmd_tests(settings, &file),
        Command::Flags { file } => cmd_flags(settings, &file),
        Command::Track { file, state, keep } => {
            let state = state.unwrap_or_else(|| settings.state.file.clone());
            let summary = track(settings, &file, &state, &keep)?;
            eprintln!(
                "    Tracked {} artifact(s) for {} target set(s), {} remote",
                summary.artifacts, summary.target_sets, summary.remote
            );
            Ok(())
        }
        Command::Lookup { path, state, cat } => {
            let state = state.unwrap_or_else(|| settings.state.file.clone());
            cmd_lookup(settings, &path, &state, cat)
        }
    }
}

/// Parse every stream on the rayon pool, each with its own builder.
fn parse_all(settings: &Settings, files: &[PathBuf]) -> Result<Vec<ParsedBepOutput>, Box<dyn Error>> {
    let parsed: Vec<Result<ParsedBepOutput, String>> = files
        .par_iter()
        .map(|file| {
            ParsedBepOutput::parse_path(file, &settings.stream)
                .map_err(|e| format!("cannot parse {}: {e}", file.display()))
        })
        .collect();
    let mut outputs = Vec::with_capacity(parsed.len());
    for result in parsed {
        outputs.push(result?);
    }
    Ok(outputs)
}

/// Select artifacts across several parsed streams, dropping keys already
/// listed by an earlier stream.
fn select_artifacts(
    outputs: &[ParsedBepOutput],
    parser: &dyn ArtifactParser,
    groups: &[String],
    target: Option<&str>,
    filter: &dyn Fn(&str) -> bool,
) -> Vec<OutputArtifact> {
    let group_names: Vec<&str> = groups.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let mut selected = Vec::new();
    for output in outputs {
        let resolver = ArtifactResolver::new(output, parser);
        let artifacts = match target {
            Some(label) => resolver.artifacts_for_target(label, filter),
            None if !group_names.is_empty() => resolver.artifacts_for_output_groups(&group_names, filter),
            None => resolver.all_artifacts(filter),
        };
        for artifact in artifacts {
            if seen.insert(artifact.key()) {
                selected.push(artifact);
            }
        }
    }
    selected
}

fn describe(artifact: &OutputArtifact) -> String {
    match artifact {
        OutputArtifact::Local(local) => format!(
            "{}\t{}\t{}",
            artifact.configuration_mnemonic(),
            artifact.relative_path(),
            local.path().display()
        ),
        OutputArtifact::Remote(remote) => format!(
            "{}\t{}\tremote:{} ({} bytes, cached as {})",
            artifact.configuration_mnemonic(),
            artifact.relative_path(),
            remote.hash_id(),
            remote.length(),
            cache_file_name(remote)
        ),
    }
}

fn cmd_artifacts(
    settings: &Settings,
    files: &[PathBuf],
    groups: &[String],
    target: Option<&str>,
    pattern: Option<&str>,
    json: bool,
) -> CliResult {
    let pattern = pattern.map(glob::Pattern::new).transpose()?;
    let filter = |path: &str| pattern.as_ref().is_none_or(|p| p.matches(path));

    let outputs = parse_all(settings, files)?;
    let parser = DefaultArtifactParser::from_settings(settings);
    let artifacts = select_artifacts(&outputs, &parser, groups, target, &filter);

    if json {
        let records: Vec<_> = artifacts.iter().map(OutputArtifact::to_record).collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        for artifact in &artifacts {
            println!("{}", describe(artifact));
        }
    }
    eprintln!(
        "    Found {} artifact(s) in {} stream(s)",
        artifacts.len(),
        outputs.len()
    );
    Ok(())
}

fn cmd_tests(settings: &Settings, file: &Path) -> CliResult {
    let reader = EventStreamReader::open(file, &settings.stream)?;
    let results = parse_test_results(reader)?;
    for result in &results {
        match &result.target_kind {
            Some(kind) => println!("{:<10} {} ({kind})", result.status, result.label),
            None => println!("{:<10} {}", result.status, result.label),
        }
        for xml in &result.output_xml_files {
            println!("           {}", xml.display());
        }
    }
    let failed = results.iter().filter(|r| !r.status.is_success()).count();
    eprintln!("    {} test target(s), {failed} not passing", results.len());
    Ok(())
}

fn cmd_flags(settings: &Settings, file: &Path) -> CliResult {
    let reader = EventStreamReader::open(file, &settings.stream)?;
    let flags = parse_build_flags(reader)?;
    println!("startup: {}", flags.startup_options.join(" "));
    println!("command: {}", flags.cmd_line.join(" "));
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
struct TrackSummary {
    artifacts: usize,
    target_sets: usize,
    remote: usize,
}

/// Group a stream's artifacts by the exact set of top-level targets that
/// reach them. Artifacts no target reaches are not tracked.
fn outputs_by_target_set(
    output: &ParsedBepOutput,
    parser: &dyn ArtifactParser,
) -> BTreeMap<TargetSet, Vec<OutputArtifact>> {
    let mut grouped: BTreeMap<TargetSet, Vec<OutputArtifact>> = BTreeMap::new();
    for data in ArtifactResolver::new(output, parser).full_artifact_data().into_values() {
        if data.top_level_targets.is_empty() {
            continue;
        }
        grouped
            .entry(data.top_level_targets)
            .or_default()
            .push(data.artifact);
    }
    grouped
}

fn load_state(
    settings: &Settings,
    state: &Path,
) -> Result<(TrackedOutputArtifacts, RemoteOutputArtifacts), Box<dyn Error>> {
    let record: StateRecord = load_json(state)?;
    let fetcher = fetcher_for(&settings.remote);
    let tracked = TrackedOutputArtifacts::from_record(record.tracked, &fetcher)?;
    let remote = RemoteOutputArtifacts::from_record(record.remote, &fetcher);
    Ok((tracked, remote))
}

fn track(settings: &Settings, file: &Path, state: &Path, keep: &[String]) -> Result<TrackSummary, Box<dyn Error>> {
    let output = ParsedBepOutput::parse_path(file, &settings.stream)?;
    let parser = DefaultArtifactParser::from_settings(settings);
    let new_outputs = outputs_by_target_set(&output, &parser);

    let (tracked, remote) = load_state(settings, state)?;
    let mut tracked = tracked.append_new_outputs(&new_outputs);
    if !keep.is_empty() {
        let keep: TargetSet = keep.iter().cloned().collect();
        tracked = tracked.remove_untracked_outputs(&keep);
    }
    let remote = remote
        .append_new_outputs(new_outputs.values().flatten())
        .remove_untracked_outputs(|path| tracked.owning_targets(path).is_some());

    save_json(
        state,
        &StateRecord {
            tracked: tracked.to_record(),
            remote: remote.to_record(),
        },
    )?;

    let target_sets: BTreeSet<&TargetSet> = tracked
        .artifacts()
        .filter_map(|a| tracked.owning_targets(a.relative_path()))
        .collect();
    Ok(TrackSummary {
        artifacts: tracked.len(),
        target_sets: target_sets.len(),
        remote: remote.len(),
    })
}

/// Resolve `path` against the tracked state: as an output-root relative path,
/// then an exec-root path, then a genfiles-relative path, then in the remote
/// store.
fn lookup(
    paths: &OutputPaths,
    tracked: &TrackedOutputArtifacts,
    remote: &RemoteOutputArtifacts,
    path: &str,
) -> Option<OutputArtifact> {
    tracked
        .find_output_artifact(paths, path)
        .or_else(|| tracked.find_output_artifact_for_exec_path(paths, path))
        .or_else(|| tracked.resolve_genfiles_path(paths, path))
        .cloned()
        .or_else(|| {
            remote
                .find_remote_output(paths, path)
                .cloned()
                .map(OutputArtifact::Remote)
        })
}

fn cmd_lookup(settings: &Settings, path: &str, state: &Path, cat: bool) -> CliResult {
    let (tracked, remote) = load_state(settings, state)?;
    let paths = OutputPaths::new(&settings.paths);
    let artifact = lookup(&paths, &tracked, &remote, path)
        .ok_or_else(|| format!("no tracked output matches `{path}`"))?;

    if cat {
        let mut contents = artifact.input_stream()?;
        let mut stdout = std::io::stdout().lock();
        std::io::copy(&mut contents, &mut stdout)?;
        stdout.flush()?;
        return Ok(());
    }

    println!("{}", describe(&artifact));
    if let Some(owners) = tracked.owning_targets(artifact.relative_path()) {
        for owner in owners {
            println!("  owned by {owner}");
        }
    }
    Ok(())
}
