use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ct_runner::{
    ExperimentConfig, LedgerSummary, RandomSequence, Session, StimulusGrid, SubjectLock, Trail,
    TrialRandomizer,
};

#[derive(Parser)]
#[command(name = "ct", version = "0.3.0", about = "Colortilt session ledger and randomizer")]
struct Cli {
    /// Experiment descriptor; searched in the usual places when omitted
    #[arg(long, global = true, env = "CT_EXPERIMENT")]
    experiment: Option<PathBuf>,

    #[arg(long, global = true, default_value = ct_runner::DEFAULT_EXPERIMENT_NAME)]
    name: String,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the experiment parameters and resolved directories
    Info {
        #[arg(long)]
        json: bool,
    },
    /// List subjects that have a session file
    Subjects {
        #[arg(long)]
        json: bool,
    },
    /// List the sessions defined for a subject
    Sessions {
        subject: String,
        #[arg(long)]
        json: bool,
    },
    /// List the completed runs of a subject
    Trails {
        subject: String,
        #[arg(long)]
        json: bool,
    },
    /// Show the next session to run
    Next {
        subject: String,
        #[arg(long)]
        json: bool,
    },
    /// Done/todo counts per stimulus set
    Status {
        subject: String,
        #[arg(long)]
        json: bool,
    },
    /// Generate a block-constrained randomization sequence
    Rndgen {
        number: usize,
        #[arg(short = 'B', long, default_value_t = 1)]
        blocks: usize,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(short = 'F', long)]
        file: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Generate a block-structured stimulus table
    Stimgen {
        #[arg(short = 'f', long, default_value_t = 16)]
        foregrounds: usize,
        #[arg(short = 'b', long, default_value_t = 8)]
        backgrounds: usize,
        #[arg(short = 's', long, value_delimiter = ',', default_value = "40,60")]
        sizes: Vec<f32>,
        #[arg(long, default_value = "r")]
        sides: String,
        #[arg(short = 'N', long, default_value_t = 2)]
        blocks: usize,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(short = 'F', long)]
        file: Option<PathBuf>,
    },
    /// Record the responses of a run as a response artifact
    Record {
        subject: String,
        /// Response CSV from the presentation loop ("-" for stdin)
        #[arg(long)]
        responses: PathBuf,
        /// Session to record; defaults to the next outstanding one
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(&cli);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn load_experiment(cli: &Cli) -> Result<ExperimentConfig> {
    let exp = ExperimentConfig::discover(cli.experiment.as_deref(), &cli.name)?;
    info!(path = %exp.source_file.display(), "loaded experiment");
    Ok(exp)
}

fn run_command(cli: &Cli) -> Result<Option<Value>> {
    match &cli.command {
        Commands::Info { json } => {
            let exp = load_experiment(cli)?;
            if *json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "info",
                    "experiment": experiment_to_json(&exp)?,
                })));
            }
            print_experiment(&exp)?;
        }
        Commands::Subjects { json } => {
            let exp = load_experiment(cli)?;
            let subjects = ct_runner::subjects(&exp)?;
            if *json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "subjects",
                    "subjects": subjects,
                })));
            }
            for s in subjects {
                println!("{}", s);
            }
        }
        Commands::Sessions { subject, json } => {
            let exp = load_experiment(cli)?;
            let sessions = ct_runner::list_sessions(&exp, subject.as_str())?;
            if *json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "sessions",
                    "subject": subject,
                    "sessions": sessions.iter().map(Session::name).collect::<Vec<_>>(),
                })));
            }
            for s in &sessions {
                println!("{}", s);
            }
        }
        Commands::Trails { subject, json } => {
            let exp = load_experiment(cli)?;
            let trails = ct_runner::list_completed(&exp, subject.as_str())?;
            if *json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "trails",
                    "subject": subject,
                    "trails": trails.iter().map(Trail::name).collect::<Vec<_>>(),
                })));
            }
            for t in &trails {
                println!("{}", t);
            }
        }
        Commands::Next { subject, json } => {
            let exp = load_experiment(cli)?;
            let next = ct_runner::next_session(&exp, subject.as_str())?;
            if *json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "next",
                    "subject": subject,
                    "session": next.as_ref().map(|s| session_to_json(&exp, s)).transpose()?,
                })));
            }
            match next {
                Some(s) => {
                    println!("session: {}", s);
                    println!("stim_file: {}", exp.stim_file(&s)?.display());
                    println!("rnd_file: {}", exp.rnd_file(&s)?.display());
                }
                None => println!("session: none"),
            }
        }
        Commands::Status { subject, json } => {
            let exp = load_experiment(cli)?;
            let summary = ct_runner::summarize(&exp, subject.as_str())?;
            if *json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "subject": subject,
                    "status": summary_to_json(&summary),
                })));
            }
            print_summary(&summary);
        }
        Commands::Rndgen {
            number,
            blocks,
            seed,
            file,
            json,
        } => {
            let randomizer = TrialRandomizer::new(*number, *blocks)?;
            let seed = ct_runner::resolve_seed(*seed);
            let sequence = randomizer.generate(seed);
            if let Some(path) = file {
                sequence.write(path)?;
            }
            if *json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "rndgen",
                    "seed": seed,
                    "blocks": blocks,
                    "sequence": sequence.indices(),
                    "file": file.as_ref().map(|p| p.display().to_string()),
                })));
            }
            if file.is_none() {
                println!("{}", sequence.to_rnd_string());
            }
        }
        Commands::Stimgen {
            foregrounds,
            backgrounds,
            sizes,
            sides,
            blocks,
            seed,
            file,
        } => {
            let grid = StimulusGrid {
                n_fg: *foregrounds,
                n_bg: *backgrounds,
                sizes: sizes.clone(),
                sides: sides.chars().collect(),
                blocks: *blocks,
            };
            let seed = ct_runner::resolve_seed(*seed);
            let table = grid.generate(&mut ct_runner::seeded_rng(seed))?;
            match file {
                Some(path) => {
                    ct_runner::write_stimuli(path, &table, Some(grid.block_size()))?;
                    println!("wrote: {}", path.display());
                    println!(
                        "next: ct rndgen {} -B {} --seed {}",
                        table.len(),
                        grid.blocks,
                        seed
                    );
                }
                None => print!("{}", ct_runner::stimuli_to_csv(&table, Some(grid.block_size()))),
            }
        }
        Commands::Record {
            subject,
            responses,
            session,
            json,
        } => {
            let exp = load_experiment(cli)?;
            let _lock = SubjectLock::acquire(&exp, subject.as_str())?;
            let session = match session {
                Some(raw) => Session::from_string(raw)?,
                None => ct_runner::next_session(&exp, subject.as_str())?
                    .ok_or_else(|| anyhow!("no outstanding session for subject {}", subject))?,
            };
            let rnd_path = exp.rnd_file(&session)?;
            let expected = RandomSequence::read(&rnd_path)
                .with_context(|| format!("reading sequence for {}", session))?
                .len();
            let recorded = read_response_input(responses)?;
            if recorded.len() > expected {
                return Err(anyhow!(
                    "{} responses recorded but sequence {} has only {} trials",
                    recorded.len(),
                    rnd_path.display(),
                    expected
                ));
            }
            let path =
                ct_runner::write_responses(&exp, subject.as_str(), &session, &recorded, expected)?;
            if *json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "record",
                    "subject": subject,
                    "session": session.name(),
                    "responses": recorded.len(),
                    "expected": expected,
                    "complete": recorded.len() >= expected,
                    "file": path.display().to_string(),
                })));
            }
            println!("session: {}", session);
            println!("responses: {}/{}", recorded.len(), expected);
            println!("wrote: {}", path.display());
        }
    }
    Ok(None)
}

fn read_response_input(path: &Path) -> Result<Vec<ct_runner::Response>> {
    if path == Path::new("-") {
        let mut raw = String::new();
        std::io::stdin().read_to_string(&mut raw)?;
        return Ok(ct_runner::parse_responses(&raw, Path::new("<stdin>"))?);
    }
    Ok(ct_runner::read_responses(path)?)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Info { json }
        | Commands::Subjects { json }
        | Commands::Sessions { json, .. }
        | Commands::Trails { json, .. }
        | Commands::Next { json, .. }
        | Commands::Status { json, .. }
        | Commands::Rndgen { json, .. }
        | Commands::Record { json, .. } => *json,
        Commands::Stimgen { .. } => false,
    }
}

fn experiment_to_json(exp: &ExperimentConfig) -> Result<Value> {
    Ok(json!({
        "source_file": exp.source_file.display().to_string(),
        "contrast_fg": exp.c_fg,
        "contrast_bg": exp.c_bg,
        "cursor_gain": exp.cursor_gain,
        "data_dir": exp.data_dir()?.display().to_string(),
        "stim_dir": exp.stim_dir()?.display().to_string(),
        "sess_dir": exp.sess_dir()?.display().to_string(),
    }))
}

fn session_to_json(exp: &ExperimentConfig, session: &Session) -> Result<Value> {
    Ok(json!({
        "name": session.name(),
        "stim": session.stim,
        "rnd": session.rnd,
        "stim_file": exp.stim_file(session)?.display().to_string(),
        "rnd_file": exp.rnd_file(session)?.display().to_string(),
    }))
}

fn summary_to_json(summary: &LedgerSummary) -> Value {
    let by_stim: serde_json::Map<String, Value> = summary
        .by_stim
        .iter()
        .map(|(stim, p)| (stim.clone(), json!({ "done": p.done, "todo": p.todo })))
        .collect();
    json!({
        "by_stim": by_stim,
        "deficit": summary.total_deficit(),
        "complete": summary.is_complete(),
    })
}

fn print_experiment(exp: &ExperimentConfig) -> Result<()> {
    println!("Color Tilt Experiment");
    println!("experiment: {}", exp.source_file.display());
    println!("contrast_bg: {}", exp.c_bg);
    println!("contrast_fg: {}", exp.c_fg);
    println!("cursor_gain: {}", exp.cursor_gain);
    println!("data_dir: {}", exp.data_dir()?.display());
    println!("stim_dir: {}", exp.stim_dir()?.display());
    println!("sess_dir: {}", exp.sess_dir()?.display());
    Ok(())
}

fn print_summary(summary: &LedgerSummary) {
    for (stim, p) in &summary.by_stim {
        let mark = if p.deficit() > 0 { "*" } else { "\u{2713}" };
        println!("{}: {}/{} {}", stim, p.done, p.todo, mark);
    }
    println!("deficit: {}", summary.total_deficit());
}
