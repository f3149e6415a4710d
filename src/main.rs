use clap::{error::ErrorKind, Args, CommandFactory, Parser, Subcommand, ValueEnum};
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use std::{error::Error, io, path::PathBuf, sync::Arc};
use tingxie::{
    catalog::{Catalog, CatalogScope, JsonCatalog},
    clock::SystemClock,
    config::{Config, ConfigStore, FileConfigStore},
    logging,
    selector::{SelectionFilter, SelectionMode},
    session::TaskSource,
    stats::DateRange,
    store::Store,
    DictationEngine, LearnerId, SessionId, TaskId, WordId,
};

/// spaced repetition dictation practice for primary school vocabulary
#[derive(Parser, Debug)]
#[clap(
    version,
    about,
    long_about = "Dictation practice with spaced repetition: picks the words a learner is due to review, runs dictation sessions and tracks per-word mastery. Every command prints JSON."
)]
pub struct Cli {
    /// progress database (overrides the config file)
    #[clap(long, global = true)]
    db: Option<PathBuf>,

    /// JSON word catalog (overrides the config file; defaults to the bundled sample)
    #[clap(long, global = true)]
    catalog: Option<PathBuf>,

    /// config file to read instead of the per-user one
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct ScopeArgs {
    #[clap(long, default_value_t = 1)]
    grade: u8,
    #[clap(long, default_value_t = 1)]
    semester: u8,
    #[clap(long, default_value = "renjiaoban")]
    edition: String,
}

impl ScopeArgs {
    fn scope(&self) -> CatalogScope {
        CatalogScope::new(self.grade, self.semester, self.edition.clone())
    }
}

#[derive(Args, Debug, Clone)]
struct SelectArgs {
    #[clap(long)]
    learner: LearnerId,
    #[clap(flatten)]
    scope: ScopeArgs,
    #[clap(long, value_enum, default_value_t = ModeArg::Due)]
    mode: ModeArg,
    /// textbook unit, required by the unit and blend modes
    #[clap(long)]
    unit: Option<u32>,
    /// number of words (defaults to the configured word count)
    #[clap(short = 'n', long)]
    count: Option<usize>,
    /// only words of this kind (识字, 写字, 词语)
    #[clap(long)]
    kind: Option<String>,
    /// only words answered wrong before (also set by `wrong_words_only` in the config)
    #[clap(long)]
    wrong_only: bool,
    /// seed the draw for a reproducible selection
    #[clap(long)]
    seed: Option<u64>,
}

#[derive(Debug, Copy, Clone, ValueEnum, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
enum ModeArg {
    Due,
    Unit,
    Blend,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
enum SourceArg {
    Unit,
    Smart,
}

impl From<SourceArg> for TaskSource {
    fn from(source: SourceArg) -> Self {
        match source {
            SourceArg::Unit => TaskSource::Unit,
            SourceArg::Smart => TaskSource::Smart,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// print the effective configuration
    Config {
        /// write it back to the config file
        #[clap(long)]
        save: bool,
    },
    #[clap(flatten)]
    Practice(PracticeCommand),
}

#[derive(Subcommand, Debug)]
enum PracticeCommand {
    /// pick words for practice without creating anything
    Select(SelectArgs),
    /// pick words and freeze them into a new task
    Plan(SelectArgs),
    /// create a task from explicit word ids
    CreateTask {
        #[clap(long)]
        learner: LearnerId,
        #[clap(long = "word", required = true, num_args = 1..)]
        words: Vec<WordId>,
        #[clap(long, value_enum, default_value_t = SourceArg::Unit)]
        source: SourceArg,
    },
    /// show a task and its words
    Task {
        #[clap(long)]
        task: TaskId,
    },
    /// create and start a session for a task
    Start {
        #[clap(long)]
        task: TaskId,
    },
    /// create a pending session for a task
    CreateSession {
        #[clap(long)]
        task: TaskId,
    },
    /// start a pending session
    StartPending {
        #[clap(long)]
        session: SessionId,
    },
    /// the session currently running for a task
    Active {
        #[clap(long)]
        task: TaskId,
    },
    /// submit (or resubmit) the answer for one word
    Answer {
        #[clap(long)]
        session: SessionId,
        #[clap(long)]
        word: WordId,
        #[clap(long)]
        text: String,
        /// seconds spent on this word
        #[clap(long, default_value_t = 0)]
        secs: u32,
    },
    /// finish a session and update mastery
    Complete {
        #[clap(long)]
        session: SessionId,
    },
    /// abandon a session without touching mastery
    Interrupt {
        #[clap(long)]
        session: SessionId,
    },
    /// record a corrected verdict for an answer of a completed session
    Correct {
        #[clap(long)]
        session: SessionId,
        #[clap(long)]
        word: WordId,
        #[clap(long)]
        text: String,
        #[clap(long)]
        reason: Option<String>,
    },
    /// show a session with its answers and corrections
    Show {
        #[clap(long)]
        session: SessionId,
    },
    /// mastery state of one word, or of every word the learner has seen
    Mastery {
        #[clap(long)]
        learner: LearnerId,
        #[clap(long)]
        word: Option<WordId>,
    },
    /// accuracy overview with daily buckets
    Stats {
        #[clap(long)]
        learner: LearnerId,
        /// number of days ending today
        #[clap(long, default_value_t = 7)]
        days: u32,
        /// print the daily buckets as CSV instead of JSON
        #[clap(long)]
        csv: bool,
    },
    /// error types and difficult words
    Errors {
        #[clap(long)]
        learner: LearnerId,
        #[clap(long, default_value_t = 30)]
        days: u32,
    },
    /// words of one unit the learner got wrong
    UnitErrors {
        #[clap(long)]
        learner: LearnerId,
        #[clap(flatten)]
        scope: ScopeArgs,
        #[clap(long)]
        unit: u32,
        #[clap(long)]
        lesson: Option<u32>,
    },
    /// learned and mastered words per word kind
    Progress {
        #[clap(long)]
        learner: LearnerId,
        #[clap(flatten)]
        scope: ScopeArgs,
    },
}

impl SelectArgs {
    fn mode(&self) -> SelectionMode {
        let unit = || match self.unit {
            Some(unit) => unit,
            None => {
                let mut cmd = Cli::command();
                cmd.error(
                    ErrorKind::MissingRequiredArgument,
                    format!("--unit is required with --mode {}", self.mode),
                )
                .exit()
            }
        };
        match self.mode {
            ModeArg::Due => SelectionMode::Due,
            ModeArg::Unit => SelectionMode::Unit { unit: unit() },
            ModeArg::Blend => SelectionMode::Blend { unit: unit() },
        }
    }

    fn select(&self, engine: &DictationEngine, config: &Config) -> tingxie::Result<Vec<WordId>> {
        let mode = self.mode();
        let count = self.count.unwrap_or(config.default_word_count);
        let scope = self.scope.scope();
        let filter = SelectionFilter {
            kind: self.kind.clone(),
            wrong_only: self.wrong_only || config.wrong_words_only,
        };
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        engine.select_filtered_words_with_rng(self.learner, &scope, &mode, &filter, count, &mut rng)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_engine(config: &Config) -> Result<DictationEngine, Box<dyn Error>> {
    let catalog: Arc<dyn Catalog> = match &config.catalog_path {
        Some(path) => Arc::new(JsonCatalog::from_path(path)?),
        None => Arc::new(JsonCatalog::bundled()?),
    };
    let store = Store::open(config.resolved_database_path())?;
    Ok(DictationEngine::from_config(
        config,
        store,
        catalog,
        Arc::new(SystemClock),
    )?)
}

fn run(command: &PracticeCommand, engine: &DictationEngine, config: &Config) -> Result<(), Box<dyn Error>> {
    match command {
        PracticeCommand::Select(args) => print_json(&args.select(engine, config)?),
        PracticeCommand::Plan(args) => {
            let words = args.select(engine, config)?;
            let task_id = engine.create_task(args.learner, &words, TaskSource::Smart)?;
            print_json(&engine.task(task_id)?)
        }
        PracticeCommand::CreateTask {
            learner,
            words,
            source,
        } => {
            let task_id = engine.create_task(*learner, words, (*source).into())?;
            print_json(&engine.task(task_id)?)
        }
        PracticeCommand::Task { task } => print_json(&engine.task(*task)?),
        PracticeCommand::Start { task } => {
            let session_id = engine.start_session(*task)?;
            print_json(&engine.session(session_id)?)
        }
        PracticeCommand::CreateSession { task } => {
            let session_id = engine.create_session(*task)?;
            print_json(&engine.session(session_id)?)
        }
        PracticeCommand::StartPending { session } => print_json(&engine.start_pending(*session)?),
        PracticeCommand::Active { task } => print_json(&engine.active_session(*task)?),
        PracticeCommand::Answer {
            session,
            word,
            text,
            secs,
        } => print_json(&engine.submit_answer(*session, *word, text, *secs)?),
        PracticeCommand::Complete { session } => print_json(&engine.complete_session(*session)?),
        PracticeCommand::Interrupt { session } => print_json(&engine.interrupt_session(*session)?),
        PracticeCommand::Correct {
            session,
            word,
            text,
            reason,
        } => print_json(&engine.correct_answer(*session, *word, text, reason.as_deref())?),
        PracticeCommand::Show { session } => print_json(&serde_json::json!({
            "session": engine.session(*session)?,
            "corrections": engine.corrections(*session)?,
        })),
        PracticeCommand::Mastery { learner, word } => match word {
            Some(word) => print_json(&engine.get_mastery(*learner, *word)?),
            None => print_json(&engine.learner_states(*learner)?),
        },
        PracticeCommand::Stats { learner, days, csv } => {
            let range = DateRange::last_days(chrono::Utc::now(), *days);
            if *csv {
                engine.export_daily_csv(*learner, range, io::stdout().lock())?;
                Ok(())
            } else {
                print_json(&engine.overview(*learner, range)?)
            }
        }
        PracticeCommand::Errors { learner, days } => {
            let range = DateRange::last_days(chrono::Utc::now(), *days);
            print_json(&engine.error_patterns(*learner, range)?)
        }
        PracticeCommand::UnitErrors {
            learner,
            scope,
            unit,
            lesson,
        } => print_json(&engine.unit_errors(*learner, &scope.scope(), *unit, *lesson)?),
        PracticeCommand::Progress { learner, scope } => {
            print_json(&engine.kind_progress(*learner, &scope.scope())?)
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    logging::init();
    let cli = Cli::parse();

    let config_store = match &cli.config {
        Some(path) => FileConfigStore::with_path(path),
        None => FileConfigStore::new(),
    };
    let mut config = config_store.load();
    if let Some(db) = &cli.db {
        config.database_path = Some(db.clone());
    }
    if let Some(catalog) = &cli.catalog {
        config.catalog_path = Some(catalog.clone());
    }
    config.validate()?;

    match &cli.command {
        Command::Config { save } => {
            if *save {
                config_store.save(&config)?;
                tracing::info!(path = %config_store.path().display(), "config saved");
            }
            print_json(&config)
        }
        Command::Practice(command) => {
            let engine = open_engine(&config)?;
            run(command, &engine, &config)
        }
    }
}
