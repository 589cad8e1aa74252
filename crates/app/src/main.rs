use std::fmt;
use std::sync::Arc;

use lms_core::RecordError;
use lms_core::model::{Completion, CourseId, Identity, LessonId, QuizId, UserId};
use lms_services::{Clock, CourseCatalog, ProgressStore, StaticCatalog, StoreConfig, StoreDeps};
use lms_storage::InMemoryRemote;

mod logging;

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    MissingOperand { command: &'static str, name: &'static str },
    UnknownArg(String),
    UnknownCommand(String),
    InvalidNumber { name: &'static str, raw: String },
    InvalidDbUrl { raw: String },
    InvalidId(RecordError),
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::MissingOperand { command, name } => {
                write!(f, "{command}: missing <{name}>")
            }
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::UnknownCommand(cmd) => write!(f, "unknown command: {cmd}"),
            ArgsError::InvalidNumber { name, raw } => write!(f, "invalid {name}: {raw}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
            ArgsError::InvalidId(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ArgsError {}

impl From<RecordError> for ArgsError {
    fn from(err: RecordError) -> Self {
        Self::InvalidId(err)
    }
}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  lms-cli mark   <course> <lesson> [--time <secs>]");
    eprintln!("  lms-cli unmark <course> <lesson>");
    eprintln!("  lms-cli quiz   <course> <quiz> <score 0-100> <questions>");
    eprintln!("  lms-cli rate   <course> <1-5>");
    eprintln!("  lms-cli save   <course>          # toggles");
    eprintln!("  lms-cli status <course>");
    eprintln!("  lms-cli streak");
    eprintln!();
    eprintln!("Options (any command):");
    eprintln!("  --db <sqlite_url>     default sqlite:lms.sqlite3");
    eprintln!("  --user <id>           omit for the anonymous identity");
    eprintln!("  --catalog <file>      JSON array of course outlines");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  LMS_DB_URL, LMS_USER, LMS_CATALOG, RUST_LOG");
    eprintln!("  LMS_PROGRESS_DEBOUNCE_MS, LMS_SAVED_DEBOUNCE_MS, LMS_UTC_OFFSET_MINUTES");
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Mark {
        course: CourseId,
        lesson: LessonId,
        time_spent_secs: u64,
    },
    Unmark {
        course: CourseId,
        lesson: LessonId,
    },
    Quiz {
        course: CourseId,
        quiz: QuizId,
        score: u8,
        questions: u32,
    },
    Rate {
        course: CourseId,
        value: u8,
    },
    Save {
        course: CourseId,
    },
    Status {
        course: CourseId,
    },
    Streak,
}

#[derive(Debug)]
struct Args {
    db_url: String,
    identity: Identity,
    catalog_path: Option<String>,
    command: Command,
}

struct Operands {
    command: &'static str,
    values: std::vec::IntoIter<String>,
}

impl Operands {
    fn next(&mut self, name: &'static str) -> Result<String, ArgsError> {
        self.values.next().ok_or(ArgsError::MissingOperand {
            command: self.command,
            name,
        })
    }

    fn number<T: std::str::FromStr>(&mut self, name: &'static str) -> Result<T, ArgsError> {
        let raw = self.next(name)?;
        raw.parse()
            .map_err(|_| ArgsError::InvalidNumber { name, raw: raw.clone() })
    }

    fn finish(mut self) -> Result<(), ArgsError> {
        match self.values.next() {
            Some(extra) => Err(ArgsError::UnknownArg(extra)),
            None => Ok(()),
        }
    }
}

impl Args {
    fn parse(
        argv: impl IntoIterator<Item = String>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Self>, ArgsError> {
        let mut db_url = env("LMS_DB_URL")
            .map_or_else(|| "sqlite:lms.sqlite3".into(), normalize_sqlite_url);
        let mut user = env("LMS_USER");
        let mut catalog_path = env("LMS_CATALOG");
        let mut time_spent_secs: u64 = 0;
        let mut positional = Vec::new();

        let mut args = argv.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(&mut args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = normalize_sqlite_url(value);
                }
                "--user" => user = Some(require_value(&mut args, "--user")?),
                "--catalog" => catalog_path = Some(require_value(&mut args, "--catalog")?),
                "--time" => {
                    let value = require_value(&mut args, "--time")?;
                    time_spent_secs = value.parse().map_err(|_| ArgsError::InvalidNumber {
                        name: "--time",
                        raw: value.clone(),
                    })?;
                }
                "--help" | "-h" => return Ok(None),
                flag if flag.starts_with("--") => return Err(ArgsError::UnknownArg(flag.to_owned())),
                _ => positional.push(arg),
            }
        }

        let mut positional = positional.into_iter();
        let Some(name) = positional.next() else {
            return Ok(None);
        };
        let command = Self::command(&name, time_spent_secs, positional)?;

        let user = match user.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(UserId::new(raw)?),
        };
        let identity = Identity::from_session(user);

        Ok(Some(Self {
            db_url,
            identity,
            catalog_path,
            command,
        }))
    }

    fn command(
        name: &str,
        time_spent_secs: u64,
        values: std::vec::IntoIter<String>,
    ) -> Result<Command, ArgsError> {
        let command: &'static str = match name {
            "mark" => "mark",
            "unmark" => "unmark",
            "quiz" => "quiz",
            "rate" => "rate",
            "save" => "save",
            "status" => "status",
            "streak" => "streak",
            other => return Err(ArgsError::UnknownCommand(other.to_owned())),
        };
        let mut ops = Operands { command, values };

        let parsed = match command {
            "mark" => Command::Mark {
                course: CourseId::new(ops.next("course")?)?,
                lesson: LessonId::new(ops.next("lesson")?)?,
                time_spent_secs,
            },
            "unmark" => Command::Unmark {
                course: CourseId::new(ops.next("course")?)?,
                lesson: LessonId::new(ops.next("lesson")?)?,
            },
            "quiz" => Command::Quiz {
                course: CourseId::new(ops.next("course")?)?,
                quiz: QuizId::new(ops.next("quiz")?)?,
                score: ops.number("score")?,
                questions: ops.number("questions")?,
            },
            "rate" => Command::Rate {
                course: CourseId::new(ops.next("course")?)?,
                value: ops.number("rating")?,
            },
            "save" => Command::Save {
                course: CourseId::new(ops.next("course")?)?,
            },
            "status" => Command::Status {
                course: CourseId::new(ops.next("course")?)?,
            },
            _ => Command::Streak,
        };
        ops.finish()?;
        Ok(parsed)
    }
}

fn normalize_sqlite_url(raw: String) -> String {
    if raw == "sqlite::memory:" || raw.starts_with("sqlite://") {
        return raw;
    }

    let trimmed = raw.trim().to_string();
    let path_str = trimmed
        .strip_prefix("sqlite:")
        .unwrap_or(trimmed.as_str())
        .to_string();
    let path = std::path::Path::new(&path_str);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

fn prepare_sqlite_file(db_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    if db_url == "sqlite::memory:" {
        return Ok(());
    }

    let path = db_url
        .strip_prefix("sqlite://")
        .ok_or_else(|| ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        })?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        }
        .into());
    }

    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
    }
    Ok(())
}

fn load_catalog(path: Option<&str>) -> Result<StaticCatalog, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(StaticCatalog::from_json(&std::fs::read_to_string(path)?)?),
        None => Ok(StaticCatalog::default()),
    }
}

fn describe_completion(completion: Completion) -> String {
    match completion {
        Completion::NotStarted => "not started".into(),
        Completion::Started { percentage } => format!("{percentage}% complete"),
    }
}

async fn execute(
    store: &ProgressStore,
    command: &Command,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Mark {
            course,
            lesson,
            time_spent_secs,
        } => {
            store.mark_lesson_complete(course, lesson, *time_spent_secs);
            println!(
                "{course}/{lesson}: complete ({})",
                describe_completion(store.course_completion(course))
            );
        }
        Command::Unmark { course, lesson } => {
            if store.unmark_lesson_complete(course, lesson) {
                println!("{course}/{lesson}: cleared");
            } else {
                println!("{course}/{lesson}: was not complete");
            }
        }
        Command::Quiz {
            course,
            quiz,
            score,
            questions,
        } => {
            let result =
                store.save_quiz_result(course, quiz, *score, *questions, Default::default())?;
            println!(
                "{course}/{quiz}: {}% over {} questions",
                result.score(),
                result.total_questions()
            );
        }
        Command::Rate { course, value } => {
            store.rate_course(course, *value)?;
            println!("{course}: rated {value}");
        }
        Command::Save { course } => {
            let state = if store.toggle_saved_course(course) {
                "saved"
            } else {
                "removed from saved"
            };
            println!("{course}: {state}");
        }
        Command::Status { course } => {
            println!("{course}: {}", describe_completion(store.course_completion(course)));
            match (store.course_totals(course), store.course_progress(course)) {
                (None, _) => println!("  totals unknown (not in catalog)"),
                (Some(_), Some(p)) => {
                    println!("  lessons {}/{}", p.completed_lessons, p.total_lessons);
                    println!(
                        "  quizzes {}/{} (avg {:.1})",
                        p.completed_quizzes, p.total_quizzes, p.average_quiz_score
                    );
                }
                (Some(t), None) => println!("  lessons 0/{} quizzes 0/{}", t.lessons, t.quizzes),
            }
            let count = store.rating_count(course);
            if count > 0 {
                println!("  rating {:.1} from {count}", store.average_rating(course));
            }
            if let Some(mine) = store.user_rating(course) {
                println!("  your rating {}", mine.value());
            }
            println!(
                "  finished here {}",
                store.completed_students_count(course, store.course_totals(course))
            );
            if store.is_course_saved(course) {
                println!("  saved");
            }
        }
        Command::Streak => println!("streak: {} day(s)", store.current_streak()),
    }
    Ok(())
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let parsed = Args::parse(std::env::args().skip(1), |name| std::env::var(name).ok())
        .map_err(|e| {
            eprintln!("{e}");
            print_usage();
            e
        })?;
    let Some(args) = parsed else {
        print_usage();
        return Ok(());
    };

    // Open + migrate SQLite in the binary glue so the library crates stay storage-agnostic.
    prepare_sqlite_file(&args.db_url)?;
    let catalog: Arc<dyn CourseCatalog> = Arc::new(load_catalog(args.catalog_path.as_deref())?);
    // No remote backend is wired into the CLI; mirrors land in a process-local store.
    let deps = StoreDeps::sqlite(
        &args.db_url,
        Arc::new(InMemoryRemote::new()),
        catalog,
        Clock::default_clock(),
    )
    .await?;

    let store = ProgressStore::open(args.identity, deps, StoreConfig::from_env()).await?;
    let outcome = execute(&store, &args.command).await;
    store.close().await;
    outcome
}

#[tokio::main]
async fn main() {
    logging::init();
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}
