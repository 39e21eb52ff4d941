use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use shared::domain::{ClassId, SessionId, SessionStatus};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/classroom.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateClass {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    CreateSection {
        class_id: i64,
        name: String,
        #[arg(long, default_value = "")]
        semester: String,
    },
    CreateProblem {
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        starter_code: Option<String>,
    },
    /// Inserts a small demo catalog.
    Seed,
    ListSessions {
        #[arg(long)]
        status: Option<String>,
    },
    /// Marks a stored session completed without going through the live server.
    EndSession {
        session_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateClass { name, description } => {
            let class_id = storage.create_class(&name, &description).await?;
            println!("created class_id={class_id}");
        }
        Command::CreateSection {
            class_id,
            name,
            semester,
        } => {
            let section_id = storage
                .create_section(ClassId(class_id), &name, &semester)
                .await?;
            println!("created section_id={section_id}");
        }
        Command::CreateProblem {
            title,
            description,
            starter_code,
        } => {
            let problem_id = storage
                .create_problem(&title, &description, starter_code.as_deref())
                .await?;
            println!("created problem_id={problem_id}");
        }
        Command::Seed => seed(&storage).await?,
        Command::ListSessions { status } => {
            let status = match status.as_deref() {
                None => None,
                Some(raw) => match SessionStatus::parse(raw) {
                    Some(status) => Some(status),
                    None => bail!("unknown session status '{raw}' (expected active or completed)"),
                },
            };
            for session in storage.list_sessions(status).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    session.session_id,
                    session.join_code,
                    session.status.as_str(),
                    session.last_activity.to_rfc3339()
                );
            }
        }
        Command::EndSession { session_id } => {
            if storage.end_session(SessionId(session_id)).await? {
                println!("ended session_id={session_id}");
            } else {
                bail!("session {session_id} is not active");
            }
        }
    }

    Ok(())
}

async fn seed(storage: &Storage) -> Result<()> {
    let intro = storage
        .create_class("Intro to Programming", "First-semester Python")
        .await?;
    storage.create_section(intro, "Section A", "Fall").await?;
    storage.create_section(intro, "Section B", "Fall").await?;
    let data = storage
        .create_class("Data Structures", "Lists, maps and trees")
        .await?;
    storage.create_section(data, "Section 1", "Spring").await?;

    storage
        .create_problem(
            "FizzBuzz",
            "Print the numbers 1 to 30, replacing multiples of 3 with Fizz, \
             multiples of 5 with Buzz and multiples of both with FizzBuzz.",
            Some("for i in range(1, 31):\n    pass\n"),
        )
        .await?;
    storage
        .create_problem(
            "Reverse a string",
            "Read a line from standard input and print it reversed.",
            Some("line = input()\n"),
        )
        .await?;

    println!("seeded classes {intro} and {data} with sections and two problems");
    Ok(())
}
