use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use client_core::{
    ControllerError, Intent, ReconnectPolicy, RestClient, SessionDriver, SessionViewController,
    View, WsChannel,
};
use shared::domain::{ClassId, SessionId, SessionStatus, StudentId};
use tracing::info;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server_url: String,
    /// How long to wait for the realtime channel before giving up.
    #[arg(long, default_value_t = 5)]
    connect_timeout_secs: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Classes,
    Sections {
        class_id: i64,
    },
    Problems,
    Sessions {
        #[arg(long)]
        status: Option<String>,
    },
    Revisions {
        session_id: i64,
        student_id: i64,
    },
    /// Creates a session, optionally sets its problem, and follows the roster until Ctrl-C.
    Live {
        #[arg(long)]
        problem: Option<String>,
        /// Ends the session on exit instead of leaving it open.
        #[arg(long)]
        end_on_exit: bool,
    },
    /// Rebinds to an existing session and follows the roster until Ctrl-C.
    Join {
        session_id: i64,
    },
    End {
        session_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let args = Args::parse();
    let connect_timeout = Duration::from_secs(args.connect_timeout_secs);

    match args.command {
        Command::Classes => {
            let rest = RestClient::new(&args.server_url)?;
            for class in rest.list_classes().await? {
                println!("{}\t{}\t{}", class.id, class.name, class.description);
            }
        }
        Command::Sections { class_id } => {
            let rest = RestClient::new(&args.server_url)?;
            for section in rest.list_sections(ClassId(class_id)).await? {
                println!("{}\t{}\t{}", section.id, section.name, section.semester);
            }
        }
        Command::Problems => {
            let rest = RestClient::new(&args.server_url)?;
            for problem in rest.list_problems().await? {
                println!("{}\t{}", problem.id, problem.title);
            }
        }
        Command::Sessions { status } => {
            let status = parse_status(status.as_deref())?;
            let rest = RestClient::new(&args.server_url)?;
            for session in rest.list_sessions(status).await? {
                println!(
                    "{}\t{}\t{}\t{} participants",
                    session.id,
                    session.join_code,
                    session.status.as_str(),
                    session.participant_count
                );
            }
        }
        Command::Revisions {
            session_id,
            student_id,
        } => {
            let rest = RestClient::new(&args.server_url)?;
            let mut history = rest
                .revision_history(SessionId(session_id), StudentId(student_id))
                .await?;
            if history.is_empty() {
                println!("no revisions");
            }
            let mut revision = history.first().cloned();
            while let Some(current) = revision {
                println!(
                    "--- revision {} at {} ---\n{}",
                    current.id,
                    current.created_at.to_rfc3339(),
                    current.code
                );
                revision = history.newer().cloned();
            }
        }
        Command::Live {
            problem,
            end_on_exit,
        } => {
            let driver = connect(&args.server_url, connect_timeout).await?;
            driver.submit(Intent::CreateSession).await?;
            let snapshot = driver
                .wait_for(|c| c.view() == View::Session || c.error().is_some())
                .await?;
            if let Some(err) = snapshot.error() {
                bail!("could not create session: {err}");
            }
            let active = snapshot
                .active_session()
                .ok_or_else(|| anyhow!("session view without active session"))?;
            println!("session {} live, join code {}", active.session_id, active.join_code);

            if let Some(problem) = problem {
                driver.submit(Intent::UpdateProblem(problem)).await?;
            }
            follow_roster(&driver).await?;
            if end_on_exit {
                driver.submit(Intent::EndActiveSession).await?;
                driver.wait_for(|c| c.view() != View::Session).await?;
            }
            driver.shutdown().await;
        }
        Command::Join { session_id } => {
            let driver = connect(&args.server_url, connect_timeout).await?;
            driver
                .submit(Intent::JoinExistingSession(SessionId(session_id)))
                .await?;
            let snapshot = driver
                .wait_for(|c| c.view() == View::Session || c.error().is_some())
                .await?;
            if let Some(err) = snapshot.error() {
                bail!("could not join session {session_id}: {err}");
            }
            follow_roster(&driver).await?;
            driver.shutdown().await;
        }
        Command::End { session_id } => {
            let driver = connect(&args.server_url, connect_timeout).await?;
            driver
                .submit(Intent::JoinExistingSession(SessionId(session_id)))
                .await?;
            driver
                .wait_for(|c| c.view() == View::Session || c.error().is_some())
                .await?;
            driver.submit(Intent::EndActiveSession).await?;
            let snapshot = driver
                .wait_for(|c| c.view() != View::Session || c.error().is_some())
                .await?;
            if let Some(err) = snapshot.error() {
                bail!("could not end session {session_id}: {err}");
            }
            println!("ended session {session_id}");
            driver.shutdown().await;
        }
    }

    Ok(())
}

fn parse_status(raw: Option<&str>) -> Result<Option<SessionStatus>> {
    match raw {
        None => Ok(None),
        Some(raw) => SessionStatus::parse(raw)
            .map(Some)
            .ok_or_else(|| anyhow!("unknown session status '{raw}' (expected active or completed)")),
    }
}

async fn connect(server_url: &str, timeout: Duration) -> Result<SessionDriver> {
    let channel = WsChannel::spawn(server_url, ReconnectPolicy::default())?;
    tokio::time::timeout(timeout, channel.wait_connected())
        .await
        .map_err(|_| anyhow!("timed out connecting to {server_url}"))??;
    info!(%server_url, "connected");
    let driver = SessionDriver::spawn(channel, SessionViewController::new());
    driver.wait_for(|c| c.channel_state().is_connected()).await?;
    Ok(driver)
}

/// Prints roster changes and errors until Ctrl-C or the session ends.
async fn follow_roster(driver: &SessionDriver) -> Result<()> {
    let mut snapshots = driver.subscribe();
    let mut last_roster = Vec::new();
    let mut last_error: Option<ControllerError> = None;
    loop {
        {
            let snapshot = snapshots.borrow_and_update();
            if snapshot.roster() != last_roster.as_slice() {
                last_roster = snapshot.roster().to_vec();
                println!("{} student(s) connected:", last_roster.len());
                for student in &last_roster {
                    let marker = if student.has_submitted_code { "*" } else { " " };
                    println!("  {marker} {}\t{}", student.id, student.name);
                }
            }
            if snapshot.error() != last_error.as_ref() {
                last_error = snapshot.error().cloned();
                if let Some(err) = &last_error {
                    eprintln!("error: {err}");
                }
            }
            if snapshot.view() != View::Session {
                println!("session ended");
                return Ok(());
            }
        }

        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                return Ok(());
            }
        }
    }
}
