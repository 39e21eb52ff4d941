use super::*;

use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

async fn test_hub() -> Arc<Hub> {
    hub_on(Storage::new("sqlite::memory:").await.expect("db"))
}

fn hub_on(storage: Storage) -> Arc<Hub> {
    Hub::new(
        storage,
        ExecutorConfig {
            interpreter: "sh".into(),
            timeout: Duration::from_secs(5),
        },
        1024,
    )
}

async fn connect(hub: &Hub) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
    let (tx, rx) = unbounded_channel();
    (hub.connect(tx).await, rx)
}

fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn create_session(
    hub: &Hub,
    instructor: ConnectionId,
    rx: &mut UnboundedReceiver<ServerEvent>,
) -> (SessionId, String) {
    hub.handle(instructor, ClientCommand::CreateSession).await;
    match drain(rx).as_slice() {
        [ServerEvent::SessionCreated {
            session_id,
            join_code,
        }] => (*session_id, join_code.clone()),
        other => panic!("unexpected events: {other:?}"),
    }
}

async fn join_student(
    hub: &Hub,
    join_code: &str,
    name: &str,
) -> (ConnectionId, StudentId, UnboundedReceiver<ServerEvent>) {
    let (conn, mut rx) = connect(hub).await;
    hub.handle(
        conn,
        ClientCommand::JoinSession {
            join_code: join_code.to_string(),
            student_name: name.to_string(),
        },
    )
    .await;
    match drain(&mut rx).as_slice() {
        [ServerEvent::StudentJoined { student_id, .. }] => (conn, *student_id, rx),
        other => panic!("unexpected events: {other:?}"),
    }
}

#[tokio::test]
async fn create_session_binds_instructor_and_issues_join_code() {
    let hub = test_hub().await;
    let (instructor, mut rx) = connect(&hub).await;
    let (session_id, join_code) = create_session(&hub, instructor, &mut rx).await;

    assert_eq!(join_code.len(), JOIN_CODE_LEN);
    assert_eq!(join_code, join_code.to_ascii_uppercase());
    assert_eq!(
        hub.role(instructor).await,
        ConnectionRole::Instructor(session_id)
    );
}

#[tokio::test]
async fn student_join_accepts_loose_join_code_and_updates_roster() {
    let hub = test_hub().await;
    let (instructor, mut instructor_rx) = connect(&hub).await;
    let (session_id, join_code) = create_session(&hub, instructor, &mut instructor_rx).await;

    let loose = format!("  {}  ", join_code.to_ascii_lowercase());
    let (_, student_id, _) = join_student(&hub, &loose, " Ada ").await;

    let events = drain(&mut instructor_rx);
    assert_eq!(
        events,
        vec![ServerEvent::StudentListUpdate {
            students: vec![StudentSummary {
                id: student_id,
                name: "Ada".into(),
                has_submitted_code: false,
            }],
        }]
    );
    assert_eq!(hub.participant_count(session_id).await, 1);
}

#[tokio::test]
async fn unknown_join_code_is_reported_to_sender() {
    let hub = test_hub().await;
    let (conn, mut rx) = connect(&hub).await;
    hub.handle(
        conn,
        ClientCommand::JoinSession {
            join_code: "NOPE00".into(),
            student_name: "Lin".into(),
        },
    )
    .await;
    assert_eq!(
        drain(&mut rx),
        vec![ServerEvent::error("no session with join code NOPE00")]
    );
    assert_eq!(hub.role(conn).await, ConnectionRole::Unbound);
}

#[tokio::test]
async fn first_submission_flips_roster_flag_and_persists_revisions() {
    let hub = test_hub().await;
    let (instructor, mut instructor_rx) = connect(&hub).await;
    let (session_id, join_code) = create_session(&hub, instructor, &mut instructor_rx).await;
    let (student, student_id, _student_rx) = join_student(&hub, &join_code, "Grace").await;
    drain(&mut instructor_rx);

    hub.handle(student, ClientCommand::UpdateCode { code: "print(1)".into() })
        .await;
    hub.handle(student, ClientCommand::UpdateCode { code: "print(2)".into() })
        .await;

    let events = drain(&mut instructor_rx);
    assert_eq!(events.len(), 1, "only the first submission changes the roster");
    let ServerEvent::StudentListUpdate { students } = &events[0] else {
        panic!("expected roster update, got {events:?}");
    };
    assert!(students[0].has_submitted_code);

    let revisions = hub
        .storage
        .list_revisions(session_id, Some(student_id))
        .await
        .expect("revisions");
    assert_eq!(revisions.len(), 2);
    assert_eq!(revisions[1].code, "print(2)");
}

#[tokio::test]
async fn oversized_code_is_rejected() {
    let hub = test_hub().await;
    let (instructor, mut instructor_rx) = connect(&hub).await;
    let (_, join_code) = create_session(&hub, instructor, &mut instructor_rx).await;
    let (student, _, mut student_rx) = join_student(&hub, &join_code, "Linus").await;

    hub.handle(student, ClientCommand::UpdateCode { code: "x".repeat(1025) })
        .await;
    assert_eq!(
        drain(&mut student_rx),
        vec![ServerEvent::error("code exceeds 1024 bytes")]
    );
}

#[tokio::test]
async fn requested_student_code_is_tagged_with_student_id() {
    let hub = test_hub().await;
    let (instructor, mut instructor_rx) = connect(&hub).await;
    let (_, join_code) = create_session(&hub, instructor, &mut instructor_rx).await;
    let (student, student_id, _student_rx) = join_student(&hub, &join_code, "Barbara").await;
    hub.handle(student, ClientCommand::UpdateCode { code: "x = 1".into() })
        .await;
    drain(&mut instructor_rx);

    hub.handle(instructor, ClientCommand::RequestStudentCode { student_id })
        .await;
    assert_eq!(
        drain(&mut instructor_rx),
        vec![ServerEvent::StudentCode {
            student_id: Some(student_id),
            code: "x = 1".into(),
        }]
    );

    hub.handle(
        instructor,
        ClientCommand::RequestStudentCode {
            student_id: StudentId(999),
        },
    )
    .await;
    assert_eq!(
        drain(&mut instructor_rx),
        vec![ServerEvent::error("student 999 is not in this session")]
    );
}

#[tokio::test]
async fn problem_updates_respect_limit_and_reach_students() {
    let hub = test_hub().await;
    let (instructor, mut instructor_rx) = connect(&hub).await;
    let (_, join_code) = create_session(&hub, instructor, &mut instructor_rx).await;
    let (_, _, mut student_rx) = join_student(&hub, &join_code, "Edsger").await;
    drain(&mut instructor_rx);

    hub.handle(
        instructor,
        ClientCommand::UpdateProblem {
            problem_text: "x".repeat(MAX_PROBLEM_TEXT_CHARS + 1),
        },
    )
    .await;
    assert!(matches!(
        drain(&mut instructor_rx).as_slice(),
        [ServerEvent::Error { .. }]
    ));
    assert!(drain(&mut student_rx).is_empty());

    hub.handle(
        instructor,
        ClientCommand::UpdateProblem {
            problem_text: "Reverse a string".into(),
        },
    )
    .await;
    assert_eq!(
        drain(&mut student_rx),
        vec![ServerEvent::ProblemUpdated {
            problem_text: "Reverse a string".into(),
        }]
    );
}

#[tokio::test]
async fn update_problem_without_session_is_rejected() {
    let hub = test_hub().await;
    let (conn, mut rx) = connect(&hub).await;
    hub.handle(
        conn,
        ClientCommand::UpdateProblem {
            problem_text: "hello".into(),
        },
    )
    .await;
    assert_eq!(
        drain(&mut rx),
        vec![ServerEvent::error("no active session for this connection")]
    );
}

#[tokio::test]
async fn featured_submission_follows_code_updates() {
    let hub = test_hub().await;
    let (instructor, mut instructor_rx) = connect(&hub).await;
    let (_, join_code) = create_session(&hub, instructor, &mut instructor_rx).await;
    let (student, student_id, _student_rx) = join_student(&hub, &join_code, "Ken").await;
    hub.handle(student, ClientCommand::UpdateCode { code: "v1".into() })
        .await;

    let (projector, mut projector_rx) = connect(&hub).await;
    hub.handle(
        projector,
        ClientCommand::WatchPublic {
            join_code: join_code.clone(),
        },
    )
    .await;
    assert!(drain(&mut projector_rx).is_empty());

    hub.handle(instructor, ClientCommand::SelectSubmissionForPublic { student_id })
        .await;
    hub.handle(student, ClientCommand::UpdateCode { code: "v2".into() })
        .await;

    let codes: Vec<String> = drain(&mut projector_rx)
        .into_iter()
        .map(|event| match event {
            ServerEvent::PublicSubmission { code, .. } => code,
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(codes, vec!["v1".to_string(), "v2".to_string()]);
}

#[tokio::test]
async fn student_disconnect_leaves_roster() {
    let hub = test_hub().await;
    let (instructor, mut instructor_rx) = connect(&hub).await;
    let (session_id, join_code) = create_session(&hub, instructor, &mut instructor_rx).await;
    let (student, _, _student_rx) = join_student(&hub, &join_code, "Dennis").await;
    drain(&mut instructor_rx);

    hub.disconnect(student).await;
    assert_eq!(
        drain(&mut instructor_rx),
        vec![ServerEvent::StudentListUpdate { students: vec![] }]
    );
    assert_eq!(hub.participant_count(session_id).await, 0);
}

#[tokio::test]
async fn instructor_can_rejoin_after_disconnect() {
    let hub = test_hub().await;
    let (instructor, mut instructor_rx) = connect(&hub).await;
    let (session_id, join_code) = create_session(&hub, instructor, &mut instructor_rx).await;
    let (_, student_id, _student_rx) = join_student(&hub, &join_code, "Margaret").await;
    hub.disconnect(instructor).await;

    let (returning, mut returning_rx) = connect(&hub).await;
    hub.handle(returning, ClientCommand::JoinExistingSession { session_id })
        .await;
    assert_eq!(
        drain(&mut returning_rx),
        vec![
            ServerEvent::SessionJoined {
                session_id,
                join_code,
            },
            ServerEvent::StudentListUpdate {
                students: vec![StudentSummary {
                    id: student_id,
                    name: "Margaret".into(),
                    has_submitted_code: false,
                }],
            },
        ]
    );
}

#[tokio::test]
async fn stored_active_session_is_restored_on_rejoin() {
    let hub = test_hub().await;
    let stored = hub
        .storage
        .create_session("OLD123", None, "carry over")
        .await
        .expect("session");

    let (instructor, mut rx) = connect(&hub).await;
    hub.handle(
        instructor,
        ClientCommand::JoinExistingSession {
            session_id: stored.session_id,
        },
    )
    .await;
    assert!(matches!(
        drain(&mut rx).first(),
        Some(ServerEvent::SessionJoined { join_code, .. }) if join_code == "OLD123"
    ));

    let (_, mut student_rx) = join_student_raw(&hub, "old123").await;
    assert!(matches!(
        drain(&mut student_rx).as_slice(),
        [ServerEvent::StudentJoined { problem_text, .. }] if problem_text == "carry over"
    ));
}

async fn join_student_raw(
    hub: &Hub,
    join_code: &str,
) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
    let (conn, rx) = connect(hub).await;
    hub.handle(
        conn,
        ClientCommand::JoinSession {
            join_code: join_code.to_string(),
            student_name: "Late".into(),
        },
    )
    .await;
    (conn, rx)
}

#[tokio::test]
async fn ending_session_notifies_participants_and_unbinds_them() {
    let hub = test_hub().await;
    let (instructor, mut instructor_rx) = connect(&hub).await;
    let (session_id, join_code) = create_session(&hub, instructor, &mut instructor_rx).await;
    let (student, _, mut student_rx) = join_student(&hub, &join_code, "Alan").await;
    drain(&mut instructor_rx);

    hub.handle(instructor, ClientCommand::EndSession { session_id })
        .await;

    assert_eq!(
        drain(&mut instructor_rx),
        vec![ServerEvent::SessionEnded { session_id }]
    );
    assert_eq!(
        drain(&mut student_rx),
        vec![ServerEvent::SessionEnded { session_id }]
    );
    assert_eq!(hub.role(instructor).await, ConnectionRole::Unbound);
    assert_eq!(hub.role(student).await, ConnectionRole::Unbound);

    hub.handle(instructor, ClientCommand::EndSession { session_id })
        .await;
    assert_eq!(
        drain(&mut instructor_rx),
        vec![ServerEvent::error("session not found or already ended")]
    );
}

#[tokio::test]
async fn list_sessions_reports_live_participant_counts() {
    let hub = test_hub().await;
    let (instructor, mut instructor_rx) = connect(&hub).await;
    let (session_id, join_code) = create_session(&hub, instructor, &mut instructor_rx).await;
    join_student(&hub, &join_code, "Barbara").await;
    join_student(&hub, &join_code, "Frances").await;
    drain(&mut instructor_rx);

    hub.handle(instructor, ClientCommand::ListSessions).await;
    let events = drain(&mut instructor_rx);
    let [ServerEvent::SessionList { sessions }] = events.as_slice() else {
        panic!("unexpected events: {events:?}");
    };
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, session_id);
    assert_eq!(sessions[0].participant_count, 2);
}

#[tokio::test]
async fn executing_student_code_replies_with_tagged_result() {
    let hub = test_hub().await;
    let (instructor, mut instructor_rx) = connect(&hub).await;
    let (_, join_code) = create_session(&hub, instructor, &mut instructor_rx).await;
    let (student, student_id, _student_rx) = join_student(&hub, &join_code, "Radia").await;
    hub.handle(student, ClientCommand::UpdateCode { code: "echo ran".into() })
        .await;
    drain(&mut instructor_rx);

    hub.handle(instructor, ClientCommand::ExecuteStudentCode { student_id })
        .await;
    let event = tokio::time::timeout(Duration::from_secs(5), instructor_rx.recv())
        .await
        .expect("result in time")
        .expect("channel open");
    let ServerEvent::ExecutionResult(result) = event else {
        panic!("expected execution result, got {event:?}");
    };
    assert!(result.success);
    assert_eq!(result.output, "ran\n");
    assert_eq!(result.student_id, Some(student_id));
}

async fn submit_code(hub: &Hub, student: ConnectionId, code: &str) {
    hub.handle(
        student,
        ClientCommand::UpdateCode {
            code: code.to_string(),
        },
    )
    .await;
}

#[tokio::test]
async fn restarted_hub_keeps_student_histories_apart() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("classroom.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let first = hub_on(Storage::new(&database_url).await.expect("db"));
    let (instructor, mut instructor_rx) = connect(&first).await;
    let (session_id, join_code) = create_session(&first, instructor, &mut instructor_rx).await;
    let (ada, ada_id, _ada_rx) = join_student(&first, &join_code, "Ada").await;
    submit_code(&first, ada, "ada code").await;
    drop(first);

    let second = hub_on(Storage::new(&database_url).await.expect("reopen db"));
    let (instructor, mut instructor_rx) = connect(&second).await;
    second
        .handle(instructor, ClientCommand::JoinExistingSession { session_id })
        .await;
    assert!(matches!(
        drain(&mut instructor_rx).first(),
        Some(ServerEvent::SessionJoined { .. })
    ));
    let (bob, bob_id, _bob_rx) = join_student(&second, &join_code, "Bob").await;
    submit_code(&second, bob, "bob code").await;

    assert_ne!(ada_id, bob_id);
    let history = second
        .storage
        .list_revisions(session_id, Some(bob_id))
        .await
        .expect("revisions");
    let entries: Vec<(&str, &str)> = history
        .iter()
        .map(|rev| (rev.student_name.as_str(), rev.code.as_str()))
        .collect();
    assert_eq!(entries, vec![("Bob", "bob code")]);
}

#[tokio::test]
async fn join_code_reaches_stored_session_before_instructor_returns() {
    let hub = test_hub().await;
    let stored = hub
        .storage
        .create_session("BACK01", None, "left over")
        .await
        .expect("session");
    hub.storage
        .insert_revision(stored.session_id, StudentId(7), "Ada", "print(7)")
        .await
        .expect("revision");

    let (conn, mut rx) = join_student_raw(&hub, "back01").await;
    match drain(&mut rx).as_slice() {
        [ServerEvent::StudentJoined {
            session_id,
            student_id,
            problem_text,
        }] => {
            assert_eq!(*session_id, stored.session_id);
            assert!(student_id.0 > 7, "reused stored id: {student_id:?}");
            assert_eq!(problem_text, "left over");
        }
        other => panic!("unexpected events: {other:?}"),
    }
    assert!(matches!(
        hub.role(conn).await,
        ConnectionRole::Student { session_id, .. } if session_id == stored.session_id
    ));
}

#[tokio::test]
async fn ended_stored_session_is_not_joinable_by_code() {
    let hub = test_hub().await;
    let stored = hub
        .storage
        .create_session("DONE01", None, "")
        .await
        .expect("session");
    hub.storage
        .end_session(stored.session_id)
        .await
        .expect("end");

    let (_, mut rx) = join_student_raw(&hub, "DONE01").await;
    assert!(matches!(
        drain(&mut rx).as_slice(),
        [ServerEvent::Error { .. }]
    ));
}

#[tokio::test]
async fn new_sessions_skip_join_codes_held_in_storage() {
    let hub = test_hub().await;
    let old = hub
        .storage
        .create_session("TAKEN1", None, "")
        .await
        .expect("session");
    hub.storage.end_session(old.session_id).await.expect("end");

    let mut codes = ["TAKEN1", "FRESH1"].into_iter();
    let stored = hub
        .store_new_session(|_| codes.next().unwrap_or("FRESH2").to_string())
        .await
        .expect("stored");
    assert_eq!(stored.join_code, "FRESH1");
    assert_ne!(stored.session_id, old.session_id);

    let exhausted = hub
        .store_new_session(|_| "TAKEN1".to_string())
        .await
        .expect_err("every code taken");
    assert_eq!(exhausted, HubError::JoinCodesExhausted);
}
