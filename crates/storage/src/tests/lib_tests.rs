use super::*;

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn stores_and_lists_classes_by_name() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.create_class("Systems", "").await.expect("class");
    let intro = storage
        .create_class("Intro to Programming", "CS1")
        .await
        .expect("class");

    let classes = storage.list_classes().await.expect("classes");
    assert_eq!(classes.len(), 2);
    assert_eq!(classes[0].class_id, intro);
    assert_eq!(classes[0].description, "CS1");
}

#[tokio::test]
async fn update_and_delete_report_missing_rows() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let class_id = storage.create_class("Algorithms", "").await.expect("class");

    assert!(storage
        .update_class(class_id, "Algorithms II", "spring")
        .await
        .expect("update"));
    assert!(!storage
        .update_class(ClassId(999), "nope", "")
        .await
        .expect("update missing"));

    let loaded = storage
        .load_class(class_id)
        .await
        .expect("load")
        .expect("class exists");
    assert_eq!(loaded.name, "Algorithms II");

    assert!(storage.delete_class(class_id).await.expect("delete"));
    assert!(!storage.delete_class(class_id).await.expect("delete again"));
}

#[tokio::test]
async fn deleting_class_cascades_to_sections() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let class_id = storage.create_class("Databases", "").await.expect("class");
    storage
        .create_section(class_id, "Section A", "Fall")
        .await
        .expect("section");
    storage
        .create_section(class_id, "Section B", "Fall")
        .await
        .expect("section");
    assert_eq!(
        storage
            .list_sections_for_class(class_id)
            .await
            .expect("sections")
            .len(),
        2
    );

    storage.delete_class(class_id).await.expect("delete");
    assert!(storage
        .list_sections_for_class(class_id)
        .await
        .expect("sections")
        .is_empty());
}

#[tokio::test]
async fn section_for_unknown_class_is_rejected() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let err = storage
        .create_section(ClassId(42), "Ghost", "")
        .await
        .expect_err("foreign key should fail");
    assert!(err.to_string().contains("class 42"));
}

#[tokio::test]
async fn problem_round_trips_starter_code() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let problem_id = storage
        .create_problem("FizzBuzz", "Print numbers", Some("for i in range(1, 101):\n    pass"))
        .await
        .expect("problem");

    let problem = storage
        .load_problem(problem_id)
        .await
        .expect("load")
        .expect("problem exists");
    assert_eq!(problem.title, "FizzBuzz");
    assert!(problem.starter_code.is_some());

    storage
        .update_problem(problem_id, "FizzBuzz", "Print numbers 1..100", None)
        .await
        .expect("update");
    let problem = storage
        .load_problem(problem_id)
        .await
        .expect("load")
        .expect("problem exists");
    assert_eq!(problem.starter_code, None);
}

#[tokio::test]
async fn ended_sessions_leave_the_active_list() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let first = storage
        .create_session("AAA111", None, "")
        .await
        .expect("session");
    let second = storage
        .create_session("BBB222", None, "reverse a list")
        .await
        .expect("session");
    assert_eq!(first.status, SessionStatus::Active);

    assert!(storage.end_session(first.session_id).await.expect("end"));
    assert!(!storage
        .end_session(first.session_id)
        .await
        .expect("end twice"));

    let active = storage
        .list_sessions(Some(SessionStatus::Active))
        .await
        .expect("active");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].session_id, second.session_id);

    let ended = storage
        .load_session(first.session_id)
        .await
        .expect("load")
        .expect("session exists");
    assert_eq!(ended.status, SessionStatus::Completed);
    assert!(ended.ended_at.is_some());

    assert_eq!(storage.list_sessions(None).await.expect("all").len(), 2);
}

#[tokio::test]
async fn duplicate_join_codes_are_rejected() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .create_session("SAME01", None, "")
        .await
        .expect("session");
    assert!(storage.create_session("SAME01", None, "").await.is_err());
    assert!(storage
        .try_create_session("SAME01", None, "")
        .await
        .expect("insert")
        .is_none());
}

#[tokio::test]
async fn ended_session_keeps_its_join_code_reserved() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let old = storage
        .create_session("KEEP01", None, "")
        .await
        .expect("session");
    storage.end_session(old.session_id).await.expect("end");

    assert!(storage
        .try_create_session("KEEP01", None, "")
        .await
        .expect("insert")
        .is_none());
    let found = storage
        .load_session_by_join_code("KEEP01")
        .await
        .expect("lookup")
        .expect("session exists");
    assert_eq!(found.session_id, old.session_id);
    assert_eq!(found.status, SessionStatus::Completed);
    assert!(storage
        .load_session_by_join_code("NONE00")
        .await
        .expect("lookup")
        .is_none());
}

#[tokio::test]
async fn max_student_id_tracks_stored_revisions_per_session() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let first = storage
        .create_session("MAX001", None, "")
        .await
        .expect("session")
        .session_id;
    let second = storage
        .create_session("MAX002", None, "")
        .await
        .expect("session")
        .session_id;
    assert_eq!(storage.max_student_id(first).await.expect("max"), None);

    storage
        .insert_revision(first, StudentId(3), "ada", "print(3)")
        .await
        .expect("revision");
    storage
        .insert_revision(first, StudentId(9), "grace", "print(9)")
        .await
        .expect("revision");
    storage
        .insert_revision(second, StudentId(40), "alan", "print(40)")
        .await
        .expect("revision");

    assert_eq!(
        storage.max_student_id(first).await.expect("max"),
        Some(StudentId(9))
    );
}

#[tokio::test]
async fn problem_text_cannot_change_after_session_ends() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let session = storage
        .create_session("CCC333", None, "")
        .await
        .expect("session");
    assert!(storage
        .update_session_problem(session.session_id, "sum two numbers")
        .await
        .expect("update"));

    storage.end_session(session.session_id).await.expect("end");
    assert!(!storage
        .update_session_problem(session.session_id, "too late")
        .await
        .expect("update"));
}

#[tokio::test]
async fn revisions_filter_by_student_in_insert_order() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let session = storage
        .create_session("DDD444", None, "")
        .await
        .expect("session");
    let sid = session.session_id;

    storage
        .insert_revision(sid, StudentId(1), "ada", "print(1)")
        .await
        .expect("rev");
    storage
        .insert_revision(sid, StudentId(2), "grace", "print(2)")
        .await
        .expect("rev");
    storage
        .insert_revision(sid, StudentId(1), "ada", "print(11)")
        .await
        .expect("rev");

    let ada = storage
        .list_revisions(sid, Some(StudentId(1)))
        .await
        .expect("revisions");
    let codes: Vec<_> = ada.iter().map(|rev| rev.code.as_str()).collect();
    assert_eq!(codes, vec!["print(1)", "print(11)"]);

    let all = storage.list_revisions(sid, None).await.expect("revisions");
    assert_eq!(all.len(), 3);
}
