use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;
use tempfile::TempDir;
use warble_server::storage::{
    MemoryStorage, MessageRole, SqliteStorage, StorageBackend, DEFAULT_THREAD_TITLE,
    HISTORY_LIMIT, THREAD_LIST_LIMIT,
};

struct TestBackends {
    _dir: TempDir,
    backends: Vec<(&'static str, Arc<dyn StorageBackend>)>,
}

fn build_backends() -> TestBackends {
    let dir = tempfile::tempdir().expect("create temp dir");
    let db_path = dir.path().join(format!(
        "warble_contract_{}.db",
        uuid::Uuid::new_v4().simple()
    ));
    let sqlite = Arc::new(SqliteStorage::new(db_path.to_string_lossy().to_string()));
    sqlite.ensure_initialized().expect("init sqlite schema");
    let memory = Arc::new(MemoryStorage::new());
    TestBackends {
        _dir: dir,
        backends: vec![("sqlite", sqlite), ("memory", memory)],
    }
}

#[test]
fn ensure_user_is_idempotent() {
    let harness = build_backends();
    for (name, storage) in &harness.backends {
        storage.ensure_user("user_a").unwrap();
        storage.ensure_user("user_a").unwrap();
        storage.ensure_user(" user_a ").unwrap();
        assert!(
            storage.ensure_user("  ").is_err(),
            "{name}: blank user id must be rejected"
        );
    }
}

#[test]
fn create_thread_applies_default_title() {
    let harness = build_backends();
    for (name, storage) in &harness.backends {
        storage.create_thread("th_default", "user_b", "").unwrap();
        storage
            .create_thread("th_titled", "user_b", "  My trip  ")
            .unwrap();

        let threads = storage.list_threads("user_b").unwrap();
        assert_eq!(threads.len(), 2, "{name}: both threads listed");
        let default = threads
            .iter()
            .find(|record| record.thread_id == "th_default")
            .unwrap();
        assert_eq!(default.title, DEFAULT_THREAD_TITLE);
        let titled = threads
            .iter()
            .find(|record| record.thread_id == "th_titled")
            .unwrap();
        assert_eq!(titled.title, "My trip", "{name}: title is trimmed");
    }
}

#[test]
fn rename_trims_truncates_and_rejects_blank() {
    let harness = build_backends();
    for (name, storage) in &harness.backends {
        storage.create_thread("th_rename", "user_c", "before").unwrap();

        let long = format!("  {}  ", "x".repeat(200));
        assert!(storage.rename_thread("th_rename", "user_c", &long).unwrap());
        let threads = storage.list_threads("user_c").unwrap();
        assert_eq!(
            threads[0].title.chars().count(),
            80,
            "{name}: long titles truncate to 80 chars"
        );

        assert!(
            storage.rename_thread("th_rename", "user_c", "   ").is_err(),
            "{name}: blank title must error"
        );
        let threads = storage.list_threads("user_c").unwrap();
        assert_eq!(
            threads[0].title.chars().count(),
            80,
            "{name}: failed rename leaves title unchanged"
        );
    }
}

#[test]
fn rename_requires_ownership() {
    let harness = build_backends();
    for (name, storage) in &harness.backends {
        storage.create_thread("th_owned", "user_d", "mine").unwrap();

        let renamed = storage
            .rename_thread("th_owned", "intruder", "stolen")
            .unwrap();
        assert!(!renamed, "{name}: wrong owner cannot rename");
        let renamed = storage
            .rename_thread("th_missing", "user_d", "ghost")
            .unwrap();
        assert!(!renamed, "{name}: missing thread cannot rename");

        let threads = storage.list_threads("user_d").unwrap();
        assert_eq!(threads[0].title, "mine");
    }
}

#[test]
fn ownership_conflates_missing_and_foreign_threads() {
    let harness = build_backends();
    for (name, storage) in &harness.backends {
        storage.create_thread("th_gate", "user_e", "secret").unwrap();

        assert!(storage.thread_owned_by("th_gate", "user_e").unwrap());
        assert!(
            !storage.thread_owned_by("th_gate", "someone_else").unwrap(),
            "{name}: foreign thread reads as absent"
        );
        assert!(
            !storage.thread_owned_by("th_nowhere", "user_e").unwrap(),
            "{name}: missing thread reads as absent"
        );
    }
}

#[test]
fn history_is_ordered_oldest_first() {
    let harness = build_backends();
    for (name, storage) in &harness.backends {
        storage.create_thread("th_hist", "user_f", "chat").unwrap();
        storage
            .insert_message("m1", "th_hist", MessageRole::User, Some("hello"))
            .unwrap();
        sleep(Duration::from_millis(5));
        storage
            .insert_message("m2", "th_hist", MessageRole::Assistant, Some("hi there"))
            .unwrap();
        sleep(Duration::from_millis(5));
        storage
            .insert_message("m3", "th_hist", MessageRole::User, Some("thanks"))
            .unwrap();

        let history = storage.get_history("th_hist").unwrap();
        assert_eq!(history.len(), 3, "{name}");
        assert_eq!(history[0].msg_id, "m1");
        assert_eq!(history[0].role, "user");
        assert_eq!(history[0].content.as_deref(), Some("hello"));
        assert_eq!(history[1].msg_id, "m2");
        assert_eq!(history[1].role, "assistant");
        assert_eq!(history[2].msg_id, "m3");
        assert!(history[0].created_at <= history[1].created_at);
        assert!(history[1].created_at <= history[2].created_at);
    }
}

#[test]
fn history_caps_at_limit() {
    let harness = build_backends();
    for (name, storage) in &harness.backends {
        storage.create_thread("th_cap", "user_g", "busy").unwrap();
        for index in 0..(HISTORY_LIMIT + 5) {
            storage
                .insert_message(
                    &format!("m{index}"),
                    "th_cap",
                    MessageRole::User,
                    Some("ping"),
                )
                .unwrap();
        }
        let history = storage.get_history("th_cap").unwrap();
        assert_eq!(history.len(), HISTORY_LIMIT as usize, "{name}");
    }
}

#[test]
fn message_content_may_be_absent() {
    let harness = build_backends();
    for (name, storage) in &harness.backends {
        storage.create_thread("th_null", "user_h", "quiet").unwrap();
        storage
            .insert_message("m_null", "th_null", MessageRole::Assistant, None)
            .unwrap();
        let history = storage.get_history("th_null").unwrap();
        assert_eq!(history.len(), 1, "{name}");
        assert!(history[0].content.is_none());
    }
}

#[test]
fn thread_list_caps_at_limit_newest_first() {
    let harness = build_backends();
    for (name, storage) in &harness.backends {
        for index in 0..(THREAD_LIST_LIMIT + 5) {
            storage
                .create_thread(&format!("th_many_{index}"), "user_i", "one of many")
                .unwrap();
        }
        let threads = storage.list_threads("user_i").unwrap();
        assert_eq!(threads.len(), THREAD_LIST_LIMIT as usize, "{name}");

        // The most recently touched thread must come back first.
        sleep(Duration::from_millis(5));
        storage.touch_thread("th_many_3").unwrap();
        let threads = storage.list_threads("user_i").unwrap();
        assert_eq!(threads[0].thread_id, "th_many_3", "{name}");
    }
}

#[test]
fn touch_bumps_updated_at() {
    let harness = build_backends();
    for (name, storage) in &harness.backends {
        storage.create_thread("th_touch", "user_j", "idle").unwrap();
        let before = storage.list_threads("user_j").unwrap()[0].updated_at;
        sleep(Duration::from_millis(5));
        storage.touch_thread("th_touch").unwrap();
        let after = storage.list_threads("user_j").unwrap()[0].updated_at;
        assert!(after > before, "{name}: touch must advance updated_at");
    }
}

#[test]
fn health_check_reports_backend_kind() {
    let harness = build_backends();
    let kinds: Vec<&str> = harness
        .backends
        .iter()
        .map(|(_, storage)| {
            let health = storage.health_check();
            assert!(health.reachable);
            health.backend
        })
        .collect();
    assert_eq!(kinds, vec!["sqlite", "memory"]);
}
