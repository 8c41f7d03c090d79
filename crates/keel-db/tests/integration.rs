use std::sync::Arc;

use keel_db::scope::{self, run_scoped};
use keel_db::{
    Column, ColumnType, Database, DatabaseUrl, DbError, DbRuntimeSettings, Metadata, Model,
    ModelExt, OnDelete, Order, Row, Value,
};
use keel_types::{AuditOperation, RequestInfo};

#[derive(Debug, Clone, PartialEq)]
struct User {
    id: Option<i64>,
    name: String,
}

impl User {
    fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
        }
    }
}

impl Model for User {
    const COLUMNS: &'static [Column] = &[Column::new("name", ColumnType::Text)
        .length(255)
        .not_null()
        .unique()];
    const AUDITED: bool = true;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: Option<i64>) {
        self.id = id;
    }

    fn values(&self) -> Vec<Value> {
        vec![self.name.clone().into()]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Post {
    id: Option<i64>,
    title: String,
    user_id: Option<i64>,
}

impl Model for Post {
    const COLUMNS: &'static [Column] = &[
        Column::new("title", ColumnType::Text).not_null(),
        Column::new("user_id", ColumnType::Integer).references("user", OnDelete::Restrict),
    ];

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: Option<i64>) {
        self.id = id;
    }

    fn values(&self) -> Vec<Value> {
        vec![self.title.clone().into(), self.user_id.into()]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            title: row.get("title")?,
            user_id: row.get("user_id")?,
        })
    }
}

fn setup() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let url =
        DatabaseUrl::parse(&format!("sqlite:///{}", dir.path().join("app.db").display())).unwrap();
    let metadata = Metadata::new().register::<User>().register::<Post>();
    let db = Database::connect(&url, DbRuntimeSettings::default(), metadata).unwrap();
    db.create_all().unwrap();
    (dir, db)
}

#[tokio::test]
async fn test_ted_is_saved_and_fetched_in_one_request() {
    let (_dir, db) = setup();

    // 1. First request saves and reads back through the same session
    let (key1, ted, session1) = run_scoped(db.scope(RequestInfo::task()), async {
        let mut ted = User::new("ted");
        ted.save().await.unwrap();
        assert!(ted.id.is_some());

        let found = User::get_or_fail(ted.id.unwrap()).await.unwrap();
        assert_eq!(found, ted);
        (
            scope::current_key().unwrap(),
            ted,
            scope::current_session().await.unwrap(),
        )
    })
    .await;

    // 2. Nothing is left behind
    assert!(!db.registry().has(key1));
    assert!(session1.is_closed());

    // 3. A second request gets a new key and a new session
    let (key2, session2) = run_scoped(db.scope(RequestInfo::task()), async {
        let found = User::get_or_fail(ted.id.unwrap()).await.unwrap();
        assert_eq!(found.name, "ted");
        (
            scope::current_key().unwrap(),
            scope::current_session().await.unwrap(),
        )
    })
    .await;

    assert_ne!(key1, key2);
    assert!(!Arc::ptr_eq(&session1, &session2));
    assert!(db.registry().is_empty());
}

#[tokio::test]
async fn test_model_operations_require_a_scope() {
    let (_dir, _db) = setup();

    let err = User::get_or_fail(1).await.unwrap_err();
    assert!(matches!(err, DbError::NoActiveScope));

    let mut user = User::new("nobody");
    assert!(matches!(user.save().await, Err(DbError::NoActiveScope)));
}

#[tokio::test]
async fn test_round_trip_refresh_and_delete() {
    let (_dir, db) = setup();

    run_scoped(db.scope(RequestInfo::task()), async {
        let mut ted = User::new("ted");
        ted.save().await.unwrap();
        let id = ted.id.unwrap();

        // Unsaved in-memory changes are overwritten by a refresh
        ted.name = "bob".to_string();
        ted.refresh_from_db().await.unwrap();
        assert_eq!(ted.name, "ted");

        // Updates keep the id
        ted.name = "theodore".to_string();
        ted.save().await.unwrap();
        assert_eq!(ted.id, Some(id));
        assert_eq!(User::get_or_fail(id).await.unwrap().name, "theodore");

        ted.delete().await.unwrap();
        let err = User::get_or_fail(id).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(User::get(id).await.unwrap().is_none());

        // Deleting twice reports the missing row
        assert!(ted.delete().await.unwrap_err().is_not_found());
    })
    .await;
}

#[tokio::test]
async fn test_failed_save_rolls_back() {
    let (_dir, db) = setup();

    run_scoped(db.scope(RequestInfo::task()), async {
        User::new("ted").save().await.unwrap();

        // Violates the unique constraint on name
        let mut dup = User::new("ted");
        let err = dup.save().await.unwrap_err();
        assert!(matches!(err, DbError::Sqlite(_)));
        assert_eq!(dup.id, None);

        // The session is still usable afterwards
        let session = scope::current_session().await.unwrap();
        assert!(!session.in_transaction());
        assert_eq!(User::count().await.unwrap(), 1);
    })
    .await;
}

#[tokio::test]
async fn test_query_filters_orders_and_pages() {
    let (_dir, db) = setup();

    run_scoped(db.scope(RequestInfo::task()), async {
        for name in ["carol", "alice", "bob"] {
            User::new(name).save().await.unwrap();
        }

        let session = scope::current_session().await.unwrap();
        let names = tokio::task::spawn_blocking(move || {
            let ordered: Vec<String> = session
                .query::<User>()
                .order_by("name", Order::Asc)
                .all()?
                .into_iter()
                .map(|u| u.name)
                .collect();

            let bob = session.query::<User>().filter_by("name", "bob".to_string()).first()?;
            assert_eq!(bob.map(|u| u.name), Some("bob".to_string()));

            let page: Vec<String> = session
                .query::<User>()
                .order_by("name", Order::Desc)
                .offset(1)
                .limit(1)
                .all()?
                .into_iter()
                .map(|u| u.name)
                .collect();
            assert_eq!(page, vec!["bob"]);

            let bad = session.query::<User>().filter_by("nope", 1).all();
            assert!(matches!(
                bad,
                Err(DbError::Sqlite(rusqlite::Error::InvalidColumnName(_)))
            ));
            Ok::<_, DbError>(ordered)
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(names, vec!["alice", "bob", "carol"]);
        assert_eq!(User::all().await.unwrap().len(), 3);
    })
    .await;
}

#[tokio::test]
async fn test_can_be_deleted_respects_restrict() {
    let (_dir, db) = setup();

    run_scoped(db.scope(RequestInfo::task()), async {
        let mut ted = User::new("ted");
        ted.save().await.unwrap();
        assert!(ted.can_be_deleted().await.unwrap());

        let mut post = Post {
            id: None,
            title: "hello".to_string(),
            user_id: ted.id,
        };
        post.save().await.unwrap();
        assert!(!ted.can_be_deleted().await.unwrap());

        // The database enforces the same rule
        assert!(matches!(ted.delete().await, Err(DbError::Sqlite(_))));

        post.delete().await.unwrap();
        assert!(ted.can_be_deleted().await.unwrap());
        ted.delete().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_audit_log_records_changes_with_actor() {
    let (_dir, db) = setup();

    let request = db.scope(RequestInfo::task()).with_actor(Some(7));
    run_scoped(request, async {
        let mut ted = User::new("ted");
        ted.save().await.unwrap();
        ted.name = "theodore".to_string();
        ted.save().await.unwrap();
        ted.delete().await.unwrap();

        let log = ted.audit_log().await.unwrap();
        let ops: Vec<AuditOperation> = log.iter().map(|e| e.operation).collect();
        assert_eq!(
            ops,
            vec![
                AuditOperation::Insert,
                AuditOperation::Update,
                AuditOperation::Delete
            ]
        );
        assert!(log.iter().all(|e| e.created_by_id == Some(7)));
        assert!(log.iter().all(|e| e.discriminator == "user"));
        assert_eq!(log[0].data["name"], "ted");
        assert_eq!(log[1].data["name"], "theodore");

        // Posts are not audited
        let mut post = Post {
            id: None,
            title: "quiet".to_string(),
            user_id: None,
        };
        post.save().await.unwrap();
        assert!(post.audit_log().await.unwrap().is_empty());
    })
    .await;
}

#[test]
fn test_uncommitted_writes_are_isolated_between_requests() {
    let (_dir, db) = setup();
    let registry = db.registry().clone();

    let a = registry.resolve(keel_types::ContextKey::mint()).unwrap();
    let b = registry.resolve(keel_types::ContextKey::mint()).unwrap();
    assert!(!Arc::ptr_eq(&a, &b));

    a.begin().unwrap();
    a.with_connection(|conn| {
        conn.execute("INSERT INTO \"user\" (name) VALUES ('pending')", [])?;
        Ok(())
    })
    .unwrap();

    assert_eq!(a.query::<User>().count().unwrap(), 1);
    assert_eq!(b.query::<User>().count().unwrap(), 0);

    registry.remove(a.key());
    assert_eq!(b.query::<User>().count().unwrap(), 0);
    registry.remove(b.key());
    assert!(registry.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_leak_under_concurrent_requests() {
    let (_dir, db) = setup();

    let tasks: Vec<_> = (0..40)
        .map(|i| {
            let request = db.scope(RequestInfo::task());
            tokio::spawn(run_scoped(request, async move {
                let mut user = User::new(&format!("user-{i}"));
                user.save().await.unwrap();
                let again = User::get_or_fail(user.id.unwrap()).await.unwrap();
                assert_eq!(again, user);
            }))
        })
        .collect();

    for task in futures_util::future::join_all(tasks).await {
        task.unwrap();
    }

    assert!(db.registry().is_empty());

    run_scoped(db.scope(RequestInfo::task()), async {
        assert_eq!(User::count().await.unwrap(), 40);
    })
    .await;
}

#[tokio::test]
async fn test_error_and_panic_in_scope_still_clean_up() {
    let (_dir, db) = setup();

    // Error result
    let request = db.scope(RequestInfo::task());
    let key = request.key();
    let result: Result<(), DbError> = run_scoped(request, async {
        scope::current_session().await?;
        User::get_or_fail(999).await.map(|_| ())
    })
    .await;
    assert!(result.unwrap_err().is_not_found());
    assert!(!db.registry().has(key));

    // Panic
    let request = db.scope(RequestInfo::task());
    let key = request.key();
    let handle = tokio::spawn(run_scoped(request, async {
        scope::current_session().await.unwrap();
        panic!("handler blew up");
    }));
    assert!(handle.await.unwrap_err().is_panic());
    assert!(!db.registry().has(key));
}

#[tokio::test]
async fn test_truncate_all_with_force() {
    let (_dir, db) = setup();

    run_scoped(db.scope(RequestInfo::task()), async {
        let mut ted = User::new("ted");
        ted.save().await.unwrap();
        Post {
            id: None,
            title: "hello".to_string(),
            user_id: ted.id,
        }
        .save()
        .await
        .unwrap();
    })
    .await;

    let report = db.truncate_all(true).unwrap();
    assert!(report.is_complete());
    assert_eq!(report.cleared, vec!["post", "audit_log", "user"]);
}
