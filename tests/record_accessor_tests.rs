//! End-to-end tests against an on-disk embedded database
//!
//! Configuration is written as TOML, resolved with explicit environment
//! overrides and dialed through the built-in embedded driver.

use rowbound::config::EmbeddedSettings;
use rowbound::{
    load_config, Connection, ConnectionManager, DataError, DriverKind, Fetched, Model,
    RecordAccessor, Row, Value,
};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

struct Post;

impl Model for Post {
    const TABLE: &'static str = "posts";
}

struct Article;

impl Model for Article {
    const TABLE: &'static str = "articles";
    const PRIMARY_KEY: &'static str = "article_id";
    const CREATED_AT: &'static str = "published_at";
    const UPDATED_AT: &'static str = "revised_at";
}

fn write_config(dir: &Path, database: &Path) -> std::path::PathBuf {
    let path = dir.join("rowbound.toml");
    let body = format!(
        r#"
driver = "embedded-file"
database = "{}"
connect_timeout = 2

[connections.embedded-file]
foreign_key_constraints = true
"#,
        database.display()
    );
    fs::write(&path, body).unwrap();
    path
}

fn create_schema(conn: &mut Connection) {
    conn.execute(
        "CREATE TABLE posts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            body TEXT,
            author TEXT,
            created_at TEXT,
            updated_at TEXT
        )",
        &[],
    )
    .unwrap();
    conn.execute(
        "CREATE TABLE articles (
            article_id INTEGER PRIMARY KEY,
            headline TEXT NOT NULL,
            published_at TEXT,
            revised_at TEXT
        )",
        &[],
    )
    .unwrap();
}

fn manager(dir: &TempDir) -> ConnectionManager {
    let config = load_config(write_config(dir.path(), &dir.path().join("app.db"))).unwrap();
    let settings = ConnectionManager::configure(&config, &HashMap::<String, String>::new()).unwrap();
    assert_eq!(settings.driver, DriverKind::EmbeddedFile);
    ConnectionManager::new(settings)
}

#[test]
fn test_save_then_lookup_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager(&dir);
    let conn = manager.connect().unwrap();
    create_schema(conn);

    let mut posts = RecordAccessor::for_model::<Post>(conn);
    assert!(posts.save(Row::new().with("title", "hello").with("author", "ann")).unwrap());
    assert!(posts.save(Row::new().with("title", "again").with("author", "ann")).unwrap());

    let first = posts.fetch_by_id(1).unwrap().into_option().unwrap();
    assert_eq!(first.get("title"), Some(&Value::from("hello")));
    assert_eq!(first.get("created_at"), first.get("updated_at"));
    assert_eq!(posts.fetch_by_id(42).unwrap(), Fetched::NotFound);

    let by_ann = posts
        .query_by_condition(&Row::new().with("author", "ann"))
        .unwrap()
        .get();
    assert_eq!(by_ann.len(), 2);
    assert_eq!(posts.count().unwrap(), 2);
}

#[test]
fn test_rows_survive_reconnect() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager(&dir);
    {
        let conn = manager.connect().unwrap();
        create_schema(conn);
        let mut posts = RecordAccessor::for_model::<Post>(conn);
        posts.save(Row::new().with("title", "kept")).unwrap();
    }

    let conn = manager.reconnect().unwrap();
    let mut posts = RecordAccessor::for_model::<Post>(conn);
    assert!(posts
        .exists_by_condition(&Row::new().with("title", "kept"))
        .unwrap());
}

#[test]
fn test_model_with_custom_columns() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager(&dir);
    let conn = manager.connect().unwrap();
    create_schema(conn);

    let mut articles = RecordAccessor::for_model::<Article>(conn);
    articles
        .save(Row::new().with("article_id", 7).with("headline", "launch"))
        .unwrap();

    let saved = articles.fetch_by_id(7).unwrap().into_option().unwrap();
    assert!(!saved.get("published_at").unwrap().is_blank());
    assert_eq!(saved.get("published_at"), saved.get("revised_at"));

    let updated = articles
        .quick_update(
            &Row::new().with("headline", "relaunch"),
            &Row::new().with("article_id", 7),
        )
        .unwrap();
    assert_eq!(updated, 1);
    assert!(articles.delete_by_id(7).unwrap());
    assert_eq!(articles.fetch_first_descending().unwrap(), Fetched::NotFound);
}

#[test]
fn test_backend_rejection_is_query_error() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager(&dir);
    let conn = manager.connect().unwrap();
    create_schema(conn);

    let mut posts = RecordAccessor::for_model::<Post>(conn);
    // title is NOT NULL
    let result = posts.save(Row::new().with("body", "untitled"));
    match result {
        Err(e @ DataError::Query(_)) => assert!(!e.is_retryable()),
        other => panic!("Expected Query error, got {:?}", other),
    }
}

#[test]
fn test_environment_overrides_database_path() {
    let dir = TempDir::new().unwrap();
    let config = load_config(write_config(dir.path(), &dir.path().join("ignored.db"))).unwrap();
    let override_path = dir.path().join("override.db");

    let mut env = HashMap::new();
    env.insert("DB_DATABASE".to_string(), override_path.display().to_string());
    env.insert("DB_HOST".to_string(), String::new());
    let settings = ConnectionManager::configure(&config, &env).unwrap();
    assert_eq!(settings.host, None);

    let mut manager = ConnectionManager::new(settings);
    manager.connect().unwrap();
    assert!(override_path.exists());
    assert!(!dir.path().join("ignored.db").exists());
}

#[test]
fn test_missing_backend_block_is_configuration_error() {
    let dir = TempDir::new().unwrap();
    let config = load_config(write_config(dir.path(), &dir.path().join("app.db"))).unwrap();

    let mut env = HashMap::new();
    env.insert("DB_CONNECTION".to_string(), "relational-schema".to_string());
    match ConnectionManager::configure(&config, &env) {
        Err(DataError::Configuration(message)) => {
            assert!(message.contains("[connections.relational-schema]"))
        }
        other => panic!("Expected Configuration error, got {:?}", other),
    }

    env.insert("DB_CONNECTION".to_string(), "flatfile".to_string());
    assert!(matches!(
        ConnectionManager::configure(&config, &env),
        Err(DataError::Configuration(_))
    ));
}

fn with_block_database(dir: &Path, block_path: &Path) -> rowbound::ConnectionConfig {
    let mut config = load_config(write_config(dir, &dir.join("top.db"))).unwrap();
    config.connections.embedded_file = Some(EmbeddedSettings {
        database: Some(block_path.display().to_string()),
        ..EmbeddedSettings::default()
    });
    config
}

#[test]
fn test_embedded_block_database_wins_over_top_level() {
    let dir = TempDir::new().unwrap();
    let block_path = dir.path().join("block.db");
    let config = with_block_database(dir.path(), &block_path);
    let settings = ConnectionManager::configure(&config, &HashMap::<String, String>::new()).unwrap();

    ConnectionManager::new(settings).connect().unwrap();
    assert!(block_path.exists());
    assert!(!dir.path().join("top.db").exists());
}

#[test]
fn test_database_override_wins_over_embedded_block() {
    let dir = TempDir::new().unwrap();
    let block_path = dir.path().join("block.db");
    let env_path = dir.path().join("env.db");
    let config = with_block_database(dir.path(), &block_path);

    let mut env = HashMap::new();
    env.insert("DB_DATABASE".to_string(), env_path.display().to_string());
    let settings = ConnectionManager::configure(&config, &env).unwrap();

    ConnectionManager::new(settings).connect().unwrap();
    assert!(env_path.exists());
    assert!(!block_path.exists());
}
