//! Snapshot tests for rendered statements and user-facing messages

use insta::assert_snapshot;
use rowbound::config::{EnterpriseSettings, SchemaSettings};
use rowbound::{
    configure, ConnectionConfig, Connection, Connector, DataError, Direction, DriverKind, JoinKind,
    NativeHandle, QueryBuilder, ResultSet, Row, Value,
};
use std::collections::{BTreeMap, HashMap};

struct NullHandle;

impl NativeHandle for NullHandle {
    fn query(&mut self, _sql: &str, _params: &[Value]) -> rowbound::Result<ResultSet> {
        Ok(ResultSet::default())
    }

    fn execute(&mut self, _sql: &str, _params: &[Value]) -> rowbound::Result<u64> {
        Ok(0)
    }

    fn run_command(&mut self, _command: &str) -> rowbound::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> rowbound::Result<()> {
        Ok(())
    }
}

fn render(driver: DriverKind, prefix: &str) -> String {
    let mut conn = Connection::new(driver, prefix, Box::new(NullHandle));
    let mut qb = QueryBuilder::new(&mut conn);
    qb.select("posts", &["posts.id", "posts.title", "users.email"])
        .unwrap()
        .join("users", "users.id = posts.user_id", JoinKind::Inner)
        .unwrap()
        .where_eq("posts.status", "published")
        .unwrap()
        .where_in("posts.category_id", [3, 5])
        .unwrap()
        .where_not("posts.archived")
        .order_by("posts.created_at", Direction::Desc)
        .unwrap()
        .limit(10);
    qb.to_sql().unwrap().0
}

#[test]
fn test_select_per_dialect() {
    assert_snapshot!(
        render(DriverKind::RelationalTuned, ""),
        @"SELECT posts.id, posts.title, users.email FROM posts INNER JOIN users ON users.id = posts.user_id WHERE posts.status = ? AND posts.category_id IN (?, ?) AND NOT posts.archived ORDER BY posts.created_at DESC LIMIT 10"
    );
    assert_snapshot!(
        render(DriverKind::RelationalSchema, ""),
        @"SELECT posts.id, posts.title, users.email FROM posts INNER JOIN users ON users.id = posts.user_id WHERE posts.status = $1 AND posts.category_id IN ($2, $3) AND NOT posts.archived ORDER BY posts.created_at DESC LIMIT 10"
    );
    assert_snapshot!(
        render(DriverKind::EnterpriseSql, ""),
        @"SELECT TOP 10 posts.id, posts.title, users.email FROM posts INNER JOIN users ON users.id = posts.user_id WHERE posts.status = @P1 AND posts.category_id IN (@P2, @P3) AND NOT posts.archived ORDER BY posts.created_at DESC"
    );
}

#[test]
fn test_update_with_prefix() {
    let mut conn = Connection::new(DriverKind::RelationalSchema, "blog_", Box::new(NullHandle));
    let mut qb = QueryBuilder::new(&mut conn);
    let changes = Row::new().with("title", "renamed").with("updated_at", Value::Null);
    qb.update("posts", &changes).unwrap().where_eq("id", 9).unwrap();
    assert_snapshot!(qb.to_sql().unwrap().0, @"UPDATE blog_posts SET title = $1, updated_at = $2 WHERE id = $3");
}

#[test]
fn test_connect_plan_for_schema_backend() {
    let mut blocks = ConnectionConfig {
        driver: Some("relational-schema".to_string()),
        host: Some("pg.internal".to_string()),
        username: Some("app".to_string()),
        password: Some("s3cret".to_string()),
        database: Some("blog".to_string()),
        ..ConnectionConfig::default()
    };
    blocks.connections.relational_schema = Some(SchemaSettings {
        schema: Some("content".to_string()),
        sslmode: Some("require".to_string()),
        ..SchemaSettings::default()
    });

    let settings = configure(&blocks, &HashMap::<String, String>::new()).unwrap();
    let plan = settings.connector.plan(&settings).unwrap();
    assert_snapshot!(
        plan.target.redacted(),
        @"host=pg.internal port=5432 dbname=blog user=app password=*** options='-c search_path=content' sslmode=require"
    );
}

#[test]
fn test_enterprise_plan_rejects_unsafe_option_values() {
    let mut options = BTreeMap::new();
    options.insert("LOCK_TIMEOUT".to_string(), "1000; DROP TABLE users".to_string());
    let connector = Connector::EnterpriseSql(EnterpriseSettings {
        options,
        ..EnterpriseSettings::default()
    });
    let config = ConnectionConfig {
        driver: Some("enterprise-sql".to_string()),
        ..ConnectionConfig::default()
    };
    let mut env = HashMap::new();
    env.insert("DB_CONNECTION".to_string(), "enterprise-sql".to_string());
    assert!(matches!(configure(&config, &env), Err(DataError::Configuration(_))));

    let mut settings = {
        let mut with_block = config.clone();
        with_block.connections.enterprise_sql = Some(EnterpriseSettings::default());
        configure(&with_block, &env).unwrap()
    };
    settings.connector = connector;
    let err = settings.connector.plan(&settings).unwrap_err();
    assert_snapshot!(err.public_message(false), @"Configuration error: invalid value '1000; DROP TABLE users' for session option 'LOCK_TIMEOUT'");
}

#[test]
fn test_public_messages_hide_backend_detail() {
    let err = DataError::connection("relational-tuned", "Access denied for user 'app'@'10.0.0.7'");
    assert_snapshot!(err.public_message(false), @"Unable to connect to the database.");
    assert_snapshot!(err.public_message(true), @"Connection error (relational-tuned): Access denied for user 'app'@'10.0.0.7'");
}
