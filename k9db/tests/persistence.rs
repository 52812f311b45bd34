//! Reopening a database rebuilds schema, indices, keys and counters.

use k9db::sql::SqlResult;
use k9db::{Config, Session};
use k9db_sqlast::{
    ColumnConstraint, ColumnDefinition, ColumnType, CreateTable, CreateView, ForeignKeyKind,
    Insert, Statement, Value,
};
use tempfile::TempDir;

fn setup(session: &mut Session) {
    let users = CreateTable::new("User")
        .column(ColumnDefinition::new("id", ColumnType::Int).with(ColumnConstraint::PrimaryKey))
        .column(ColumnDefinition::new("name", ColumnType::Text))
        .data_subject();
    session.execute(&Statement::CreateTable(users)).unwrap();
    let notes = CreateTable::new("Note")
        .column(
            ColumnDefinition::new("id", ColumnType::Int)
                .with(ColumnConstraint::PrimaryKey)
                .with(ColumnConstraint::AutoIncrement),
        )
        .column(
            ColumnDefinition::new("author", ColumnType::Int).with(ColumnConstraint::ForeignKey {
                foreign_table: "User".into(),
                foreign_column: "id".into(),
                kind: ForeignKeyKind::OwnedBy,
            }),
        )
        .column(ColumnDefinition::new("body", ColumnType::Text))
        .column(ColumnDefinition::new("kind", ColumnType::Text).with(ColumnConstraint::Default(
            Value::Text("plain".into()),
        )));
    session.execute(&Statement::CreateTable(notes)).unwrap();
}

fn gdpr_rows(session: &mut Session, user: i64) -> Vec<Vec<Value>> {
    let result = session.gdpr_get("User", Value::Int(user)).unwrap();
    let SqlResult::ResultSets(sets) = result else {
        panic!()
    };
    sets.iter()
        .flat_map(|set| set.rows().iter().map(|r| r.values().to_vec()))
        .collect()
}

#[test]
fn reopen_restores_schema_data_and_counters() {
    let dir = TempDir::new().unwrap();
    let config = Config::new("persist", dir.path());

    {
        let (connection, _) = k9db::open(&config).unwrap();
        let mut session = connection.open_session();
        setup(&mut session);

        let mut user = Insert::new("User");
        user.values = vec![Value::Int(1), "A".into()];
        session.execute(&Statement::Insert(user)).unwrap();

        // Auto increment and default fill the missing columns.
        let mut note = Insert::new("Note");
        note.columns = vec!["author".into(), "body".into()];
        note.values = vec![Value::Int(1), "x".into()];
        session.execute(&Statement::Insert(note)).unwrap();

        let view = CreateView {
            view_name: "my_view".into(),
            query: "SELECT * FROM Note".into(),
        };
        session.execute(&Statement::CreateView(view)).unwrap();
        drop(session);
        connection.close();
    }

    // Second run: persisted CREATEs re-execute, views come back for the
    // planner.
    let (connection, views) = k9db::open(&config).unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].view_name, "my_view");

    let mut session = connection.open_session();
    let rows = gdpr_rows(&mut session, 1);
    assert!(rows.iter().any(|r| r[0] == Value::Int(1)
        && r.len() == 4
        && r[3] == Value::Text("plain".into())));

    // The counter resumed past the stored maximum.
    let mut note = Insert::new("Note");
    note.columns = vec!["author".into(), "body".into()];
    note.values = vec![Value::Int(1), "y".into()];
    session.execute(&Statement::Insert(note)).unwrap();
    let rows = gdpr_rows(&mut session, 1);
    let ids: Vec<i64> = rows
        .iter()
        .filter(|r| r.len() == 4)
        .map(|r| r[0].as_int())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids[0] != ids[1]);
}

#[test]
fn reopen_does_not_duplicate_persisted_statements() {
    let dir = TempDir::new().unwrap();
    let config = Config::new("persist2", dir.path());
    {
        let (connection, _) = k9db::open(&config).unwrap();
        let mut session = connection.open_session();
        setup(&mut session);
        drop(session);
        connection.close();
    }
    {
        let (connection, _) = k9db::open(&config).unwrap();
        connection.close();
    }
    // A third open still sees exactly the two tables.
    let (connection, views) = k9db::open(&config).unwrap();
    assert!(views.is_empty());
    let mut session = connection.open_session();
    let mut user = Insert::new("User");
    user.values = vec![Value::Int(5), "E".into()];
    session.execute(&Statement::Insert(user)).unwrap();
    assert_eq!(gdpr_rows(&mut session, 5).len(), 1);
}
