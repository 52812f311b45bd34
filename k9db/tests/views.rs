//! Materialized views stay consistent with committed writes.

use k9db::dataflow::ops::{EquiJoinOperator, JoinMode, MatViewOperator, Operator, ViewOrder};
use k9db::dataflow::{GraphPartition, Key};
use k9db::{Config, Connection, Session};
use k9db_sqlast::{
    ColumnConstraint, ColumnDefinition, ColumnType, CreateTable, Expression, ForeignKeyKind,
    Insert, ResultColumn, Select, Statement, Update, Value,
};
use tempfile::TempDir;

fn open_db() -> (TempDir, Connection) {
    let dir = TempDir::new().unwrap();
    let config = Config::new("views", dir.path());
    let (connection, _) = k9db::open(&config).unwrap();
    (dir, connection)
}

fn setup_schema(session: &mut Session) {
    let users = CreateTable::new("User")
        .column(ColumnDefinition::new("id", ColumnType::Int).with(ColumnConstraint::PrimaryKey))
        .column(ColumnDefinition::new("name", ColumnType::Text))
        .data_subject();
    session.execute(&Statement::CreateTable(users)).unwrap();

    let notes = CreateTable::new("Note")
        .column(ColumnDefinition::new("id", ColumnType::Int).with(ColumnConstraint::PrimaryKey))
        .column(
            ColumnDefinition::new("author", ColumnType::Int).with(ColumnConstraint::ForeignKey {
                foreign_table: "User".into(),
                foreign_column: "id".into(),
                kind: ForeignKeyKind::OwnedBy,
            }),
        )
        .column(ColumnDefinition::new("body", ColumnType::Text));
    session.execute(&Statement::CreateTable(notes)).unwrap();
}

/// users joined with their notes, keyed by user id.
fn install_join_view(connection: &Connection) {
    let user_schema = k9db::dataflow::SchemaRef::new(
        vec!["id".into(), "name".into()],
        vec![ColumnType::Int, ColumnType::Text],
        vec![0],
    );
    let note_schema = k9db::dataflow::SchemaRef::new(
        vec!["id".into(), "author".into(), "body".into()],
        vec![ColumnType::Int, ColumnType::Int, ColumnType::Text],
        vec![0],
    );

    let mut graph = GraphPartition::new();
    let users = graph.add_node(
        Operator::Input {
            table: "User".into(),
            schema: user_schema,
        },
        vec![],
    );
    let notes = graph.add_node(
        Operator::Input {
            table: "Note".into(),
            schema: note_schema,
        },
        vec![],
    );
    let join = graph.add_node(
        Operator::EquiJoin(EquiJoinOperator::new(0, 1, JoinMode::Inner)),
        vec![users, notes],
    );
    graph.add_node(
        Operator::MatView(MatViewOperator::new(vec![0], ViewOrder::Unordered)),
        vec![join],
    );
    // Co-partition both inputs on the user id the join groups by.
    graph.set_input_key("User", vec![0]);
    graph.set_input_key("Note", vec![1]);
    connection.install_view("user_notes", graph);
}

fn insert(session: &mut Session, table: &str, values: Vec<Value>) {
    let mut stmt = Insert::new(table);
    stmt.values = values;
    session.execute(&Statement::Insert(stmt)).unwrap();
}

#[test]
fn join_view_tracks_inserts_updates_and_shard_moves() {
    let (_dir, connection) = open_db();
    let mut session = connection.open_session();
    setup_schema(&mut session);
    install_join_view(&connection);

    insert(&mut session, "User", vec![Value::Int(1), "A".into()]);
    insert(&mut session, "User", vec![Value::Int(2), "B".into()]);
    insert(
        &mut session,
        "Note",
        vec![Value::Int(10), Value::Int(1), "x".into()],
    );
    insert(
        &mut session,
        "Note",
        vec![Value::Int(11), Value::Int(2), "y".into()],
    );

    // SELECT from the view by key.
    let select = Select::new("user_notes")
        .project(vec![ResultColumn::All])
        .filter(Expression::equality("id", 1i64));
    let result = session.execute(&Statement::Select(select)).unwrap();
    let rows = result.into_result_sets().remove(0).into_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].values(),
        &[
            Value::Int(1),
            Value::Text("A".into()),
            Value::Int(10),
            Value::Text("x".into())
        ]
    );

    // Moving the note between users retracts it under the old key and
    // re-emits it under the new one.
    let update = Update::new("Note")
        .set("author", Expression::literal(2i64))
        .filter(Expression::equality("id", 10i64));
    session.execute(&Statement::Update(update)).unwrap();

    let flow = connection.view("user_notes").unwrap();
    assert!(flow.lookup(&Key::from(Value::Int(1)), None, 0).is_empty());
    let rows = flow.lookup(&Key::from(Value::Int(2)), None, 0);
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().any(|r| r.get_int(2) == 10));
    assert!(rows.iter().any(|r| r.get_int(2) == 11));
}

#[test]
fn forget_retracts_from_views() {
    let (_dir, connection) = open_db();
    let mut session = connection.open_session();
    setup_schema(&mut session);
    install_join_view(&connection);

    insert(&mut session, "User", vec![Value::Int(1), "A".into()]);
    insert(
        &mut session,
        "Note",
        vec![Value::Int(10), Value::Int(1), "x".into()],
    );

    let flow = connection.view("user_notes").unwrap();
    assert_eq!(flow.lookup(&Key::from(Value::Int(1)), None, 0).len(), 1);

    session.gdpr_forget("User", Value::Int(1)).unwrap();
    assert!(flow.lookup(&Key::from(Value::Int(1)), None, 0).is_empty());
}

#[test]
fn backfill_populates_view_from_existing_rows() {
    let (_dir, connection) = open_db();
    let mut session = connection.open_session();
    setup_schema(&mut session);

    insert(&mut session, "User", vec![Value::Int(1), "A".into()]);
    insert(
        &mut session,
        "Note",
        vec![Value::Int(10), Value::Int(1), "x".into()],
    );

    // The view arrives after the data.
    install_join_view(&connection);
    connection.backfill_view("user_notes").unwrap();

    let flow = connection.view("user_notes").unwrap();
    assert_eq!(flow.lookup(&Key::from(Value::Int(1)), None, 0).len(), 1);
}
