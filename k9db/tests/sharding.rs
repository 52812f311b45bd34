//! End-to-end sharding scenarios against a real store.

use k9db::sql::SqlResult;
use k9db::{Config, Connection, Session};
use k9db_sqlast::{
    ColumnConstraint, ColumnDefinition, ColumnType, CreateTable, Expression, ForeignKeyKind,
    Insert, Statement, Update, Value,
};
use tempfile::TempDir;

fn open_db() -> (TempDir, Connection) {
    let dir = TempDir::new().unwrap();
    let config = Config::new("test", dir.path());
    let (connection, views) = k9db::open(&config).unwrap();
    assert!(views.is_empty());
    (dir, connection)
}

fn fk(
    name: &str,
    foreign_table: &str,
    foreign_column: &str,
    kind: ForeignKeyKind,
) -> ColumnDefinition {
    ColumnDefinition::new(name, ColumnType::Int).with(ColumnConstraint::ForeignKey {
        foreign_table: foreign_table.into(),
        foreign_column: foreign_column.into(),
        kind,
    })
}

fn user_table() -> CreateTable {
    CreateTable::new("User")
        .column(ColumnDefinition::new("id", ColumnType::Int).with(ColumnConstraint::PrimaryKey))
        .column(ColumnDefinition::new("name", ColumnType::Text))
        .data_subject()
}

fn note_table() -> CreateTable {
    CreateTable::new("Note")
        .column(ColumnDefinition::new("id", ColumnType::Int).with(ColumnConstraint::PrimaryKey))
        .column(fk("author", "User", "id", ForeignKeyKind::OwnedBy))
        .column(ColumnDefinition::new("body", ColumnType::Text))
}

fn insert(session: &mut Session, table: &str, values: Vec<Value>) {
    let mut stmt = Insert::new(table);
    stmt.values = values;
    session
        .execute(&Statement::Insert(stmt))
        .unwrap_or_else(|e| panic!("insert into {} failed: {}", table, e));
}

/// All rows of a GDPR GET, flattened to value vectors.
fn gdpr_rows(session: &mut Session, kind: &str, user: i64) -> Vec<Vec<Value>> {
    let result = session.gdpr_get(kind, Value::Int(user)).unwrap();
    let SqlResult::ResultSets(sets) = result else {
        panic!("GDPR GET did not return result sets");
    };
    sets.iter()
        .flat_map(|set| set.rows().iter().map(|r| r.values().to_vec()))
        .collect()
}

fn contains(rows: &[Vec<Value>], wanted: &[Value]) -> bool {
    rows.iter().any(|r| r == wanted)
}

#[test]
fn sharded_insert_and_isolation() {
    let (_dir, connection) = open_db();
    let mut session = connection.open_session();
    session
        .execute(&Statement::CreateTable(user_table()))
        .unwrap();
    session
        .execute(&Statement::CreateTable(note_table()))
        .unwrap();

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

    let rows = gdpr_rows(&mut session, "User", 1);
    assert_eq!(rows.len(), 2);
    assert!(contains(&rows, &[Value::Int(1), "A".into()]));
    assert!(contains(&rows, &[Value::Int(10), Value::Int(1), "x".into()]));
    assert!(!contains(&rows, &[Value::Int(11), Value::Int(2), "y".into()]));

    let rows = gdpr_rows(&mut session, "User", 2);
    assert_eq!(rows.len(), 2);
    assert!(contains(&rows, &[Value::Int(2), "B".into()]));
    assert!(contains(&rows, &[Value::Int(11), Value::Int(2), "y".into()]));
}

#[test]
fn transitive_ownership() {
    let (_dir, connection) = open_db();
    let mut session = connection.open_session();
    session
        .execute(&Statement::CreateTable(user_table()))
        .unwrap();
    session
        .execute(&Statement::CreateTable(note_table()))
        .unwrap();
    let tags = CreateTable::new("Tag")
        .column(ColumnDefinition::new("id", ColumnType::Int).with(ColumnConstraint::PrimaryKey))
        .column(fk("note", "Note", "id", ForeignKeyKind::OwnedBy))
        .column(ColumnDefinition::new("label", ColumnType::Text));
    session.execute(&Statement::CreateTable(tags)).unwrap();

    insert(&mut session, "User", vec![Value::Int(1), "A".into()]);
    insert(&mut session, "User", vec![Value::Int(2), "B".into()]);
    insert(
        &mut session,
        "Note",
        vec![Value::Int(10), Value::Int(1), "x".into()],
    );
    insert(
        &mut session,
        "Tag",
        vec![Value::Int(100), Value::Int(10), "red".into()],
    );

    let rows = gdpr_rows(&mut session, "User", 1);
    assert!(contains(
        &rows,
        &[Value::Int(100), Value::Int(10), "red".into()]
    ));
    let rows = gdpr_rows(&mut session, "User", 2);
    assert!(!contains(
        &rows,
        &[Value::Int(100), Value::Int(10), "red".into()]
    ));
}

#[test]
fn variable_ownership_cascades_into_owner_shard() {
    let (_dir, connection) = open_db();
    let mut session = connection.open_session();
    session
        .execute(&Statement::CreateTable(user_table()))
        .unwrap();
    let groups = CreateTable::new("Group")
        .column(ColumnDefinition::new("gid", ColumnType::Int).with(ColumnConstraint::PrimaryKey))
        .data_subject();
    session.execute(&Statement::CreateTable(groups)).unwrap();
    let members = CreateTable::new("Member")
        .column(ColumnDefinition::new("id", ColumnType::Int).with(ColumnConstraint::PrimaryKey))
        .column(fk("gid", "Group", "gid", ForeignKeyKind::Owns))
        .column(fk("uid", "User", "id", ForeignKeyKind::OwnedBy));
    session.execute(&Statement::CreateTable(members)).unwrap();

    insert(&mut session, "User", vec![Value::Int(1), "A".into()]);
    insert(&mut session, "Group", vec![Value::Int(7)]);
    insert(
        &mut session,
        "Member",
        vec![Value::Int(1), Value::Int(7), Value::Int(1)],
    );

    // The membership pulls the group row into User 1's shard.
    let rows = gdpr_rows(&mut session, "User", 1);
    assert!(contains(&rows, &[Value::Int(7)]));
}

#[test]
fn forget_deletes_exclusively_owned_and_keeps_shared() {
    let (_dir, connection) = open_db();
    let mut session = connection.open_session();
    session
        .execute(&Statement::CreateTable(user_table()))
        .unwrap();
    session
        .execute(&Statement::CreateTable(note_table()))
        .unwrap();
    // Association table sharing a note into another user's shard.
    let shares = CreateTable::new("NoteShare")
        .column(ColumnDefinition::new("id", ColumnType::Int).with(ColumnConstraint::PrimaryKey))
        .column(fk("note", "Note", "id", ForeignKeyKind::Owns))
        .column(fk("user", "User", "id", ForeignKeyKind::OwnedBy));
    session.execute(&Statement::CreateTable(shares)).unwrap();

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
        vec![Value::Int(12), Value::Int(1), "shared".into()],
    );
    insert(
        &mut session,
        "NoteShare",
        vec![Value::Int(1), Value::Int(12), Value::Int(2)],
    );

    session.gdpr_forget("User", Value::Int(1)).unwrap();

    // Note 10 is gone with its only owner; note 12 survives through the
    // share.
    let rows = gdpr_rows(&mut session, "User", 2);
    assert!(contains(
        &rows,
        &[Value::Int(12), Value::Int(1), "shared".into()]
    ));
    assert!(!contains(&rows, &[Value::Int(10), Value::Int(1), "x".into()]));
}

#[test]
fn forget_reuse_of_user_id_sees_no_old_data() {
    let (_dir, connection) = open_db();
    let mut session = connection.open_session();
    session
        .execute(&Statement::CreateTable(user_table()))
        .unwrap();
    session
        .execute(&Statement::CreateTable(note_table()))
        .unwrap();

    insert(&mut session, "User", vec![Value::Int(1), "A".into()]);
    insert(
        &mut session,
        "Note",
        vec![Value::Int(10), Value::Int(1), "x".into()],
    );
    session.gdpr_forget("User", Value::Int(1)).unwrap();

    insert(&mut session, "User", vec![Value::Int(1), "A2".into()]);
    let rows = gdpr_rows(&mut session, "User", 1);
    assert_eq!(rows.len(), 1);
    assert!(contains(&rows, &[Value::Int(1), "A2".into()]));
}

#[test]
fn update_moves_row_and_cascades_dependents() {
    let (_dir, connection) = open_db();
    let mut session = connection.open_session();
    session
        .execute(&Statement::CreateTable(user_table()))
        .unwrap();
    session
        .execute(&Statement::CreateTable(note_table()))
        .unwrap();
    let tags = CreateTable::new("Tag")
        .column(ColumnDefinition::new("id", ColumnType::Int).with(ColumnConstraint::PrimaryKey))
        .column(fk("note", "Note", "id", ForeignKeyKind::OwnedBy))
        .column(ColumnDefinition::new("label", ColumnType::Text));
    session.execute(&Statement::CreateTable(tags)).unwrap();

    insert(&mut session, "User", vec![Value::Int(1), "A".into()]);
    insert(&mut session, "User", vec![Value::Int(2), "B".into()]);
    insert(
        &mut session,
        "Note",
        vec![Value::Int(10), Value::Int(1), "x".into()],
    );
    insert(
        &mut session,
        "Tag",
        vec![Value::Int(100), Value::Int(10), "red".into()],
    );

    let update = Update::new("Note")
        .set("author", Expression::literal(2i64))
        .filter(Expression::equality("id", 10i64));
    session.execute(&Statement::Update(update)).unwrap();

    let rows = gdpr_rows(&mut session, "User", 1);
    assert!(!contains(&rows, &[Value::Int(10), Value::Int(2), "x".into()]));
    assert!(!contains(
        &rows,
        &[Value::Int(100), Value::Int(10), "red".into()]
    ));

    let rows = gdpr_rows(&mut session, "User", 2);
    assert!(contains(&rows, &[Value::Int(10), Value::Int(2), "x".into()]));
    assert!(contains(
        &rows,
        &[Value::Int(100), Value::Int(10), "red".into()]
    ));
}

#[test]
fn orphan_insert_and_reclaim() {
    let (_dir, connection) = open_db();
    let mut session = connection.open_session();
    session
        .execute(&Statement::CreateTable(user_table()))
        .unwrap();
    session
        .execute(&Statement::CreateTable(note_table()))
        .unwrap();

    insert(&mut session, "User", vec![Value::Int(1), "A".into()]);
    // No owner value: the row lands in the default shard as an orphan.
    insert(
        &mut session,
        "Note",
        vec![Value::Int(13), Value::Null, "z".into()],
    );
    assert_eq!(session.orphans("Note"), 1);
    let rows = gdpr_rows(&mut session, "User", 1);
    assert!(!contains(&rows, &[Value::Int(13), Value::Null, "z".into()]));

    // Assigning an owner moves it out of the default shard and clears the
    // orphan entry.
    let update = Update::new("Note")
        .set("author", Expression::literal(1i64))
        .filter(Expression::equality("id", 13i64));
    session.execute(&Statement::Update(update)).unwrap();
    assert_eq!(session.orphans("Note"), 0);
    let rows = gdpr_rows(&mut session, "User", 1);
    assert!(contains(&rows, &[Value::Int(13), Value::Int(1), "z".into()]));
}

#[test]
fn pk_collision_and_missing_fk_are_rejected() {
    let (_dir, connection) = open_db();
    let mut session = connection.open_session();
    session
        .execute(&Statement::CreateTable(user_table()))
        .unwrap();
    session
        .execute(&Statement::CreateTable(note_table()))
        .unwrap();

    insert(&mut session, "User", vec![Value::Int(1), "A".into()]);
    insert(
        &mut session,
        "Note",
        vec![Value::Int(10), Value::Int(1), "x".into()],
    );

    let mut duplicate = Insert::new("Note");
    duplicate.values = vec![Value::Int(10), Value::Int(1), "again".into()];
    assert!(session.execute(&Statement::Insert(duplicate)).is_err());

    let mut dangling = Insert::new("Note");
    dangling.values = vec![Value::Int(20), Value::Int(99), "nope".into()];
    assert!(session.execute(&Statement::Insert(dangling)).is_err());

    // Failed statements left nothing behind.
    let rows = gdpr_rows(&mut session, "User", 1);
    assert_eq!(rows.len(), 2);
}

#[test]
fn delete_respects_referential_integrity() {
    let (_dir, connection) = open_db();
    let mut session = connection.open_session();
    session
        .execute(&Statement::CreateTable(user_table()))
        .unwrap();
    session
        .execute(&Statement::CreateTable(note_table()))
        .unwrap();

    insert(&mut session, "User", vec![Value::Int(1), "A".into()]);
    insert(
        &mut session,
        "Note",
        vec![Value::Int(10), Value::Int(1), "x".into()],
    );

    // The note still references the user.
    let delete = k9db_sqlast::Delete::new("User").filter(Expression::equality("id", 1i64));
    assert!(session.execute(&Statement::Delete(delete)).is_err());

    // Remove the note first, then the user delete goes through.
    let delete = k9db_sqlast::Delete::new("Note").filter(Expression::equality("id", 10i64));
    session.execute(&Statement::Delete(delete)).unwrap();
    let delete = k9db_sqlast::Delete::new("User").filter(Expression::equality("id", 1i64));
    session.execute(&Statement::Delete(delete)).unwrap();
}

/// `(action, target)` lines of one EXPLAIN.
fn explain_lines(session: &mut Session, statement: Statement) -> Vec<(String, String)> {
    let explain = Statement::Explain(k9db_sqlast::ExplainQuery {
        query: Box::new(statement),
    });
    let result = session.execute(&explain).unwrap();
    let SqlResult::ResultSets(sets) = result else {
        panic!("EXPLAIN did not return rows");
    };
    sets[0]
        .rows()
        .iter()
        .map(|r| {
            (
                r.get_value(0).as_unquoted_string(),
                r.get_value(1).as_unquoted_string(),
            )
        })
        .collect()
}

#[test]
fn explain_previews_physical_actions() {
    let (_dir, connection) = open_db();
    let mut session = connection.open_session();
    session
        .execute(&Statement::CreateTable(user_table()))
        .unwrap();
    session
        .execute(&Statement::CreateTable(note_table()))
        .unwrap();

    let mut stmt = Insert::new("Note");
    stmt.values = vec![Value::Int(10), Value::Int(1), "x".into()];
    let lines = explain_lines(&mut session, Statement::Insert(stmt));
    assert!(lines.iter().any(|(a, _)| a == "INSERT [User#author]"));
    assert!(lines.iter().any(|(a, _)| a == "INDEX UPDATE"));
}

#[test]
fn explain_delete_shows_owner_removals_and_cascades() {
    let (_dir, connection) = open_db();
    let mut session = connection.open_session();
    session
        .execute(&Statement::CreateTable(user_table()))
        .unwrap();
    session
        .execute(&Statement::CreateTable(note_table()))
        .unwrap();
    let shares = CreateTable::new("NoteShare")
        .column(ColumnDefinition::new("id", ColumnType::Int).with(ColumnConstraint::PrimaryKey))
        .column(fk("note", "Note", "id", ForeignKeyKind::Owns))
        .column(fk("user", "User", "id", ForeignKeyKind::OwnedBy));
    session.execute(&Statement::CreateTable(shares)).unwrap();

    // One DELETE line per owner of the table, with the chosen index.
    let delete = k9db_sqlast::Delete::new("Note").filter(Expression::equality("id", 10i64));
    let lines = explain_lines(&mut session, Statement::Delete(delete));
    assert!(lines
        .iter()
        .any(|(a, t)| a == "DELETE [User#author]" && t == "Note USING PK (id)"));
    assert!(lines.iter().any(|(a, _)| a == "INDEX UPDATE"));

    // Deleting from the association table cascades a removal into the
    // variably owned target.
    let delete = k9db_sqlast::Delete::new("NoteShare").filter(Expression::equality("id", 1i64));
    let lines = explain_lines(&mut session, Statement::Delete(delete));
    assert!(lines
        .iter()
        .any(|(a, t)| a == "DELETE [User#user]" && t == "NoteShare USING PK (id)"));
    assert!(lines
        .iter()
        .any(|(a, t)| a == "DELETE [User#id]" && t == "Note BY id"));

    // An update previews as its delete half followed by its insert half.
    let update = Update::new("Note")
        .set("author", Expression::literal(2i64))
        .filter(Expression::equality("id", 10i64));
    let lines = explain_lines(&mut session, Statement::Update(update));
    let delete_at = lines
        .iter()
        .position(|(a, _)| a == "DELETE [User#author]")
        .unwrap();
    let insert_at = lines
        .iter()
        .position(|(a, _)| a == "INSERT [User#author]")
        .unwrap();
    assert!(delete_at < insert_at);
}

#[test]
fn policies_tag_reads_and_serialize() {
    let (_dir, connection) = open_db();
    let mut session = connection.open_session();
    session
        .execute(&Statement::CreateTable(user_table()))
        .unwrap();
    session
        .execute(&Statement::CreateTable(note_table()))
        .unwrap();
    let policy = k9db_sqlast::CreatePolicy {
        table_name: "Note".into(),
        column: "body".into(),
        combination: k9db_sqlast::PolicyCombination::Single,
        clauses: vec![k9db_sqlast::PolicyClause {
            name: "AccessControl".into(),
            expressions: vec![
                k9db_sqlast::PolicyExpression::Column("author".into()),
                k9db_sqlast::PolicyExpression::Literal("admin".into()),
            ],
        }],
    };
    session
        .execute(&Statement::CreatePolicy(policy))
        .unwrap();

    insert(&mut session, "User", vec![Value::Int(1), "A".into()]);
    insert(
        &mut session,
        "Note",
        vec![Value::Int(10), Value::Int(1), "x".into()],
    );

    // The read comes back with a serialized-policy column.
    let select = k9db_sqlast::Select::new("Note").filter(Expression::equality("id", 10i64));
    let result = session.execute(&Statement::Select(select)).unwrap();
    let set = result.into_result_sets().remove(0);
    assert_eq!(set.schema().size(), 4);
    assert_eq!(set.schema().name_of(3), "__policies");
    assert_eq!(
        set.rows()[0].get_value(3),
        Value::Text("body: AccessControl(1, 'admin')".into())
    );

    // GDPR GET is tagged the same way; untagged tables keep their shape.
    let rows = gdpr_rows(&mut session, "User", 1);
    assert!(rows
        .iter()
        .any(|r| r.len() == 4
            && r[3] == Value::Text("body: AccessControl(1, 'admin')".into())));
    assert!(rows.iter().any(|r| r.len() == 2 && r[0] == Value::Int(1)));
}
