use std::sync::Arc;
use std::thread;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use tasknotes_core::frontmatter::{self, Header};
use tasknotes_core::record::{Container, Family, NoteKind, TaskStatus};
use tasknotes_core::store::RecordStore;
use tasknotes_core::workspace::{init_local, resolve, ResolveRequest, RootOverrides};

fn write_task(dir: &std::path::Path, name: &str, status: &str) {
    std::fs::create_dir_all(dir).expect("dir");
    let content = format!(
        "---\n\
id: {id}\n\
title: Hand written\n\
status: {status}\n\
---\n\n\
Body\n",
        id = name.split('-').next().unwrap_or(name),
        status = status
    );
    std::fs::write(dir.join(format!("{}.md", name)), content).expect("write task");
}

#[test]
fn ids_continue_after_hand_written_tasks() {
    let temp = TempDir::new().expect("tempdir");
    let workspace = init_local(temp.path()).expect("init");
    write_task(&workspace.container_dir(TaskStatus::Archived.into()), "041-old", "archived");

    let store = RecordStore::new(workspace);
    let record = store
        .create(TaskStatus::Backlog.into(), "Next one", &Header::new())
        .expect("create");
    assert_eq!(record.id, "042");
}

#[test]
fn threads_sharing_a_workspace_never_reuse_ids() {
    let temp = TempDir::new().expect("tempdir");
    let store = Arc::new(RecordStore::new(init_local(temp.path()).expect("init")));

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                (0..4)
                    .map(|j| {
                        let title = format!("t{} {}", i, j);
                        store
                            .create(TaskStatus::Backlog.into(), &title, &Header::new())
                            .expect("create")
                            .id
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let mut ids: Vec<String> = handles
        .into_iter()
        .flat_map(|handle| handle.join().expect("join"))
        .collect();
    ids.sort();
    let expected: Vec<String> = (1..=24).map(|n| format!("{:03}", n)).collect();
    assert_eq!(ids, expected);
}

#[test]
fn overrides_route_families_to_separate_roots() {
    let temp = TempDir::new().expect("tempdir");
    let request = ResolveRequest::new(temp.path()).with_overrides(RootOverrides {
        tasks: Some("work/tasks".into()),
        notes: Some("journal".into()),
    });
    let workspace = resolve(&request).expect("resolve");
    let store = RecordStore::new(workspace.clone());

    let task = store
        .create(TaskStatus::Active.into(), "Routed task", &Header::new())
        .expect("task");
    let note = store
        .create(Container::Note(NoteKind::Ideas), "Routed idea", &Header::new())
        .expect("note");
    assert!(task.path.starts_with(&workspace.tasks_root));
    assert!(workspace.tasks_root.ends_with("work/tasks"));
    assert!(note.path.starts_with(workspace.notes_root.join("ideas")));
}

#[test]
fn list_reports_every_container_in_order() {
    let temp = TempDir::new().expect("tempdir");
    let store = RecordStore::new(init_local(temp.path()).expect("init"));
    let first = store
        .create(TaskStatus::Backlog.into(), "First", &Header::new())
        .expect("first");
    store
        .create(TaskStatus::Backlog.into(), "Second", &Header::new())
        .expect("second");
    store
        .transition(&first, TaskStatus::Completed.into())
        .expect("complete");

    let all: Vec<String> = store
        .list(Family::Tasks, None)
        .expect("list")
        .iter()
        .map(|record| record.render_line())
        .collect();
    assert_eq!(
        all,
        vec![
            "002 | backlog | Second".to_string(),
            "001 | completed | First".to_string(),
        ]
    );
    let done = store
        .list(Family::Tasks, Some(TaskStatus::Completed.into()))
        .expect("list completed");
    assert_eq!(done.len(), 1);
}

#[test]
fn body_survives_transitions_byte_for_byte() {
    let temp = TempDir::new().expect("tempdir");
    let workspace = init_local(temp.path()).expect("init");
    let dir = workspace.container_dir(TaskStatus::Backlog.into());
    std::fs::write(
        dir.join("007-crlf.md"),
        "---\r\nid: 007\r\ntitle: Crlf\r\nstatus: backlog\r\ncustom: keep me\r\n---\r\nline one\r\n\r\n  indented: not a field\r\n",
    )
    .expect("write");
    let store = RecordStore::new(workspace);

    let record = store.find(Family::Tasks, "007").expect("find");
    let moved = store
        .transition(&record, TaskStatus::Active.into())
        .expect("move");
    let text = std::fs::read_to_string(&moved.path).expect("read");
    assert_eq!(frontmatter::body(&text), "line one\r\n\r\n  indented: not a field\r\n");
    assert!(text.contains("custom: keep me\r\n"));
    assert!(text.contains("status: active\r\n"));
}
