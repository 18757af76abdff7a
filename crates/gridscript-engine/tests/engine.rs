//! End-to-end engine tests with a deterministic in-process runtime that
//! evaluates the simple arithmetic the substituted programs contain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use gridscript_core::CellCoord;
use gridscript_engine::{
    ChangeKind, Engine, EngineConfig, EngineHandle, JsonFileStore, RuntimeOutput, ScriptRuntime,
};
use gridscript_tags::SheetKey;

#[derive(Debug, Default)]
struct MockRuntime {
    runs: Arc<AtomicUsize>,
}

fn num(text: &str) -> Option<f64> {
    let t = text.trim().trim_matches('"');
    if t.is_empty() {
        return Some(0.0);
    }
    t.parse().ok()
}

fn fmt(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn eval(expr: &str) -> Option<String> {
    let expr = expr.trim();
    if expr.starts_with('[') {
        return Some(expr.to_string());
    }
    if let Some((a, b)) = expr.split_once('*') {
        return Some(fmt(num(a)? * num(b)?));
    }
    if let Some((a, b)) = expr.split_once('+') {
        return Some(fmt(num(a)? + num(b)?));
    }
    if expr.starts_with('"') && expr.ends_with('"') {
        return serde_json::from_str::<String>(expr).ok();
    }
    num(expr).map(fmt)
}

#[async_trait]
impl ScriptRuntime for MockRuntime {
    async fn run(&self, program: &str) -> RuntimeOutput {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let expr = program
            .strip_prefix("print(")
            .and_then(|s| s.strip_suffix(", end='')"))
            .unwrap_or(program);
        match eval(expr) {
            Some(stdout) => RuntimeOutput {
                stdout,
                stderr: String::new(),
                success: true,
            },
            None => RuntimeOutput::failure(format!("cannot evaluate {expr:?}")),
        }
    }
}

fn coord(a1: &str) -> CellCoord {
    CellCoord::from_a1(a1).unwrap()
}

fn spawn_engine(dir: &std::path::Path) -> (EngineHandle, Arc<AtomicUsize>) {
    let runs = Arc::new(AtomicUsize::new(0));
    let config = EngineConfig {
        tick_interval: Duration::from_millis(5),
        persist_debounce: Duration::from_millis(0),
        ..EngineConfig::default()
    };
    let runtime = Arc::new(MockRuntime { runs: runs.clone() });
    let store = Arc::new(JsonFileStore::new(dir));
    let handle = Engine::spawn(config, store, runtime).unwrap();
    (handle, runs)
}

async fn flush(handle: &EngineHandle) {
    tokio::time::timeout(Duration::from_secs(5), handle.flush())
        .await
        .expect("flush timed out")
        .unwrap();
}

#[tokio::test]
async fn test_edit_recalculates_dependent_script() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = spawn_engine(dir.path());
    let key = SheetKey::new("proj", "S");

    engine
        .set_cell(key.clone(), coord("A1"), "5", "alice")
        .await
        .unwrap();
    engine
        .set_script(key.clone(), coord("B1"), "={{A1}}*2", 1, 1, "alice")
        .await
        .unwrap();
    flush(&engine).await;

    let snap = engine.snapshot(key.clone()).await.unwrap();
    assert_eq!(snap.value("B1"), "10");

    engine
        .set_cell(key.clone(), coord("A1"), "7", "alice")
        .await
        .unwrap();
    flush(&engine).await;

    let snap = engine.snapshot(key).await.unwrap();
    assert_eq!(snap.value("B1"), "14");
}

#[tokio::test]
async fn test_insert_row_shifts_script_and_keeps_it_live() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = spawn_engine(dir.path());
    let key = SheetKey::new("proj", "S");

    engine
        .set_cell(key.clone(), coord("A1"), "5", "alice")
        .await
        .unwrap();
    engine
        .set_script(key.clone(), coord("B1"), "={{A1}}*2", 1, 1, "alice")
        .await
        .unwrap();
    flush(&engine).await;

    engine.insert_row(key.clone(), 1, "alice").await.unwrap();
    flush(&engine).await;

    let snap = engine.snapshot(key.clone()).await.unwrap();
    assert_eq!(snap.script("B2"), "={{A2}}*2");
    assert_eq!(snap.value("A2"), "5");
    assert_eq!(snap.value("B2"), "10");
    assert_eq!(snap.value("B1"), "");

    // The shifted script still tracks its shifted input
    engine
        .set_cell(key.clone(), coord("A2"), "7", "alice")
        .await
        .unwrap();
    flush(&engine).await;
    let snap = engine.snapshot(key).await.unwrap();
    assert_eq!(snap.value("B2"), "14");
}

#[tokio::test]
async fn test_insert_through_span_relands_output() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = spawn_engine(dir.path());
    let key = SheetKey::new("proj", "S");

    engine
        .set_script(key.clone(), coord("A1"), "=[1, 2, 3]", 1, 3, "alice")
        .await
        .unwrap();
    flush(&engine).await;

    engine.insert_column(key.clone(), 2, "alice").await.unwrap();
    flush(&engine).await;

    // The span owner re-ran: the output re-lands from the anchor and the
    // cells the old span was pushed into are released again.
    let snap = engine.snapshot(key).await.unwrap();
    assert_eq!(snap.value("A1"), "1");
    assert_eq!(snap.value("B1"), "2");
    assert_eq!(snap.value("C1"), "3");
    assert_eq!(snap.value("D1"), "");
}

#[tokio::test]
async fn test_delete_of_span_anchor_releases_surviving_locks() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = spawn_engine(dir.path());
    let key = SheetKey::new("proj", "S");

    engine
        .set_script(key.clone(), coord("A1"), "=[1, 2, 3]", 3, 1, "alice")
        .await
        .unwrap();
    flush(&engine).await;

    let snap = engine.snapshot(key.clone()).await.unwrap();
    assert_eq!(snap.value("A2"), "2");

    // Deleting the anchor row kills the script; the shifted span cells
    // must come back unlocked and empty.
    engine.delete_row(key.clone(), 1, "alice").await.unwrap();
    flush(&engine).await;

    let snap = engine.snapshot(key.clone()).await.unwrap();
    assert_eq!(snap.value("A1"), "");
    assert_eq!(snap.value("A2"), "");

    engine
        .set_cell(key.clone(), coord("A1"), "fresh", "alice")
        .await
        .unwrap();
    flush(&engine).await;
    let snap = engine.snapshot(key).await.unwrap();
    assert_eq!(snap.value("A1"), "fresh");
}

#[tokio::test]
async fn test_mutual_reference_cycle_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, runs) = spawn_engine(dir.path());
    let key = SheetKey::new("proj", "S");

    engine
        .set_script(key.clone(), coord("B1"), "={{A1}}+1", 1, 1, "alice")
        .await
        .unwrap();
    engine
        .set_script(key.clone(), coord("A1"), "={{B1}}+1", 1, 1, "alice")
        .await
        .unwrap();

    let before = runs.load(Ordering::SeqCst);
    engine
        .set_cell(key.clone(), coord("C1"), "unrelated", "alice")
        .await
        .unwrap();
    flush(&engine).await;

    // Attaching the two scripts plus settling the cascade stays bounded;
    // within one cycle each script runs at most once.
    let total = runs.load(Ordering::SeqCst);
    assert!(total >= before, "runs went backwards");
    assert!(total <= 6, "cycle was not cut: {total} runs");

    let snap = engine.snapshot(key).await.unwrap();
    assert!(!snap.value("A1").is_empty());
    assert!(!snap.value("B1").is_empty());
}

#[tokio::test]
async fn test_span_fills_and_containment_collapse() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = spawn_engine(dir.path());
    let key = SheetKey::new("proj", "S");

    // Free row: the flat array fills across the declared 1x3 span
    engine
        .set_script(key.clone(), coord("A2"), "=[1, 2, 3]", 1, 3, "alice")
        .await
        .unwrap();
    flush(&engine).await;

    let snap = engine.snapshot(key.clone()).await.unwrap();
    assert_eq!(snap.value("A2"), "1");
    assert_eq!(snap.value("B2"), "2");
    assert_eq!(snap.value("C2"), "3");

    // Occupied row: the span collapses and nothing is overwritten
    engine
        .set_cell(key.clone(), coord("C1"), "keep me", "alice")
        .await
        .unwrap();
    engine
        .set_script(key.clone(), coord("A1"), "=[1, 2, 3]", 1, 3, "alice")
        .await
        .unwrap();
    flush(&engine).await;

    let snap = engine.snapshot(key).await.unwrap();
    assert_eq!(snap.value("C1"), "keep me");
    assert_eq!(snap.value("A1"), "[1, 2, 3]");
    assert_eq!(snap.value("B1"), "");
}

#[tokio::test]
async fn test_cross_project_reference_and_rename() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = spawn_engine(dir.path());
    let source = SheetKey::new("proj2", "Sheet1");
    let home = SheetKey::new("proj1", "SheetX");

    engine
        .set_cell(source.clone(), coord("A1"), "7", "bob")
        .await
        .unwrap();
    engine
        .set_script(
            home.clone(),
            coord("A1"),
            "={{proj2/Sheet1/A1}}+1",
            1,
            1,
            "bob",
        )
        .await
        .unwrap();
    flush(&engine).await;

    let snap = engine.snapshot(home.clone()).await.unwrap();
    assert_eq!(snap.value("A1"), "8");

    engine.rename_project("proj2", "proj2b").await.unwrap();
    flush(&engine).await;

    let snap = engine.snapshot(home.clone()).await.unwrap();
    assert_eq!(snap.script("A1"), "={{proj2b/Sheet1/A1}}+1");

    // The rewritten reference still resolves
    let renamed = SheetKey::new("proj2b", "Sheet1");
    engine
        .set_cell(renamed, coord("A1"), "9", "bob")
        .await
        .unwrap();
    flush(&engine).await;

    let snap = engine.snapshot(home).await.unwrap();
    assert_eq!(snap.value("A1"), "10");
}

#[tokio::test]
async fn test_reload_rebuilds_dependency_index() {
    let dir = tempfile::tempdir().unwrap();
    let key = SheetKey::new("proj", "S");

    {
        let (engine, _) = spawn_engine(dir.path());
        engine
            .set_cell(key.clone(), coord("A1"), "5", "alice")
            .await
            .unwrap();
        engine
            .set_script(key.clone(), coord("B1"), "={{A1}}*2", 1, 1, "alice")
            .await
            .unwrap();
        flush(&engine).await;
        engine.shutdown().await.unwrap();
    }

    let (engine, _) = spawn_engine(dir.path());
    let snap = engine.snapshot(key.clone()).await.unwrap();
    assert_eq!(snap.value("B1"), "10");

    // The rebuilt index makes the loaded script reachable again
    engine
        .set_cell(key.clone(), coord("A1"), "9", "alice")
        .await
        .unwrap();
    flush(&engine).await;
    let snap = engine.snapshot(key).await.unwrap();
    assert_eq!(snap.value("B1"), "18");
}

#[tokio::test]
async fn test_options_refresh_on_covered_edit() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = spawn_engine(dir.path());
    let key = SheetKey::new("proj", "S");

    engine
        .set_cell(key.clone(), coord("A1"), "red", "alice")
        .await
        .unwrap();
    engine
        .set_cell(key.clone(), coord("A2"), "green", "alice")
        .await
        .unwrap();
    engine
        .set_options_range(key.clone(), coord("C1"), "A1:A3")
        .await
        .unwrap();

    let snap = engine.snapshot(key.clone()).await.unwrap();
    let combo = snap.cells.get("C1").unwrap();
    assert_eq!(combo.options, vec!["red", "green"]);

    engine
        .set_cell(key.clone(), coord("A3"), "blue", "alice")
        .await
        .unwrap();
    flush(&engine).await;

    let snap = engine.snapshot(key).await.unwrap();
    let combo = snap.cells.get("C1").unwrap();
    assert_eq!(combo.options, vec!["red", "green", "blue"]);
}

#[tokio::test]
async fn test_broadcasts_are_deduplicated_per_sheet() {
    let dir = tempfile::tempdir().unwrap();
    // A tick long enough that notifications only go out on flush
    let config = EngineConfig {
        tick_interval: Duration::from_secs(3600),
        persist_debounce: Duration::from_millis(0),
        ..EngineConfig::default()
    };
    let engine = Engine::spawn(
        config,
        Arc::new(JsonFileStore::new(dir.path())),
        Arc::new(MockRuntime::default()),
    )
    .unwrap();
    let key = SheetKey::new("proj", "S");

    let mut rx = engine.subscribe();

    engine
        .set_cell(key.clone(), coord("A1"), "1", "alice")
        .await
        .unwrap();
    engine
        .set_cell(key.clone(), coord("A2"), "2", "alice")
        .await
        .unwrap();
    flush(&engine).await;

    let change = rx.recv().await.unwrap();
    assert_eq!(change.project, "proj");
    assert_eq!(change.sheet, "S");
    assert_eq!(change.kind, ChangeKind::Cells);

    // Both edits landed before the flush published, so one notification
    assert!(matches!(
        rx.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_script_error_becomes_cell_text() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = spawn_engine(dir.path());
    let key = SheetKey::new("proj", "S");

    engine
        .set_cell(key.clone(), coord("A1"), "not a number", "alice")
        .await
        .unwrap();
    engine
        .set_script(key.clone(), coord("B1"), "={{A1}}*2", 1, 1, "alice")
        .await
        .unwrap();
    flush(&engine).await;

    let snap = engine.snapshot(key).await.unwrap();
    assert!(
        snap.value("B1").starts_with("Error:"),
        "got {:?}",
        snap.value("B1")
    );
}
