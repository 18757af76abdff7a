//! The recalculation engine actor.
//!
//! One task owns the sheet registry, the dependency index, the work queues
//! and the dirty-sheet map; nothing else touches them, so there are no
//! locks and no lock ordering. Entry points live on a cloneable
//! [`EngineHandle`] that sends commands over an mpsc channel.
//!
//! Scheduling: a ticker drives at most one unit of work per tick, script-
//! produced changes before manual edits, which serializes recalculation
//! cascades. A slow script therefore stalls recalculation system-wide; the
//! per-invocation timeout bounds how long.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use gridscript_core::{AuditAction, AuditEntry, CellCoord, CellId, GridError, LockOwner, Sheet};
use gridscript_tags::{
    parse_plain, rewrite_options_range, rewrite_script, rewrite_tags, shift_audit_entry, Axis,
    DependencyTracker, SheetKey, ShiftKind, ShiftOp, Tag,
};

use crate::broadcast::{ChangeHub, SheetChange};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor;
use crate::persist::{JsonFileStore, SnapshotStore};
use crate::queue::{CellAddr, ChangeKind, WorkQueues};
use crate::runtime::{InterpreterRuntime, ScriptRuntime};
use crate::snapshot::SheetSnapshot;
use crate::span;
use crate::store::Workbooks;

/// Audit user recorded for cells written by script output
const SCRIPT_USER: &str = "script";

enum Command {
    SetCell {
        key: SheetKey,
        coord: CellCoord,
        value: String,
        user: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    SetScript {
        key: SheetKey,
        coord: CellCoord,
        script: String,
        row_span: u32,
        col_span: u32,
        user: String,
        reply: oneshot::Sender<Result<CellId, EngineError>>,
    },
    ClearScript {
        key: SheetKey,
        coord: CellCoord,
        user: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    SetOptionsRange {
        key: SheetKey,
        coord: CellCoord,
        range: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Structural {
        key: SheetKey,
        op: ShiftOp,
        user: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    RenameProject {
        old: String,
        new: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    RenameSheet {
        project: String,
        old: String,
        new: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Snapshot {
        key: SheetKey,
        reply: oneshot::Sender<Result<SheetSnapshot, EngineError>>,
    },
    Sheets {
        reply: oneshot::Sender<Vec<SheetKey>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to the engine actor. All methods are async and
/// return [`EngineError::Closed`] once the actor has stopped.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
    hub: ChangeHub,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)?
    }

    pub async fn set_cell(
        &self,
        key: SheetKey,
        coord: CellCoord,
        value: impl Into<String>,
        user: impl Into<String>,
    ) -> Result<(), EngineError> {
        let (value, user) = (value.into(), user.into());
        self.request(|reply| Command::SetCell {
            key,
            coord,
            value,
            user,
            reply,
        })
        .await
    }

    pub async fn set_script(
        &self,
        key: SheetKey,
        coord: CellCoord,
        script: impl Into<String>,
        row_span: u32,
        col_span: u32,
        user: impl Into<String>,
    ) -> Result<CellId, EngineError> {
        let (script, user) = (script.into(), user.into());
        self.request(|reply| Command::SetScript {
            key,
            coord,
            script,
            row_span,
            col_span,
            user,
            reply,
        })
        .await
    }

    pub async fn clear_script(
        &self,
        key: SheetKey,
        coord: CellCoord,
        user: impl Into<String>,
    ) -> Result<(), EngineError> {
        let user = user.into();
        self.request(|reply| Command::ClearScript {
            key,
            coord,
            user,
            reply,
        })
        .await
    }

    pub async fn set_options_range(
        &self,
        key: SheetKey,
        coord: CellCoord,
        range: impl Into<String>,
    ) -> Result<(), EngineError> {
        let range = range.into();
        self.request(|reply| Command::SetOptionsRange {
            key,
            coord,
            range,
            reply,
        })
        .await
    }

    async fn structural(
        &self,
        key: SheetKey,
        op: ShiftOp,
        user: impl Into<String>,
    ) -> Result<(), EngineError> {
        let user = user.into();
        self.request(|reply| Command::Structural {
            key,
            op,
            user,
            reply,
        })
        .await
    }

    pub async fn insert_row(
        &self,
        key: SheetKey,
        at: u32,
        user: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.structural(key, ShiftOp::insert_row(at), user).await
    }

    pub async fn delete_row(
        &self,
        key: SheetKey,
        at: u32,
        user: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.structural(key, ShiftOp::delete_row(at), user).await
    }

    pub async fn move_row(
        &self,
        key: SheetKey,
        from: u32,
        to: u32,
        user: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.structural(key, ShiftOp::move_row(from, to), user).await
    }

    pub async fn insert_column(
        &self,
        key: SheetKey,
        at: u32,
        user: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.structural(key, ShiftOp::insert_col(at), user).await
    }

    pub async fn delete_column(
        &self,
        key: SheetKey,
        at: u32,
        user: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.structural(key, ShiftOp::delete_col(at), user).await
    }

    pub async fn move_column(
        &self,
        key: SheetKey,
        from: u32,
        to: u32,
        user: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.structural(key, ShiftOp::move_col(from, to), user).await
    }

    pub async fn rename_project(
        &self,
        old: impl Into<String>,
        new: impl Into<String>,
    ) -> Result<(), EngineError> {
        let (old, new) = (old.into(), new.into());
        self.request(|reply| Command::RenameProject { old, new, reply })
            .await
    }

    pub async fn rename_sheet(
        &self,
        project: impl Into<String>,
        old: impl Into<String>,
        new: impl Into<String>,
    ) -> Result<(), EngineError> {
        let (project, old, new) = (project.into(), old.into(), new.into());
        self.request(|reply| Command::RenameSheet {
            project,
            old,
            new,
            reply,
        })
        .await
    }

    pub async fn snapshot(&self, key: SheetKey) -> Result<SheetSnapshot, EngineError> {
        self.request(|reply| Command::Snapshot { key, reply }).await
    }

    pub async fn sheets(&self) -> Result<Vec<SheetKey>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Sheets { reply })
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Drive the scheduler until every queue is drained and all dirty
    /// sheets are persisted. Edits already acknowledged before this call
    /// are fully settled when it returns.
    pub async fn flush(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush { reply })
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Flush and stop the actor
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { reply })
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Subscribe to deduplicated sheet-changed notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SheetChange> {
        self.hub.subscribe()
    }
}

/// The actor state. Constructed and consumed by [`Engine::spawn`].
pub struct Engine {
    config: EngineConfig,
    books: Workbooks,
    tracker: DependencyTracker,
    queues: WorkQueues,
    /// Last-mutation instant per sheet awaiting a debounced persist
    dirty: HashMap<SheetKey, Instant>,
    hub: ChangeHub,
    runtime: Arc<dyn ScriptRuntime>,
    store: Arc<dyn SnapshotStore>,
    rx: mpsc::Receiver<Command>,
}

impl Engine {
    /// Load every persisted sheet, rebuild the dependency index by full
    /// scan, sweep zombie span locks, and start the actor task. Must be
    /// called from within a tokio runtime.
    pub fn spawn(
        config: EngineConfig,
        store: Arc<dyn SnapshotStore>,
        runtime: Arc<dyn ScriptRuntime>,
    ) -> anyhow::Result<EngineHandle> {
        let mut books = Workbooks::new();
        for sheet in store.load_all()? {
            books.insert(sheet);
        }

        let mut tracker = DependencyTracker::new();
        for (key, sheet) in books.iter() {
            for (coord, id, script) in sheet.script_cells() {
                tracker.update(key, id, &script, coord);
            }
        }

        for (key, sheet) in books.iter_mut() {
            let swept = sheet.sweep_zombie_span_locks();
            if !swept.is_empty() {
                tracing::warn!("released {} zombie span locks on {key}", swept.len());
            }
        }

        tracing::info!(
            "engine loaded {} sheets, {} dependency records",
            books.len(),
            tracker.record_count()
        );

        let (tx, rx) = mpsc::channel(64);
        let hub = ChangeHub::default();
        let engine = Engine {
            config,
            books,
            tracker,
            queues: WorkQueues::new(),
            dirty: HashMap::new(),
            hub: hub.clone(),
            runtime,
            store,
            rx,
        };
        tokio::spawn(engine.run());
        Ok(EngineHandle { tx, hub })
    }

    /// Spawn with the default collaborators: JSON snapshot files under the
    /// configured data directory and an external interpreter process.
    pub fn start(config: EngineConfig) -> anyhow::Result<EngineHandle> {
        let store = Arc::new(JsonFileStore::new(config.data_dir.clone()));
        let runtime = Arc::new(InterpreterRuntime::new(
            config.interpreter.clone(),
            config.script_timeout,
        ));
        Engine::spawn(config, store, runtime)
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle(cmd).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    self.drain_one().await;
                    self.persist(false);
                    self.publish();
                }
            }
        }

        self.settle().await;
        tracing::info!("engine stopped");
    }

    /// Returns true when the actor should stop
    async fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SetCell {
                key,
                coord,
                value,
                user,
                reply,
            } => {
                let _ = reply.send(self.set_cell(key, coord, value, user));
            }
            Command::SetScript {
                key,
                coord,
                script,
                row_span,
                col_span,
                user,
                reply,
            } => {
                let result = self
                    .set_script(key, coord, script, row_span, col_span, user)
                    .await;
                let _ = reply.send(result);
            }
            Command::ClearScript {
                key,
                coord,
                user,
                reply,
            } => {
                let _ = reply.send(self.clear_script(key, coord, user));
            }
            Command::SetOptionsRange {
                key,
                coord,
                range,
                reply,
            } => {
                let _ = reply.send(self.set_options_range(key, coord, range));
            }
            Command::Structural {
                key,
                op,
                user,
                reply,
            } => {
                let result = self.structural_edit(key, op, user).await;
                let _ = reply.send(result);
            }
            Command::RenameProject { old, new, reply } => {
                let _ = reply.send(self.rename_project(&old, &new));
            }
            Command::RenameSheet {
                project,
                old,
                new,
                reply,
            } => {
                let _ = reply.send(self.rename_sheet(&project, &old, &new));
            }
            Command::Snapshot { key, reply } => {
                let result = self
                    .books
                    .get(&key)
                    .map(SheetSnapshot::of)
                    .ok_or_else(|| EngineError::from(GridError::SheetNotFound(key.to_string())));
                let _ = reply.send(result);
            }
            Command::Sheets { reply } => {
                let _ = reply.send(self.books.keys().cloned().collect());
            }
            Command::Flush { reply } => {
                self.settle().await;
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                self.settle().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    // -------------------------------------------------------------------
    // Scheduler
    // -------------------------------------------------------------------

    /// At most one unit of work: script-produced changes outrank manual
    /// edits so a running cascade settles before the next edit starts.
    async fn drain_one(&mut self) {
        if let Some(addr) = self.queues.pop_script() {
            self.run_dependents(&addr).await;
        } else if let Some(addr) = self.queues.pop_manual() {
            self.queues.start_cycle();
            self.run_dependents(&addr).await;
            self.refresh_options(&addr);
        }
    }

    /// Drain every queue, persist everything, publish pending broadcasts
    async fn settle(&mut self) {
        while self.queues.has_work() {
            self.drain_one().await;
        }
        self.persist(true);
        self.publish();
    }

    async fn run_dependents(&mut self, addr: &CellAddr) {
        let changed_id = self
            .books
            .get(&addr.key)
            .and_then(|s| s.cell(addr.coord))
            .and_then(|c| c.cell_id);

        for dep in self.tracker.resolve(&addr.key, addr.coord, changed_id) {
            let coord = self
                .books
                .get(&dep.home)
                .and_then(|s| s.find_by_id(dep.cell_id));
            match coord {
                Some(coord) => self.run_script_at(&dep.home, coord).await,
                None => {
                    // The script cell is gone; the record is stale
                    self.tracker.remove_script(&dep.home, dep.cell_id);
                }
            }
        }
    }

    async fn run_script_at(&mut self, key: &SheetKey, coord: CellCoord) {
        let Some((id, script)) = self
            .books
            .get(key)
            .and_then(|s| s.cell(coord))
            .filter(|c| c.has_script())
            .and_then(|c| c.cell_id.map(|id| (id, c.script.clone())))
        else {
            return;
        };

        if !self.queues.mark_executed(key, id) {
            tracing::debug!("cycle cut at {key} {}", coord.to_a1());
            return;
        }

        let self_ref = executor::is_self_referencing(&script, key, coord);
        let substituted = executor::substitute_tags(&script, key, coord, &self.books);
        let program = executor::prepare_program(&substituted);
        let output = self.runtime.run(&program).await;

        let raw = if output.success {
            let mut text = output.stdout;
            while text.ends_with('\n') || text.ends_with('\r') {
                text.pop();
            }
            text
        } else {
            let detail = output.stderr.trim();
            let message = detail.lines().last().unwrap_or("script failed");
            let message = if message.is_empty() { "script failed" } else { message };
            tracing::debug!("script at {key} {} failed: {message}", coord.to_a1());
            format!("Error: {message}")
        };

        let Some(sheet) = self.books.get_mut(key) else {
            return;
        };
        let writes = span::write_output(sheet, coord, id, &raw, self_ref);
        if writes.is_empty() {
            return;
        }

        for w in &writes {
            sheet.log_audit(AuditEntry::cell_change(
                SCRIPT_USER,
                AuditAction::SetValue,
                w.coord.row,
                w.coord.col,
                w.old.clone(),
                w.new.clone(),
            ));
        }

        self.mark_dirty(key);
        self.queues.mark_broadcast(key.clone(), ChangeKind::Cells);
        if self.config.trigger_next {
            for w in writes {
                self.queues.push_script(CellAddr::new(key.clone(), w.coord));
            }
        }
    }

    /// Reload the options list of any combo cell whose options range
    /// covers the edited cell.
    fn refresh_options(&mut self, addr: &CellAddr) {
        let mut hits = Vec::new();
        for (key, sheet) in self.books.iter() {
            for (coord, cell) in sheet.cells() {
                if cell.options_range.is_empty() {
                    continue;
                }
                let Some(tag) = parse_plain(&cell.options_range) else {
                    continue;
                };
                if tag.target(key) == addr.key && tag.range().contains(addr.coord) {
                    hits.push((key.clone(), coord, tag.range()));
                }
            }
        }

        let mut touched = Vec::new();
        for (home, coord, range) in hits {
            let options: Vec<String> = self
                .books
                .get(&addr.key)
                .map(|sheet| {
                    range
                        .iter()
                        .map(|c| sheet.value_at(c).to_string())
                        .filter(|v| !v.is_empty())
                        .collect()
                })
                .unwrap_or_default();

            let Some(sheet) = self.books.get_mut(&home) else {
                continue;
            };
            let cell = sheet.cell_mut(coord);
            if cell.options != options {
                cell.options = options;
                let live = cell.options.clone();
                cell.options_selected.retain(|s| live.contains(s));
                touched.push(home);
            }
        }

        for key in touched {
            self.mark_dirty(&key);
            self.queues.mark_broadcast(key, ChangeKind::Cells);
        }
    }

    // -------------------------------------------------------------------
    // Edits
    // -------------------------------------------------------------------

    fn set_cell(
        &mut self,
        key: SheetKey,
        coord: CellCoord,
        value: String,
        user: String,
    ) -> Result<(), EngineError> {
        let sheet = self.books.open(&key);
        if sheet.cell(coord).is_some_and(|c| c.is_locked()) {
            return Err(GridError::CellLocked(coord.to_a1()).into());
        }

        let old = sheet.set_value(coord, value.clone());
        if old == value {
            return Ok(());
        }

        sheet.log_audit(AuditEntry::cell_change(
            &user,
            AuditAction::SetValue,
            coord.row,
            coord.col,
            old,
            value,
        ));

        self.mark_dirty(&key);
        self.queues.mark_broadcast(key.clone(), ChangeKind::Cells);
        self.queues.push_manual(CellAddr::new(key, coord));
        Ok(())
    }

    async fn set_script(
        &mut self,
        key: SheetKey,
        coord: CellCoord,
        script: String,
        row_span: u32,
        col_span: u32,
        user: String,
    ) -> Result<CellId, EngineError> {
        if script.trim().is_empty() {
            return Err(EngineError::InvalidEdit(
                "empty script; use clear_script to detach".to_string(),
            ));
        }

        let sheet = self.books.open(&key);
        if sheet.cell(coord).is_some_and(|c| c.is_locked()) {
            return Err(GridError::CellLocked(coord.to_a1()).into());
        }

        let id = sheet.assign_cell_id(coord);
        let old = {
            let cell = sheet.cell_mut(coord);
            cell.output_row_span = row_span.max(1);
            cell.output_col_span = col_span.max(1);
            std::mem::replace(&mut cell.script, script.clone())
        };

        sheet.log_audit(AuditEntry::cell_change(
            &user,
            AuditAction::SetScript,
            coord.row,
            coord.col,
            old,
            script.clone(),
        ));

        self.tracker.update(&key, id, &script, coord);
        self.mark_dirty(&key);
        self.queues.mark_broadcast(key.clone(), ChangeKind::Cells);

        // A freshly attached script runs right away; its writes cascade
        // through the script queue.
        self.queues.start_cycle();
        self.run_script_at(&key, coord).await;
        Ok(id)
    }

    fn clear_script(
        &mut self,
        key: SheetKey,
        coord: CellCoord,
        user: String,
    ) -> Result<(), EngineError> {
        let Some(sheet) = self.books.get_mut(&key) else {
            return Err(GridError::SheetNotFound(key.to_string()).into());
        };
        let Some(cell) = sheet.cell(coord) else {
            return Ok(());
        };
        if !cell.has_script() {
            return Ok(());
        }

        let id = cell.cell_id;
        let old = {
            let cell = sheet.cell_mut(coord);
            cell.script_output.clear();
            cell.output_row_span = 1;
            cell.output_col_span = 1;
            cell.cell_id = None;
            std::mem::take(&mut cell.script)
        };

        let mut released = Vec::new();
        if let Some(id) = id {
            released = sheet.release_span_locks(id);
            self.tracker.remove_script(&key, id);
        }

        let sheet = self.books.open(&key);
        sheet.log_audit(AuditEntry::cell_change(
            &user,
            AuditAction::ClearScript,
            coord.row,
            coord.col,
            old,
            "",
        ));
        sheet.prune(coord);

        self.mark_dirty(&key);
        self.queues.mark_broadcast(key.clone(), ChangeKind::Cells);
        // Cleared output and released span cells are script-produced changes
        self.queues
            .push_script(CellAddr::new(key.clone(), coord));
        for (released_coord, _) in released {
            self.queues
                .push_script(CellAddr::new(key.clone(), released_coord));
        }
        Ok(())
    }

    fn set_options_range(
        &mut self,
        key: SheetKey,
        coord: CellCoord,
        range: String,
    ) -> Result<(), EngineError> {
        let options: Vec<String> = match parse_plain(&range) {
            Some(tag) => {
                let target = tag.target(&key);
                let span = tag.range();
                self.books
                    .get(&target)
                    .map(|sheet| {
                        span.iter()
                            .map(|c| sheet.value_at(c).to_string())
                            .filter(|v| !v.is_empty())
                            .collect()
                    })
                    .unwrap_or_default()
            }
            None if range.trim().is_empty() => Vec::new(),
            None => {
                return Err(EngineError::InvalidEdit(format!(
                    "not a cell range: {range:?}"
                )))
            }
        };

        let sheet = self.books.open(&key);
        {
            let cell = sheet.cell_mut(coord);
            cell.options_range = range.trim().to_string();
            cell.options = options;
            let live = cell.options.clone();
            cell.options_selected.retain(|s| live.contains(s));
        }
        sheet.prune(coord);

        self.mark_dirty(&key);
        self.queues.mark_broadcast(key, ChangeKind::Cells);
        Ok(())
    }

    // -------------------------------------------------------------------
    // Structural edits
    // -------------------------------------------------------------------

    async fn structural_edit(
        &mut self,
        key: SheetKey,
        op: ShiftOp,
        user: String,
    ) -> Result<(), EngineError> {
        let valid = match op.kind {
            ShiftKind::Insert(at) | ShiftKind::Delete(at) => at >= 1,
            ShiftKind::Move { from, to } => from >= 1 && to >= 1,
        };
        if !valid {
            return Err(GridError::InvalidIndex("indices are 1-based".to_string()).into());
        }
        if op.is_noop() {
            return Ok(());
        }

        let before_ids: Vec<CellId>;
        let owners: Vec<CellId>;
        {
            let Some(sheet) = self.books.get_mut(&key) else {
                return Err(GridError::SheetNotFound(key.to_string()).into());
            };

            before_ids = sheet.script_cells().iter().map(|(_, id, _)| *id).collect();
            owners = span_owners_in_region(sheet, op);

            apply_grid(sheet, op);

            // Local rewrite pass: script tags, options ranges, audit coords
            for (_, cell) in sheet.cells_mut() {
                if cell.has_script() {
                    if let Some(new) = rewrite_script(&cell.script, op, &key, &key) {
                        cell.script = new;
                    }
                }
                if !cell.options_range.is_empty() {
                    if let Some(new) = rewrite_options_range(&cell.options_range, op, &key, &key) {
                        cell.options_range = new;
                    }
                }
            }
            for entry in &mut sheet.audit_log {
                shift_audit_entry(entry, op);
            }

            let (index, dest) = op_index(op);
            sheet.log_audit(AuditEntry::structural(&user, audit_action(op), index, dest));
        }

        // Reindex the edited sheet: scripts moved, some may be gone
        let after = self
            .books
            .get(&key)
            .map(|s| s.script_cells())
            .unwrap_or_default();
        let after_ids: HashSet<CellId> = after.iter().map(|(_, id, _)| *id).collect();
        for id in before_ids {
            if !after_ids.contains(&id) {
                self.tracker.remove_script(&key, id);
            }
        }
        for (coord, id, script) in &after {
            self.tracker.update(&key, *id, script, *coord);
        }

        let mut touched: Vec<SheetKey> = Vec::new();

        // Scripts on other sheets referencing the edited sheet
        let mut seen: HashSet<(SheetKey, CellId)> = HashSet::new();
        let mut updates: Vec<(SheetKey, CellId, String, CellCoord)> = Vec::new();
        for r in self.tracker.scripts_reading(&key) {
            if r.home == key || !seen.insert((r.home.clone(), r.cell_id)) {
                continue;
            }
            let Some(sheet) = self.books.get_mut(&r.home) else {
                continue;
            };
            let Some(coord) = sheet.find_by_id(r.cell_id) else {
                continue;
            };
            let cell = sheet.cell_mut(coord);
            if let Some(new) = rewrite_script(&cell.script, op, &r.home, &key) {
                cell.script = new.clone();
                updates.push((r.home.clone(), r.cell_id, new, coord));
                touched.push(r.home.clone());
            }
        }
        for (home, id, script, coord) in updates {
            self.tracker.update(&home, id, &script, coord);
        }

        // Options ranges anywhere may point into the edited sheet
        for (home, sheet) in self.books.iter_mut() {
            if *home == key {
                continue;
            }
            let mut changed = false;
            for (_, cell) in sheet.cells_mut() {
                if cell.options_range.is_empty() {
                    continue;
                }
                if let Some(new) = rewrite_options_range(&cell.options_range, op, home, &key) {
                    cell.options_range = new;
                    changed = true;
                }
            }
            if changed {
                touched.push(home.clone());
            }
        }

        for home in touched {
            self.mark_dirty(&home);
            self.queues.mark_broadcast(home, ChangeKind::Cells);
        }
        self.mark_dirty(&key);
        self.queues.mark_broadcast(key.clone(), ChangeKind::Structure);

        // Scripts whose output span covered the edited region re-land
        // their output in the shifted cells. An owner whose anchor the edit
        // deleted is gone for good: its surviving span cells are released
        // so they do not stay locked by a dead script.
        self.queues.start_cycle();
        for owner in owners {
            match self.books.get(&key).and_then(|s| s.find_by_id(owner)) {
                Some(coord) => self.run_script_at(&key, coord).await,
                None => {
                    let released = self
                        .books
                        .get_mut(&key)
                        .map(|s| s.release_span_locks(owner))
                        .unwrap_or_default();
                    if !released.is_empty() {
                        self.mark_dirty(&key);
                        self.queues.mark_broadcast(key.clone(), ChangeKind::Cells);
                        for (coord, _) in released {
                            self.queues.push_script(CellAddr::new(key.clone(), coord));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Renames
    // -------------------------------------------------------------------

    fn rename_project(&mut self, old: &str, new: &str) -> Result<(), EngineError> {
        if old == new {
            return Ok(());
        }
        let old_keys: Vec<SheetKey> = self
            .books
            .keys()
            .filter(|k| k.project == old)
            .cloned()
            .collect();
        if old_keys.is_empty() {
            return Err(GridError::SheetNotFound(format!("{old}/*")).into());
        }

        // Snapshot files move with the rename
        for key in &old_keys {
            if let Err(e) = self.store.remove(key) {
                tracing::warn!("failed to remove old snapshot for {key}: {e}");
            }
        }

        // Literal {{old/...}} references anywhere in the system
        let changed = self.rewrite_refs_everywhere(|tag| match tag {
            Tag::Remote {
                project,
                sheet,
                range,
            } if project == old => Some(Tag::Remote {
                project: new.to_string(),
                sheet: sheet.clone(),
                range: *range,
            }),
            _ => None,
        });

        self.books.rename_project(old, new);
        self.tracker.rename_project(old, new);
        self.dirty.retain(|key, _| self.books.contains(key));

        for key in changed {
            if self.books.contains(&key) {
                self.mark_dirty(&key);
                self.queues.mark_broadcast(key, ChangeKind::Cells);
            }
        }
        let renamed: Vec<SheetKey> = self
            .books
            .keys()
            .filter(|k| k.project == new)
            .cloned()
            .collect();
        for key in renamed {
            self.mark_dirty(&key);
            self.queues.mark_broadcast(key, ChangeKind::Structure);
        }
        tracing::info!("renamed project {old} to {new}");
        Ok(())
    }

    fn rename_sheet(&mut self, project: &str, old: &str, new: &str) -> Result<(), EngineError> {
        if old == new {
            return Ok(());
        }
        let from = SheetKey::new(project, old);
        if !self.books.contains(&from) {
            return Err(GridError::SheetNotFound(from.to_string()).into());
        }
        let to = SheetKey::new(project, new);
        if self.books.contains(&to) {
            return Err(GridError::SheetExists(to.to_string()).into());
        }

        if let Err(e) = self.store.remove(&from) {
            tracing::warn!("failed to remove old snapshot for {from}: {e}");
        }

        let changed = self.rewrite_refs_everywhere(|tag| match tag {
            Tag::Remote {
                project: p,
                sheet,
                range,
            } if p == project && sheet == old => Some(Tag::Remote {
                project: p.clone(),
                sheet: new.to_string(),
                range: *range,
            }),
            _ => None,
        });

        self.books.rename_sheet(project, old, new);
        self.tracker.rename_sheet(project, old, new);
        self.dirty.retain(|key, _| self.books.contains(key));

        for key in changed {
            if self.books.contains(&key) {
                self.mark_dirty(&key);
                self.queues.mark_broadcast(key, ChangeKind::Cells);
            }
        }
        self.mark_dirty(&to);
        self.queues.mark_broadcast(to, ChangeKind::Structure);
        Ok(())
    }

    /// Rewrite every script tag and options-range reference in every sheet
    /// with the given mapping. Returns the keys of the sheets that changed.
    fn rewrite_refs_everywhere(
        &mut self,
        map: impl Fn(&Tag) -> Option<Tag>,
    ) -> Vec<SheetKey> {
        let mut changed = Vec::new();
        let mut updates: Vec<(SheetKey, CellId, String, CellCoord)> = Vec::new();

        for (key, sheet) in self.books.iter_mut() {
            let mut touched = false;
            for (coord, cell) in sheet.cells_mut() {
                if cell.has_script() {
                    if let Some(new) = rewrite_tags(&cell.script, &map) {
                        cell.script = new.clone();
                        touched = true;
                        if let Some(id) = cell.cell_id {
                            updates.push((key.clone(), id, new, coord));
                        }
                    }
                }
                if !cell.options_range.is_empty() {
                    if let Some(tag) = parse_plain(&cell.options_range) {
                        if let Some(new) = map(&tag) {
                            cell.options_range = new.to_plain();
                            touched = true;
                        }
                    }
                }
            }
            if touched {
                changed.push(key.clone());
            }
        }

        for (home, id, script, coord) in updates {
            self.tracker.update(&home, id, &script, coord);
        }
        changed
    }

    // -------------------------------------------------------------------
    // Persistence and notifications
    // -------------------------------------------------------------------

    fn mark_dirty(&mut self, key: &SheetKey) {
        self.dirty.insert(key.clone(), Instant::now());
    }

    /// Persist dirty sheets; only those quiet for the debounce window
    /// unless forced.
    fn persist(&mut self, force: bool) {
        let now = Instant::now();
        let due: Vec<SheetKey> = self
            .dirty
            .iter()
            .filter(|(_, t)| force || now.duration_since(**t) >= self.config.persist_debounce)
            .map(|(k, _)| k.clone())
            .collect();

        for key in due {
            self.dirty.remove(&key);
            let Some(sheet) = self.books.get(&key) else {
                continue;
            };
            if let Err(e) = self.store.save(sheet) {
                tracing::error!("failed to persist {key}: {e}");
            }
        }
    }

    /// Send at most one notification per changed sheet
    fn publish(&mut self) {
        for (key, kind) in self.queues.drain_broadcasts() {
            self.hub.publish(SheetChange::new(&key, kind));
        }
    }
}

fn apply_grid(sheet: &mut Sheet, op: ShiftOp) {
    match (op.axis, op.kind) {
        (Axis::Row, ShiftKind::Insert(at)) => sheet.insert_row(at),
        (Axis::Row, ShiftKind::Delete(at)) => sheet.delete_row(at),
        (Axis::Row, ShiftKind::Move { from, to }) => sheet.move_row(from, to),
        (Axis::Col, ShiftKind::Insert(at)) => sheet.insert_col(at),
        (Axis::Col, ShiftKind::Delete(at)) => sheet.delete_col(at),
        (Axis::Col, ShiftKind::Move { from, to }) => sheet.move_col(from, to),
    }
}

fn audit_action(op: ShiftOp) -> AuditAction {
    match (op.axis, op.kind) {
        (Axis::Row, ShiftKind::Insert(_)) => AuditAction::InsertRow,
        (Axis::Row, ShiftKind::Delete(_)) => AuditAction::DeleteRow,
        (Axis::Row, ShiftKind::Move { .. }) => AuditAction::MoveRow,
        (Axis::Col, ShiftKind::Insert(_)) => AuditAction::InsertColumn,
        (Axis::Col, ShiftKind::Delete(_)) => AuditAction::DeleteColumn,
        (Axis::Col, ShiftKind::Move { .. }) => AuditAction::MoveColumn,
    }
}

fn op_index(op: ShiftOp) -> (u32, Option<u32>) {
    match op.kind {
        ShiftKind::Insert(at) | ShiftKind::Delete(at) => (at, None),
        ShiftKind::Move { from, to } => (from, Some(to)),
    }
}

/// Scripts owning output spans in the region an edit touches, captured
/// before the grid shifts: both anchors declaring a span and cells locked
/// under a span.
fn span_owners_in_region(sheet: &Sheet, op: ShiftOp) -> Vec<CellId> {
    let in_region = |idx: u32| match op.kind {
        ShiftKind::Insert(at) | ShiftKind::Delete(at) => idx >= at,
        ShiftKind::Move { from, to } => idx >= from.min(to) && idx <= from.max(to),
    };

    let mut owners = Vec::new();
    for (coord, cell) in sheet.cells() {
        let idx = match op.axis {
            Axis::Row => coord.row,
            Axis::Col => coord.col,
        };
        if !in_region(idx) {
            continue;
        }
        let candidate = match cell.lock {
            Some(LockOwner::ScriptSpan(id)) => Some(id),
            _ => cell
                .cell_id
                .filter(|_| cell.has_script() && (cell.output_row_span > 1 || cell.output_col_span > 1)),
        };
        if let Some(id) = candidate {
            if !owners.contains(&id) {
                owners.push(id);
            }
        }
    }
    owners
}
