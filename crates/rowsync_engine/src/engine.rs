//! The engine state machine.
//!
//! A tagged-state enum plus an event queue: one event is consumed at a
//! time and its entry action runs to completion before the next event is
//! drawn. The engine is single-threaded; socket and timer completions are
//! folded in through [`Engine::pump`].

use crate::auth::{AuthEvent, Authenticator};
use crate::config::EngineConfig;
use crate::connector::{
    ConnectorEvent, MemorySettings, RemoteConnector, SettingsStore, SocketFactory,
};
use crate::error::{ErrorEvent, SyncError, SyncResult};
use crate::scheduler::{DirtyTables, SyncSide};
use crate::transformer::CloudTransformer;
use rowsync_db::DatabaseWatcher;
use rowsync_protocol::CloudData;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Sub-state of [`EngineState::Active`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Pulling cloud-dirty tables.
    Downloading,
    /// Pushing local-dirty tables.
    Uploading,
    /// In sync; waiting for triggers.
    Idle,
}

/// Top-level engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not started.
    Inactive,
    /// Waiting for the authenticator.
    SigningIn,
    /// Synchronizing.
    Active(SyncPhase),
    /// Stopped on a fatal error; `start` recovers.
    Error,
    /// Deleting the account.
    DeletingAcc,
    /// Draining work before going Inactive.
    Stopping,
}

/// Events driving the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EngineEvent {
    Start,
    SignedIn,
    Stop,
    DeleteAcc,
    Error,
    DlReady,
    DlContinue,
    UlContinue,
    SyncReady,
    TriggerSync,
    Stopped,
}

/// Counters over the engine's lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    /// Records committed from downloads.
    pub records_downloaded: u64,
    /// Records acknowledged by the server.
    pub records_uploaded: u64,
}

/// Top-level sequencing of watcher, connector, scheduler and transformer.
pub struct Engine<F: SocketFactory, A: Authenticator, T: CloudTransformer> {
    watcher: DatabaseWatcher,
    connector: RemoteConnector<F>,
    authenticator: A,
    transformer: T,
    dirty: DirtyTables,
    state: EngineState,
    queue: VecDeque<EngineEvent>,
    stats: EngineStats,
    last_error: Option<ErrorEvent>,
    error_handler: Option<Box<dyn FnMut(&ErrorEvent)>>,
    entering_error: bool,
}

impl<F: SocketFactory, A: Authenticator, T: CloudTransformer> Engine<F, A, T> {
    /// Creates an engine over the given collaborators with in-memory
    /// connector settings.
    pub fn new(
        config: EngineConfig,
        watcher: DatabaseWatcher,
        factory: F,
        authenticator: A,
        transformer: T,
    ) -> Self {
        Self::with_settings(
            config,
            watcher,
            factory,
            authenticator,
            transformer,
            Box::<MemorySettings>::default(),
        )
    }

    /// Creates an engine with explicit connector settings storage.
    pub fn with_settings(
        config: EngineConfig,
        watcher: DatabaseWatcher,
        factory: F,
        authenticator: A,
        transformer: T,
        settings: Box<dyn SettingsStore>,
    ) -> Self {
        let connector = RemoteConnector::new(factory, config, settings);
        Self {
            watcher,
            connector,
            authenticator,
            transformer,
            dirty: DirtyTables::new(),
            state: EngineState::Inactive,
            queue: VecDeque::new(),
            stats: EngineStats::default(),
            last_error: None,
            error_handler: None,
            entering_error: false,
        }
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Lifetime counters.
    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// The most recent surfaced error.
    pub fn last_error(&self) -> Option<&ErrorEvent> {
        self.last_error.as_ref()
    }

    /// The watcher, for table registration before start.
    pub fn watcher(&mut self) -> &mut DatabaseWatcher {
        &mut self.watcher
    }

    /// The connector, for state inspection.
    pub fn connector(&self) -> &RemoteConnector<F> {
        &self.connector
    }

    /// Registers an error handler; every surfaced error is delivered to
    /// it once.
    pub fn on_error(&mut self, handler: impl FnMut(&ErrorEvent) + 'static) {
        self.error_handler = Some(Box::new(handler));
    }

    /// Registers a table for synchronization and schedules it.
    pub fn sync_table(
        &mut self,
        name: &str,
        fields: &[String],
        pkey_type: Option<&str>,
    ) -> SyncResult<()> {
        self.watcher.add_table(name, fields, pkey_type)?;
        self.dirty.mark_dirty(name, SyncSide::Local);
        self.dirty.mark_dirty(name, SyncSide::Cloud);
        self.submit(EngineEvent::TriggerSync);
        Ok(())
    }

    /// Stops syncing a table, keeping its history for later re-adds.
    pub fn remove_table_sync(&mut self, name: &str) -> SyncResult<()> {
        self.watcher.remove_table(name)?;
        self.dirty.remove_table(name);
        Ok(())
    }

    /// Stops syncing a table and forgets its history.
    pub fn unsync_table(&mut self, name: &str) -> SyncResult<()> {
        self.watcher.unsync_table(name)?;
        self.dirty.remove_table(name);
        Ok(())
    }

    /// Tells the engine a table has new local changes.
    pub fn trigger_sync(&mut self, table: Option<&str>) {
        if let Some(table) = table {
            self.dirty.mark_dirty(table, SyncSide::Local);
        }
        self.submit(EngineEvent::TriggerSync);
    }

    /// Starts the engine (sign-in, connect, synchronize).
    pub fn start(&mut self) {
        self.submit(EngineEvent::Start);
    }

    /// Politely stops the engine: the current upload drains before the
    /// connection closes.
    pub fn stop(&mut self) {
        self.submit(EngineEvent::Stop);
    }

    /// Requests deletion of the whole account.
    ///
    /// Only a running engine can serve this; anywhere else the request
    /// fails with [`SyncError::InvalidState`].
    pub fn delete_account(&mut self) -> SyncResult<()> {
        if !matches!(self.state, EngineState::Active(_)) {
            return Err(SyncError::InvalidState {
                operation: "delete the account",
                state: format!("{:?}", self.state),
            });
        }
        self.submit(EngineEvent::DeleteAcc);
        Ok(())
    }

    /// Folds in I/O completions and timer ticks, then drains the event
    /// queue. Call this from the embedder's loop.
    pub fn pump(&mut self, now: Instant) {
        self.connector.tick(now);

        while let Some(event) = self.authenticator.take_event() {
            self.on_auth_event(event);
        }
        while let Some(event) = self.connector.take_event() {
            self.on_connector_event(event);
        }
        while let Some(event) = self.queue.pop_front() {
            self.transition(event);
        }
    }

    /// Pumps until the engine reaches Inactive or the timeout elapses.
    pub fn wait_for_stopped(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump(Instant::now());
            if self.state == EngineState::Inactive {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn submit(&mut self, event: EngineEvent) {
        self.queue.push_back(event);
    }

    fn on_auth_event(&mut self, event: AuthEvent) {
        match event {
            AuthEvent::TokenRefreshed(token) => {
                debug!("bearer token refreshed");
                self.connector.set_credentials(token);
            }
            AuthEvent::AccountDeleted(true) => {
                if self.state == EngineState::DeletingAcc {
                    self.submit(EngineEvent::Stop);
                }
            }
            AuthEvent::AccountDeleted(false) => {
                self.report(SyncError::Auth("account deletion failed".into()));
            }
        }
    }

    fn on_connector_event(&mut self, event: ConnectorEvent) {
        match event {
            ConnectorEvent::DownloadedData { table, records } => {
                self.apply_batch(&table, records);
            }
            ConnectorEvent::SyncDone { table } => {
                self.dirty.clear(&table, SyncSide::Cloud);
                self.submit(EngineEvent::DlContinue);
            }
            ConnectorEvent::UploadedData { key, modified } => {
                if let Err(e) = self.watcher.mark_unchanged(&key, &modified) {
                    self.report(SyncError::Database(e));
                } else {
                    self.stats.records_uploaded += 1;
                }
                if self.state == EngineState::Stopping {
                    if self.connector.pending_uploads() == 0 {
                        self.finish_stopping();
                    }
                } else {
                    self.submit(EngineEvent::UlContinue);
                }
            }
            ConnectorEvent::RemoteChanged { table } => {
                self.dirty.mark_dirty(&table, SyncSide::Cloud);
                self.submit(EngineEvent::TriggerSync);
            }
            ConnectorEvent::LoggedIn { device_id } => {
                debug!(%device_id, "connector logged in");
                if matches!(self.state, EngineState::Active(_)) {
                    let tables = self.watcher.tables().unwrap_or_default();
                    self.dirty.fill_dirty(SyncSide::Cloud, tables.iter().cloned());
                    self.dirty.fill_dirty(SyncSide::Local, tables.into_iter());
                    // A download phase parked on the handshake resumes
                    // here; an idle engine starts a fresh cycle.
                    match self.state {
                        EngineState::Active(SyncPhase::Downloading) => {
                            self.submit(EngineEvent::DlContinue);
                        }
                        _ => self.submit(EngineEvent::TriggerSync),
                    }
                }
            }
            ConnectorEvent::NetworkError { message } => {
                self.report(SyncError::Network(message));
            }
            ConnectorEvent::Disconnected => {
                // Orderly closure; the engine asked for it (stop, error
                // detach) or the embedder did, so there is nothing to
                // surface.
                debug!("connection closed");
            }
        }
    }

    /// Applies one download batch record by record; each record is its
    /// own transaction, so a bad record does not undo its predecessors.
    fn apply_batch(&mut self, table: &str, records: Vec<CloudData>) {
        for record in records {
            match self.transformer.transform_download(&record) {
                Ok(local) => match self.watcher.store_data(&local) {
                    Ok(()) => self.stats.records_downloaded += 1,
                    Err(e) => {
                        // Table stays cloud-dirty; retried next cycle.
                        self.report(SyncError::Database(e));
                        return;
                    }
                },
                Err(e) => {
                    let key = record.key.clone();
                    warn!(%key, table, "record failed to transform");
                    if let Err(db) = self.watcher.mark_corrupted(&key, &record.modified) {
                        self.report(SyncError::Database(db));
                    }
                    self.report(SyncError::Transform {
                        key,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    fn transition(&mut self, event: EngineEvent) {
        use EngineEvent as E;
        use EngineState as S;

        match (self.state, event) {
            (S::Inactive | S::Error, E::Start) => {
                self.state = S::SigningIn;
                self.enter_signing_in();
            }
            (S::SigningIn, E::SignedIn) => {
                self.state = S::Active(SyncPhase::Downloading);
                self.enter_active();
                self.enter_downloading();
            }
            (S::SigningIn | S::Active(_) | S::DeletingAcc, E::Error) => {
                self.state = S::Error;
                self.enter_error();
            }
            (S::Active(SyncPhase::Downloading), E::DlReady) => {
                self.state = S::Active(SyncPhase::Uploading);
                self.enter_uploading();
            }
            (S::Active(SyncPhase::Downloading), E::DlContinue) => {
                self.enter_downloading();
            }
            (S::Active(SyncPhase::Uploading), E::UlContinue) => {
                self.enter_uploading();
            }
            (S::Active(SyncPhase::Uploading), E::SyncReady) => {
                self.state = S::Active(SyncPhase::Idle);
                debug!("sync complete, engine idle");
            }
            (S::Active(SyncPhase::Idle), E::TriggerSync) => {
                self.state = S::Active(SyncPhase::Downloading);
                self.enter_downloading();
            }
            (S::Active(_), E::TriggerSync) => {
                // Already syncing; the dirty sets carry the new work.
            }
            (S::Active(_), E::Stop) | (S::DeletingAcc, E::Stop) => {
                self.state = S::Stopping;
                self.enter_stopping();
            }
            (S::Active(_), E::DeleteAcc) => {
                self.state = S::DeletingAcc;
                self.enter_deleting();
            }
            (S::Stopping, E::Stopped) => {
                self.state = S::Inactive;
                debug!("engine stopped");
            }
            (state, event) => {
                debug!(?state, ?event, "event ignored in state");
            }
        }
    }

    fn enter_signing_in(&mut self) {
        match self.authenticator.sign_in() {
            Ok(signin) => {
                debug!(user = signin.user_id.as_str(), "signed in");
                self.connector.set_credentials(signin.id_token);
                self.submit(EngineEvent::SignedIn);
            }
            Err(e) => self.report(SyncError::Auth(e.to_string())),
        }
    }

    fn enter_active(&mut self) {
        if let Err(e) = self.watcher.reactivate_tables() {
            self.report(SyncError::Database(e));
        }
        let tables = self.watcher.tables().unwrap_or_default();
        self.dirty.fill_dirty(SyncSide::Cloud, tables.iter().cloned());
        self.dirty.fill_dirty(SyncSide::Local, tables.into_iter());
        self.connector.reconnect();
    }

    fn enter_downloading(&mut self) {
        if !self.connector.is_ready() {
            // Still handshaking; LoggedIn re-triggers the download phase.
            return;
        }
        match self.dirty.next_dirty(SyncSide::Cloud) {
            Some(table) => match self.watcher.last_sync(&table) {
                Ok(since) => self.connector.get_changes(&table, &since),
                Err(e) => {
                    self.report(SyncError::Database(e));
                    self.dirty.clear(&table, SyncSide::Cloud);
                    self.submit(EngineEvent::DlContinue);
                }
            },
            None => self.submit(EngineEvent::DlReady),
        }
    }

    fn enter_uploading(&mut self) {
        loop {
            let Some(table) = self.dirty.next_dirty(SyncSide::Local) else {
                self.submit(EngineEvent::SyncReady);
                return;
            };
            match self.watcher.load_data(&table) {
                Ok(Some(data)) => match self.transformer.transform_upload(&data) {
                    Ok(cloud) => {
                        self.connector.upload_change(cloud);
                        return;
                    }
                    Err(e) => {
                        let key = data.key.clone();
                        if let Err(db) = self.watcher.mark_corrupted(&key, &data.modified) {
                            self.report(SyncError::Database(db));
                            // The row cannot be quarantined; skip the
                            // table this cycle rather than spin on it.
                            self.dirty.clear(&table, SyncSide::Local);
                        }
                        self.report(SyncError::Transform {
                            key,
                            message: e.to_string(),
                        });
                    }
                },
                Ok(None) => {
                    self.dirty.clear(&table, SyncSide::Local);
                }
                Err(e) => {
                    self.report(SyncError::Database(e));
                    self.dirty.clear(&table, SyncSide::Local);
                }
            }
        }
    }

    fn enter_error(&mut self) {
        self.entering_error = false;
        self.connector.close();
    }

    fn enter_stopping(&mut self) {
        if self.connector.pending_uploads() == 0 {
            self.finish_stopping();
        }
        // Otherwise the pending acknowledgements finish the stop.
    }

    fn finish_stopping(&mut self) {
        self.connector.close();
        self.submit(EngineEvent::Stopped);
    }

    fn enter_deleting(&mut self) {
        if let Err(e) = self.authenticator.delete_account() {
            self.report(SyncError::Auth(e.to_string()));
        }
        // Success arrives as AuthEvent::AccountDeleted.
    }

    fn report(&mut self, error: SyncError) {
        if self.entering_error {
            debug!(%error, "error coalesced during error transition");
            return;
        }
        let context = match &error {
            SyncError::Database(e) => e.table().map(str::to_owned),
            SyncError::Transform { key, .. } => Some(key.to_string()),
            _ => None,
        };
        let event = ErrorEvent {
            error_type: error.error_type(),
            message: error.to_string(),
            context,
        };
        error!(error_type = ?event.error_type, message = event.message.as_str(), "sync error");
        if let Some(handler) = self.error_handler.as_mut() {
            handler(&event);
        }
        self.last_error = Some(event);

        if error.is_fatal() {
            self.entering_error = true;
            self.submit(EngineEvent::Error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthenticator;
    use crate::connector::{MockServer, MockSocketFactory};
    use crate::transformer::PlainCloudTransformer;
    use rowsync_protocol::{Identify, Message, Welcome, Account};
    use rusqlite::Connection;

    type TestEngine = Engine<MockSocketFactory, StaticAuthenticator, PlainCloudTransformer>;

    fn test_engine() -> (TestEngine, MockServer) {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT, body TEXT);")
            .unwrap();
        let watcher = DatabaseWatcher::new(conn).unwrap();

        let server = MockServer::new();
        let engine = Engine::new(
            EngineConfig::new("wss://remote.test", "key"),
            watcher,
            MockSocketFactory::new(server.clone()),
            StaticAuthenticator::new("user-1", "token-1"),
            PlainCloudTransformer::new(),
        );
        (engine, server)
    }

    fn handshake(engine: &mut TestEngine, server: &MockServer) {
        server.push_message(&Message::Identify(Identify { nonce: [1u8; 32] }));
        engine.pump(Instant::now());
        let (sent, _) = server.take_sent();
        match sent.first() {
            Some(Message::Register(_)) => server.push_message(&Message::Account(Account {
                device_id: [7u8; 16],
            })),
            Some(Message::Login(_)) => server.push_message(&Message::Welcome(Welcome)),
            other => panic!("expected handshake message, got {other:?}"),
        }
        engine.pump(Instant::now());
    }

    #[test]
    fn starts_inactive() {
        let (engine, _) = test_engine();
        assert_eq!(engine.state(), EngineState::Inactive);
    }

    #[test]
    fn start_signs_in_and_connects() {
        let (mut engine, server) = test_engine();
        engine.sync_table("notes", &[], None).unwrap();
        engine.start();
        engine.pump(Instant::now());
        assert_eq!(engine.state(), EngineState::Active(SyncPhase::Downloading));

        handshake(&mut engine, &server);
        // Logged in: the engine asks for the dirty table's changes.
        let (sent, _) = server.take_sent();
        assert!(
            sent.iter().any(|m| matches!(m, Message::GetChanges(g) if g.table == "notes")),
            "expected GetChanges, got {sent:?}"
        );
    }

    #[test]
    fn sign_in_failure_enters_error() {
        let (mut engine, _) = test_engine();
        let mut seen = 0u32;
        // Count surfaced errors through the handler.
        // (The handler owns the counter; the assert reads the state.)
        engine.on_error(move |_| seen += 1);

        engine.authenticator.fail_next_sign_in("denied");
        engine.start();
        engine.pump(Instant::now());

        assert_eq!(engine.state(), EngineState::Error);
        assert!(engine.last_error().is_some());

        // A later start retries sign-in.
        engine.start();
        engine.pump(Instant::now());
        assert!(matches!(engine.state(), EngineState::Active(_)));
    }

    #[test]
    fn empty_dirty_sets_reach_idle() {
        let (mut engine, server) = test_engine();
        engine.start();
        engine.pump(Instant::now());
        handshake(&mut engine, &server);
        engine.pump(Instant::now());

        assert_eq!(engine.state(), EngineState::Active(SyncPhase::Idle));
    }

    #[test]
    fn stop_returns_to_inactive() {
        let (mut engine, server) = test_engine();
        engine.start();
        engine.pump(Instant::now());
        handshake(&mut engine, &server);
        engine.pump(Instant::now());

        engine.stop();
        assert!(engine.wait_for_stopped(Duration::from_secs(1)));
        assert_eq!(engine.state(), EngineState::Inactive);
    }

    #[test]
    fn delete_account_stops_engine() {
        let (mut engine, server) = test_engine();
        engine.start();
        engine.pump(Instant::now());
        handshake(&mut engine, &server);
        engine.pump(Instant::now());

        engine.delete_account().unwrap();
        engine.pump(Instant::now());
        engine.pump(Instant::now());
        assert_eq!(engine.state(), EngineState::Inactive);
    }

    #[test]
    fn delete_account_requires_running_engine() {
        use crate::error::ErrorType;

        let (mut engine, _) = test_engine();
        let err = engine.delete_account().unwrap_err();
        assert!(matches!(err, SyncError::InvalidState { .. }));
        assert_eq!(err.error_type(), ErrorType::Temporary);
        assert_eq!(engine.state(), EngineState::Inactive);
    }

    #[test]
    fn remote_change_triggers_download() {
        let (mut engine, server) = test_engine();
        engine.sync_table("notes", &[], None).unwrap();
        engine.start();
        engine.pump(Instant::now());
        handshake(&mut engine, &server);

        // Drain the initial cycle to Idle.
        let (sent, _) = server.take_sent();
        assert!(!sent.is_empty());
        server.push_message(&Message::ChangesDone(rowsync_protocol::ChangesDone {
            table: "notes".into(),
        }));
        engine.pump(Instant::now());
        engine.pump(Instant::now());
        assert_eq!(engine.state(), EngineState::Active(SyncPhase::Idle));

        server.push_message(&Message::Changed(rowsync_protocol::Changed {
            table: "notes".into(),
        }));
        engine.pump(Instant::now());
        assert_eq!(engine.state(), EngineState::Active(SyncPhase::Downloading));
        let (sent, _) = server.take_sent();
        assert!(sent
            .iter()
            .any(|m| matches!(m, Message::GetChanges(g) if g.table == "notes")));
    }
}
