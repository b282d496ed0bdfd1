//! End-to-end scenarios against a scripted server.

use rowsync_db::{ChangeState, DatabaseWatcher};
use rowsync_engine::{
    CloudTransformer, Engine, EngineConfig, EngineState, ErrorEvent, ErrorType, MockServer,
    MockSocketFactory, PlainCloudTransformer, StaticAuthenticator, SyncPhase,
};
use rowsync_protocol::{
    Account, Changed, Changes, ChangesDone, CloudData, FieldValue, Fields, Identify, LocalData,
    Message, ObjectKey, Timestamp, UploadAck, Welcome,
};
use rusqlite::{Connection, OptionalExtension};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

type TestEngine = Engine<MockSocketFactory, StaticAuthenticator, PlainCloudTransformer>;

struct Harness {
    engine: TestEngine,
    server: MockServer,
    errors: Rc<RefCell<Vec<ErrorEvent>>>,
}

fn harness() -> Harness {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT, body TEXT);")
        .unwrap();
    let watcher = DatabaseWatcher::new(conn).unwrap();

    let server = MockServer::new();
    let mut engine = Engine::new(
        EngineConfig::new("wss://remote.test", "access-key").with_device_name("device-a"),
        watcher,
        MockSocketFactory::new(server.clone()),
        StaticAuthenticator::new("user-1", "token-1"),
        PlainCloudTransformer::new(),
    );

    let errors: Rc<RefCell<Vec<ErrorEvent>>> = Rc::default();
    let sink = Rc::clone(&errors);
    engine.on_error(move |e| sink.borrow_mut().push(e.clone()));

    Harness {
        engine,
        server,
        errors,
    }
}

impl Harness {
    /// Starts the engine and completes registration or login.
    fn start_and_login(&mut self) {
        self.engine.start();
        self.engine.pump(Instant::now());
        self.handshake();
    }

    fn handshake(&mut self) {
        self.server
            .push_message(&Message::Identify(Identify { nonce: [1u8; 32] }));
        self.engine.pump(Instant::now());
        let (sent, _) = self.server.take_sent();
        match sent.first() {
            Some(Message::Register(_)) => self.server.push_message(&Message::Account(Account {
                device_id: [7u8; 16],
            })),
            Some(Message::Login(_)) => self.server.push_message(&Message::Welcome(Welcome)),
            other => panic!("expected handshake message, got {other:?}"),
        }
        self.engine.pump(Instant::now());
    }

    /// Answers the outstanding pull with the given records, then drains
    /// the cycle to Idle (acknowledging any uploads verbatim).
    fn serve_download(&mut self, records: Vec<CloudData>) {
        self.server.push_message(&Message::Changes(Changes {
            table: "notes".into(),
            records,
        }));
        self.server.push_message(&Message::ChangesDone(ChangesDone {
            table: "notes".into(),
        }));
        self.settle();
    }

    /// Pumps until the engine stops making progress, acking uploads.
    fn settle(&mut self) {
        for _ in 0..10 {
            self.engine.pump(Instant::now());
            let (sent, _) = self.server.take_sent();
            let mut answered = false;
            for message in sent {
                if let Message::Upload(upload) = message {
                    self.server.push_message(&Message::UploadAck(UploadAck {
                        key: upload.record.key,
                        modified: upload.record.modified,
                    }));
                    answered = true;
                }
            }
            if !answered && self.engine.state() == EngineState::Active(SyncPhase::Idle) {
                break;
            }
        }
    }

    fn conn(&mut self) -> &Connection {
        self.engine.watcher().connection()
    }

    fn shadow(&mut self, id: i64) -> Option<(i64, String, i64)> {
        self.conn()
            .query_row(
                "SELECT changed, modified, tombstone FROM __qtds_notes WHERE pkey = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .unwrap()
    }

    fn title(&mut self, id: i64) -> Option<String> {
        self.conn()
            .query_row("SELECT title FROM notes WHERE id = ?1", [id], |r| r.get(0))
            .optional()
            .unwrap()
    }
}

fn note_key(id: &str) -> ObjectKey {
    ObjectKey::new("__qtds_notes", id)
}

fn cloud_record(id: &str, millis: i64, title: &str) -> CloudData {
    let mut fields = Fields::new();
    fields.insert("title".into(), FieldValue::Text(title.into()));
    fields.insert("body".into(), FieldValue::Text("body".into()));
    let local = LocalData::new(note_key(id), Timestamp::from_millis(millis), fields);
    PlainCloudTransformer::new().transform_upload(&local).unwrap()
}

fn cloud_tombstone(id: &str, millis: i64) -> CloudData {
    let local = LocalData::tombstone(note_key(id), Timestamp::from_millis(millis));
    PlainCloudTransformer::new().transform_upload(&local).unwrap()
}

#[test]
fn fresh_device_download() {
    let mut h = harness();
    h.engine.sync_table("notes", &[], None).unwrap();
    h.start_and_login();

    let (sent, _) = h.server.take_sent();
    assert!(
        sent.iter().any(|m| matches!(
            m,
            Message::GetChanges(g) if g.table == "notes" && g.since == Timestamp::epoch()
        )),
        "fresh table pulls from the epoch, got {sent:?}"
    );

    h.serve_download(vec![
        cloud_record("1", 10, "a"),
        cloud_record("2", 20, "b"),
    ]);

    assert_eq!(h.title(1).as_deref(), Some("a"));
    assert_eq!(h.title(2).as_deref(), Some("b"));
    assert_eq!(
        h.engine.watcher().last_sync("notes").unwrap(),
        Timestamp::from_millis(20)
    );
    assert_eq!(h.shadow(1).unwrap().0, 0, "shadow unchanged");
    assert_eq!(h.shadow(2).unwrap().0, 0, "shadow unchanged");
    assert_eq!(h.engine.state(), EngineState::Active(SyncPhase::Idle));
    assert_eq!(h.engine.stats().records_downloaded, 2);
}

#[test]
fn local_wins_conflict() {
    let mut h = harness();
    h.engine.sync_table("notes", &[], None).unwrap();

    // Shadow[K] = Changed at t=30 with local value "L".
    h.conn()
        .execute_batch(
            "INSERT INTO notes VALUES (1, 'L', 'body'); \
             UPDATE __qtds_notes SET modified = '1970-01-01T00:00:00.030Z' WHERE pkey = 1;",
        )
        .unwrap();

    h.start_and_login();
    h.serve_download(vec![cloud_record("1", 25, "R")]);

    assert_eq!(h.title(1).as_deref(), Some("L"), "local row kept");
    let (changed, modified, _) = h.shadow(1).unwrap();
    assert_eq!(modified, "1970-01-01T00:00:00.030Z", "shadow untouched");
    // The row was re-uploaded during the cycle and acknowledged.
    assert_eq!(changed, 0);
    assert_eq!(h.engine.stats().records_uploaded, 1);
    assert_eq!(
        h.engine.watcher().last_sync("notes").unwrap(),
        Timestamp::epoch(),
        "losing download does not advance last-sync"
    );
}

#[test]
fn upload_with_concurrent_edit_stays_dirty() {
    let mut h = harness();
    h.engine.sync_table("notes", &[], None).unwrap();
    h.conn()
        .execute_batch(
            "INSERT INTO notes VALUES (1, 'v40', 'body'); \
             UPDATE __qtds_notes SET modified = '1970-01-01T00:00:00.040Z' WHERE pkey = 1;",
        )
        .unwrap();

    h.start_and_login();
    // Pull side is empty; the engine moves on to uploading.
    h.server.push_message(&Message::ChangesDone(ChangesDone {
        table: "notes".into(),
    }));
    h.engine.pump(Instant::now());
    h.engine.pump(Instant::now());

    let (sent, _) = h.server.take_sent();
    let upload = sent
        .iter()
        .find_map(|m| match m {
            Message::Upload(u) => Some(u.record.clone()),
            _ => None,
        })
        .expect("upload of the pending row");
    assert_eq!(upload.modified, Timestamp::from_millis(40));

    // The user edits the row while the upload is in flight.
    h.conn()
        .execute_batch(
            "UPDATE notes SET title = 'v41' WHERE id = 1; \
             UPDATE __qtds_notes SET modified = '1970-01-01T00:00:00.041Z' WHERE pkey = 1;",
        )
        .unwrap();

    // Ack arrives for t=40: the row must stay Changed...
    h.server.push_message(&Message::UploadAck(UploadAck {
        key: note_key("1"),
        modified: Timestamp::from_millis(40),
    }));
    h.engine.pump(Instant::now());
    // ...and the next cycle uploads t=41.
    let (sent, _) = h.server.take_sent();
    let second = sent
        .iter()
        .find_map(|m| match m {
            Message::Upload(u) => Some(u.record.clone()),
            _ => None,
        })
        .expect("re-upload of the newer edit");
    assert_eq!(second.modified, Timestamp::from_millis(41));
}

#[test]
fn tombstone_convergence() {
    let mut h = harness();
    h.engine.sync_table("notes", &[], None).unwrap();
    h.start_and_login();

    // Device B holds K at t=30, Unchanged.
    h.serve_download(vec![cloud_record("1", 30, "kept")]);
    assert_eq!(h.title(1).as_deref(), Some("kept"));

    // Device A deleted K at t=50; B downloads the tombstone.
    h.server.push_message(&Message::Changed(Changed {
        table: "notes".into(),
    }));
    h.engine.pump(Instant::now());
    h.serve_download(vec![cloud_tombstone("1", 50)]);

    assert_eq!(h.title(1), None, "row deleted");
    let (changed, modified, tombstone) = h.shadow(1).unwrap();
    assert_eq!(changed, 0);
    assert_eq!(tombstone, 1);
    assert_eq!(modified, "1970-01-01T00:00:00.050Z");
    assert!(h.engine.watcher().last_sync("notes").unwrap() >= Timestamp::from_millis(50));
}

#[test]
fn corrupt_payload_is_isolated() {
    let mut h = harness();
    h.engine.sync_table("notes", &[], None).unwrap();
    h.start_and_login();

    let mut corrupt = cloud_record("2", 20, "evil");
    corrupt.tag[0] ^= 0xFF;

    h.serve_download(vec![
        cloud_record("1", 10, "good"),
        corrupt,
        cloud_record("3", 30, "also good"),
    ]);

    // The two intact records apply normally.
    assert_eq!(h.title(1).as_deref(), Some("good"));
    assert_eq!(h.title(3).as_deref(), Some("also good"));
    assert_eq!(h.title(2), None);

    // Exactly one Transform error, and the key is Corrupted.
    let errors = h.errors.borrow();
    let transform_errors: Vec<_> = errors
        .iter()
        .filter(|e| e.error_type == ErrorType::Transform)
        .collect();
    assert_eq!(transform_errors.len(), 1);
    drop(errors);
    assert_eq!(
        h.engine.watcher().change_state(&note_key("2")).unwrap(),
        Some(ChangeState::Corrupted)
    );

    // Corrupted keys are excluded from future uploads.
    assert!(h.engine.watcher().load_data("notes").unwrap().is_none());
}

#[test]
fn reconnect_resumes_with_same_last_sync() {
    let mut h = harness();
    h.engine.sync_table("notes", &[], None).unwrap();
    h.start_and_login();
    h.serve_download(vec![cloud_record("1", 20, "a")]);
    assert_eq!(h.engine.state(), EngineState::Active(SyncPhase::Idle));

    // The server goes away.
    let t0 = Instant::now();
    let connects = h.server.connect_count();
    h.server.drop_connection();
    h.engine.pump(t0);

    let errors = h.errors.borrow();
    assert_eq!(
        errors
            .iter()
            .filter(|e| e.error_type == ErrorType::Network)
            .count(),
        1,
        "exactly one network error"
    );
    drop(errors);

    // Backoff holds the line, then reconnects.
    h.engine.pump(t0 + Duration::from_millis(100));
    assert_eq!(h.server.connect_count(), connects);
    h.engine.pump(t0 + Duration::from_secs(2));
    assert_eq!(h.server.connect_count(), connects + 1);

    // This time the persisted device id logs in instead of registering.
    h.server
        .push_message(&Message::Identify(Identify { nonce: [2u8; 32] }));
    h.engine.pump(t0 + Duration::from_secs(2));
    let (sent, _) = h.server.take_sent();
    assert!(matches!(sent.first(), Some(Message::Login(_))));
    h.server.push_message(&Message::Welcome(Welcome));
    h.engine.pump(t0 + Duration::from_secs(2));

    // The engine re-enters downloading with the stored last-sync.
    let (sent, _) = h.server.take_sent();
    assert!(
        sent.iter().any(|m| matches!(
            m,
            Message::GetChanges(g) if g.table == "notes"
                && g.since == Timestamp::from_millis(20)
        )),
        "expected pull from t=20, got {sent:?}"
    );
}

#[test]
fn stop_drains_inflight_upload() {
    let mut h = harness();
    h.engine.sync_table("notes", &[], None).unwrap();
    h.conn()
        .execute_batch(
            "INSERT INTO notes VALUES (1, 'pending', 'body'); \
             UPDATE __qtds_notes SET modified = '1970-01-01T00:00:00.060Z' WHERE pkey = 1;",
        )
        .unwrap();
    h.start_and_login();
    h.server.push_message(&Message::ChangesDone(ChangesDone {
        table: "notes".into(),
    }));
    h.engine.pump(Instant::now());
    h.engine.pump(Instant::now());

    // An upload is in flight; stop must wait for its acknowledgement.
    let (sent, _) = h.server.take_sent();
    assert!(sent.iter().any(|m| matches!(m, Message::Upload(_))));
    h.engine.stop();
    h.engine.pump(Instant::now());
    assert_eq!(h.engine.state(), EngineState::Stopping);

    h.server.push_message(&Message::UploadAck(UploadAck {
        key: note_key("1"),
        modified: Timestamp::from_millis(60),
    }));
    assert!(h.engine.wait_for_stopped(Duration::from_secs(1)));
    assert_eq!(h.shadow(1).unwrap().0, 0, "ack was committed before close");
}

#[test]
fn second_device_converges_on_first_device_data() {
    // A full little fleet: device A uploads, device B downloads the same
    // records through its own engine and ends bit-identical.
    let mut a = harness();
    a.engine.sync_table("notes", &[], None).unwrap();
    a.conn()
        .execute_batch(
            "INSERT INTO notes VALUES (1, 'shared', 'row'); \
             UPDATE __qtds_notes SET modified = '1970-01-01T00:00:00.100Z' WHERE pkey = 1;",
        )
        .unwrap();
    a.start_and_login();
    a.server.push_message(&Message::ChangesDone(ChangesDone {
        table: "notes".into(),
    }));
    a.engine.pump(Instant::now());
    a.engine.pump(Instant::now());

    let (sent, _) = a.server.take_sent();
    let uploaded = sent
        .iter()
        .find_map(|m| match m {
            Message::Upload(u) => Some(u.record.clone()),
            _ => None,
        })
        .expect("device A uploads its row");

    let mut b = harness();
    b.engine.sync_table("notes", &[], None).unwrap();
    b.start_and_login();
    b.serve_download(vec![uploaded]);

    assert_eq!(b.title(1).as_deref(), Some("shared"));
    assert_eq!(
        b.engine.watcher().last_sync("notes").unwrap(),
        Timestamp::from_millis(100)
    );
}
