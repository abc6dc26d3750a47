//! End-to-end bridge test: a real plugin endpoint served over a
//! socketpair, driven through the host adapter.

#![cfg(unix)]

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use plugtab_common::protocol::{self, PluginConfig, Request, Response};
use plugtab_common::{
    ColumnSpec, ColumnType, PlugError, QueryConstraint, Result, TableDescriptor, Value,
};
use plugtab_host::vtab::{IndexConstraint, IndexInfo, RawOp};
use plugtab_host::{PluginChannel, PluginTable, VTab, VTabCursor};
use plugtab_plugin::{Plugin, Table, TableCreator, TableCreatorArgs, TableReader};
use pretty_assertions::assert_eq;

/// A crates directory: paginated reads, insert support.
struct CratesTable {
    rows: Arc<parking_lot::Mutex<Vec<(i64, String)>>>,
    inserted: Arc<AtomicU64>,
}

struct CratesReader {
    rows: Vec<(i64, String)>,
    offset: usize,
}

impl Table for CratesTable {
    fn create_reader(&mut self) -> Box<dyn TableReader> {
        Box::new(CratesReader {
            rows: self.rows.lock().clone(),
            offset: 0,
        })
    }

    fn insert(&mut self, rows: Vec<Vec<Value>>) -> Result<()> {
        let mut stored = self.rows.lock();
        for row in rows {
            let (Some(Value::Int(id)), Some(Value::String(name))) = (row.first(), row.get(1))
            else {
                return Err(PlugError::Query("malformed insert row".into()));
            };
            stored.push((*id, name.clone()));
            self.inserted.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl TableReader for CratesReader {
    // Two rows per batch, exercising the multi-fetch path.
    fn query(&mut self, _constraint: &QueryConstraint) -> Result<(Vec<Vec<Value>>, bool)> {
        let batch: Vec<Vec<Value>> = self.rows[self.offset..]
            .iter()
            .take(2)
            .map(|(id, name)| vec![Value::Int(*id), Value::String(name.clone())])
            .collect();
        self.offset += batch.len();
        Ok((batch, self.offset >= self.rows.len()))
    }
}

fn crates_creator(inserted: Arc<AtomicU64>) -> TableCreator {
    Box::new(move |_args: TableCreatorArgs| {
        let mut descriptor = TableDescriptor::new(vec![
            ColumnSpec::new("id", ColumnType::Int),
            ColumnSpec::new("name", ColumnType::String),
        ]);
        descriptor.primary_key = Some(0);
        descriptor.handles_insert = true;
        descriptor.buffer_insert = 2;

        let table = CratesTable {
            rows: Arc::new(parking_lot::Mutex::new(vec![
                (1, "serde".into()),
                (2, "tokio".into()),
                (3, "tracing".into()),
                (4, "regex".into()),
                (5, "rayon".into()),
            ])),
            inserted: Arc::clone(&inserted),
        };
        Ok((Box::new(table) as Box<dyn Table>, descriptor))
    })
}

/// Serve `plugin` on one end of a socketpair, return the host's stream.
fn serve_in_background(plugin: Plugin) -> (UnixStream, std::thread::JoinHandle<Result<()>>) {
    let (host_side, plugin_side) = UnixStream::pair().expect("socketpair");
    let handle = std::thread::spawn(move || {
        let reader = plugin_side.try_clone().expect("clone plugin stream");
        plugin.serve_on(reader, plugin_side)
    });
    (host_side, handle)
}

fn drain(cursor: &mut plugtab_host::PluginCursor, width: usize) -> Vec<Vec<Value>> {
    let mut rows = Vec::new();
    while !cursor.eof() {
        rows.push((0..width).map(|i| cursor.column(i).unwrap()).collect());
        cursor.next().unwrap();
    }
    rows
}

#[test]
fn scans_and_writes_round_trip() {
    let inserted = Arc::new(AtomicU64::new(0));
    let mut plugin = Plugin::new();
    plugin.register(0, {
        let creator = crates_creator(Arc::clone(&inserted));
        move |args| creator(args)
    })
    .unwrap();

    let (host_side, handle) = serve_in_background(plugin);
    let reader = host_side.try_clone().expect("clone host stream");
    let channel = Arc::new(PluginChannel::over(reader, host_side).expect("handshake"));
    assert_eq!(channel.tables(), &[0]);

    let mut table =
        PluginTable::create(Arc::clone(&channel) as _, 0, PluginConfig::new()).unwrap();
    assert!(table.schema_sql().contains("\"name\" TEXT"));

    // Unconstrained scan over three plugin batches (2 + 2 + 1).
    let plan = table.best_index(&IndexInfo::default()).unwrap();
    let mut cursor = table.open().unwrap();
    cursor.filter(&plan.plan, vec![]).unwrap();
    assert_eq!(cursor.rowid().unwrap(), 1);
    let rows = drain(&mut cursor, 2);
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[0], vec![Value::Int(1), Value::String("serde".into())]);

    // Constrained scan, re-filtered host-side whatever the plugin did.
    let plan = table
        .best_index(&IndexInfo {
            constraints: vec![IndexConstraint {
                column: 1,
                op: RawOp::Eq,
                usable: true,
            }],
            order_by: vec![],
        })
        .unwrap();
    cursor
        .filter(&plan.plan, vec![Value::String("tokio".into())])
        .unwrap();
    assert_eq!(
        drain(&mut cursor, 2),
        vec![vec![Value::Int(2), Value::String("tokio".into())]]
    );

    // Three inserts against a threshold of two: one batch at the
    // threshold, the straggler on disconnect.
    table
        .insert(vec![Value::Int(6), Value::String("chrono".into())])
        .unwrap();
    assert_eq!(inserted.load(Ordering::SeqCst), 0);
    table
        .insert(vec![Value::Int(7), Value::String("thiserror".into())])
        .unwrap();
    assert_eq!(inserted.load(Ordering::SeqCst), 2);
    table
        .insert(vec![Value::Int(8), Value::String("parking_lot".into())])
        .unwrap();
    assert_eq!(inserted.load(Ordering::SeqCst), 2);

    table.disconnect().unwrap();
    assert_eq!(inserted.load(Ordering::SeqCst), 3);

    channel.close();
    handle.join().expect("serve thread").expect("clean shutdown");
}

#[test]
fn new_scans_observe_buffered_writes() {
    let inserted = Arc::new(AtomicU64::new(0));
    let mut plugin = Plugin::new();
    plugin.register(0, {
        let creator = crates_creator(Arc::clone(&inserted));
        move |args| creator(args)
    })
    .unwrap();

    let (host_side, handle) = serve_in_background(plugin);
    let reader = host_side.try_clone().expect("clone host stream");
    let channel = Arc::new(PluginChannel::over(reader, host_side).expect("handshake"));

    let mut table =
        PluginTable::create(Arc::clone(&channel) as _, 0, PluginConfig::new()).unwrap();
    table
        .insert(vec![Value::Int(6), Value::String("chrono".into())])
        .unwrap();
    // Still buffered; the filter below must flush it first.
    assert_eq!(inserted.load(Ordering::SeqCst), 0);

    let plan = table.best_index(&IndexInfo::default()).unwrap();
    let mut cursor = table.open().unwrap();
    cursor.filter(&plan.plan, vec![]).unwrap();
    assert_eq!(inserted.load(Ordering::SeqCst), 1);
    assert_eq!(drain(&mut cursor, 2).len(), 6);

    table.disconnect().unwrap();
    channel.close();
    handle.join().expect("serve thread").expect("clean shutdown");
}

/// Two statements attaching the same table index over one channel must
/// scan independently: interleaving one scan with another, or with the
/// other attach's schema negotiation, must not disturb either row stream.
#[test]
fn concurrent_attaches_scan_independently() {
    let inserted = Arc::new(AtomicU64::new(0));
    let mut plugin = Plugin::new();
    plugin.register(0, {
        let creator = crates_creator(Arc::clone(&inserted));
        move |args| creator(args)
    })
    .unwrap();

    let (host_side, handle) = serve_in_background(plugin);
    let reader = host_side.try_clone().expect("clone host stream");
    let channel = Arc::new(PluginChannel::over(reader, host_side).expect("handshake"));

    let mut table_a =
        PluginTable::create(Arc::clone(&channel) as _, 0, PluginConfig::new()).unwrap();
    let plan_a = table_a.best_index(&IndexInfo::default()).unwrap();
    let mut cursor_a = table_a.open().unwrap();
    cursor_a.filter(&plan_a.plan, vec![]).unwrap();
    assert_eq!(cursor_a.column(0).unwrap(), Value::Int(1));
    cursor_a.next().unwrap();

    // Second attach arrives mid-scan and drains the whole table.
    let mut table_b =
        PluginTable::create(Arc::clone(&channel) as _, 0, PluginConfig::new()).unwrap();
    let plan_b = table_b.best_index(&IndexInfo::default()).unwrap();
    let mut cursor_b = table_b.open().unwrap();
    cursor_b.filter(&plan_b.plan, vec![]).unwrap();
    let ids_b: Vec<Value> = drain(&mut cursor_b, 2).into_iter().map(|mut r| r.remove(0)).collect();
    assert_eq!(
        ids_b,
        vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4), Value::Int(5)]
    );

    // The first scan resumes where it left off, missing nothing.
    let mut ids_a = vec![Value::Int(1)];
    ids_a.extend(drain(&mut cursor_a, 2).into_iter().map(|mut r| r.remove(0)));
    assert_eq!(
        ids_a,
        vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4), Value::Int(5)]
    );

    table_a.disconnect().unwrap();
    table_b.disconnect().unwrap();
    channel.close();
    handle.join().expect("serve thread").expect("clean shutdown");
}

/// A host whose handshake is rejected must fail before any table call.
#[test]
fn rejected_handshake_fails_before_initialize() {
    let (host_side, remote_side) = UnixStream::pair().expect("socketpair");

    let handle = std::thread::spawn(move || {
        let mut reader = remote_side.try_clone().expect("clone stream");
        let mut writer = remote_side;
        let first: Option<Request> = protocol::read_frame(&mut reader).unwrap();
        assert!(matches!(first, Some(Request::Handshake { .. })));
        protocol::write_frame(
            &mut writer,
            &Response::error(&PlugError::Handshake("unknown cookie".into())),
        )
        .unwrap();
        // The host must hang up instead of sending Initialize.
        let next: Option<Request> = protocol::read_frame(&mut reader).unwrap();
        assert_eq!(next, None);
    });

    let reader = host_side.try_clone().expect("clone host stream");
    let err = PluginChannel::over(reader, host_side).unwrap_err();
    assert_eq!(err, PlugError::Handshake("unknown cookie".into()));
    handle.join().expect("remote thread");
}
