//! Connections, transactions, and views.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::rows::{Cluster, Etcd, Minion, Row, RowData};
use crate::table::Table;
use crate::trigger::{Trigger, TriggerEntry};

#[derive(Default)]
struct TableState {
    rows: HashMap<u64, RowData>,
    seq: u64,
    trig_seq: u64,
    triggers: Vec<TriggerEntry>,
}

impl TableState {
    /// Notify triggers if the sequence number advanced since the last pass,
    /// pruning stopped entries as we go.
    fn alert(&mut self) {
        if self.seq == self.trig_seq {
            return;
        }
        self.trig_seq = self.seq;
        self.triggers.retain(|entry| entry.fire());
    }
}

struct Shared {
    tables: Vec<Mutex<TableState>>,
    next_id: AtomicU64,
}

/// A handle on the store. Cheap to clone; every control loop gets one.
#[derive(Clone)]
pub struct Conn {
    shared: Arc<Shared>,
}

impl Default for Conn {
    fn default() -> Self {
        Self::new()
    }
}

impl Conn {
    pub fn new() -> Conn {
        let tables = Table::ALL.iter().map(|_| Mutex::new(TableState::default())).collect();
        Conn {
            shared: Arc::new(Shared { tables, next_id: AtomicU64::new(1) }),
        }
    }

    /// Begin a transaction over the named tables. The closure passed to
    /// [`Txn::run`] may only touch those tables; the rest of the store stays
    /// available to other transactions.
    pub fn txn(&self, tables: &[Table]) -> Txn<'_> {
        let mut tables = tables.to_vec();
        tables.sort();
        tables.dedup();
        Txn { conn: self, tables }
    }

    /// Register a trigger that fires whenever any of `tables` commits.
    pub fn trigger(&self, tables: &[Table]) -> Trigger {
        let (trigger, _, _) = self.register_trigger(tables);
        trigger
    }

    /// [`Conn::trigger`], plus a periodic tick every `secs` seconds. The
    /// first tick is delivered immediately so loops run once at startup.
    pub fn trigger_tick(&self, secs: u64, tables: &[Table]) -> Trigger {
        let (trigger, tx, stopped) = self.register_trigger(tables);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs));
            loop {
                interval.tick().await;
                if stopped.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(mpsc::error::TrySendError::Closed(())) = tx.try_send(()) {
                    break;
                }
            }
        });
        trigger
    }

    fn register_trigger(&self, tables: &[Table]) -> (Trigger, mpsc::Sender<()>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::channel(1);
        let stopped = Arc::new(AtomicBool::new(false));
        for &t in tables {
            let mut state = self.lock_table(t);
            state.triggers.push(TriggerEntry { tx: tx.clone(), stopped: stopped.clone() });
        }
        (Trigger::new(rx, stopped.clone()), tx, stopped)
    }

    fn lock_table(&self, t: Table) -> MutexGuard<'_, TableState> {
        self.shared.tables[t.index()]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Read conveniences ──────────────────────────────────────────

    /// Select rows of one table matching `pred`, in a read transaction of
    /// its own.
    pub fn select<R: Row>(&self, pred: impl Fn(&R) -> bool) -> Vec<R> {
        self.txn(&[R::TABLE])
            .run(|view| Ok::<_, Infallible>(view.select(&pred)))
            .unwrap_or_else(|e| match e {})
    }

    /// All rows of one table.
    pub fn all<R: Row>(&self) -> Vec<R> {
        self.select(|_: &R| true)
    }

    /// This process's own Minion row, if it has been created.
    pub fn minion_self(&self) -> Option<Minion> {
        self.select(|m: &Minion| m.is_self).into_iter().next()
    }

    /// Whether this process currently holds the policy leadership.
    pub fn etcd_leader(&self) -> bool {
        self.all::<Etcd>().first().is_some_and(|e| e.leader)
    }

    /// The deployment namespace from the Cluster row.
    pub fn namespace(&self) -> Option<String> {
        let cluster = self.all::<Cluster>().into_iter().next()?;
        if cluster.namespace.is_empty() {
            None
        } else {
            Some(cluster.namespace)
        }
    }
}

/// A pending transaction; consumed by [`Txn::run`].
pub struct Txn<'a> {
    conn: &'a Conn,
    tables: Vec<Table>,
}

impl Txn<'_> {
    /// Run `f` against a staged view of the named tables.
    ///
    /// On `Ok` every insert, commit, and remove made through the view is
    /// promoted atomically and the affected tables' triggers fire. On `Err`
    /// the staged mutations are discarded and the error is returned
    /// verbatim; the store itself never retries.
    pub fn run<T, E>(self, f: impl FnOnce(&mut View) -> Result<T, E>) -> Result<T, E> {
        // Guards are acquired in canonical table order to keep concurrent
        // transactions deadlock free.
        let mut guards: Vec<(Table, MutexGuard<'_, TableState>)> = self
            .tables
            .iter()
            .map(|&t| (t, self.conn.lock_table(t)))
            .collect();

        let mut view = View {
            staged: guards.iter().map(|(t, g)| (*t, g.rows.clone())).collect(),
            dirty: HashSet::new(),
            next_id: &self.conn.shared.next_id,
        };

        let result = f(&mut view);

        if result.is_ok() {
            for (t, guard) in guards.iter_mut() {
                if view.dirty.contains(t) {
                    guard.rows = view.staged.remove(t).unwrap();
                    guard.seq += 1;
                    guard.alert();
                }
            }
        }

        result
    }
}

/// The staged state a transaction closure operates on.
pub struct View<'a> {
    staged: HashMap<Table, HashMap<u64, RowData>>,
    dirty: HashSet<Table>,
    next_id: &'a AtomicU64,
}

impl View<'_> {
    fn rows(&self, t: Table) -> &HashMap<u64, RowData> {
        self.staged
            .get(&t)
            .unwrap_or_else(|| panic!("table {t} is not part of this transaction"))
    }

    fn rows_mut(&mut self, t: Table) -> &mut HashMap<u64, RowData> {
        self.staged
            .get_mut(&t)
            .unwrap_or_else(|| panic!("table {t} is not part of this transaction"))
    }

    /// Create a new row with a fresh ID. IDs are assigned monotonically and
    /// never reused, even across transactions.
    pub fn insert<R: Row + Default>(&mut self) -> R {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut row = R::default();
        row.set_id(id);
        self.rows_mut(R::TABLE).insert(id, row.clone().into_data());
        self.dirty.insert(R::TABLE);
        row
    }

    /// Rows of `R`'s table matching `pred`, sorted by ID.
    pub fn select<R: Row>(&self, pred: impl Fn(&R) -> bool) -> Vec<R> {
        let mut rows: Vec<R> = self
            .rows(R::TABLE)
            .values()
            .cloned()
            .filter_map(R::from_data)
            .filter(|r| pred(r))
            .collect();
        rows.sort_by_key(Row::id);
        rows
    }

    /// All rows of `R`'s table, sorted by ID.
    pub fn all<R: Row>(&self) -> Vec<R> {
        self.select(|_: &R| true)
    }

    /// Persist a mutated copy of a row. A commit that changes nothing does
    /// not mark the table dirty, so no-op transactions fire no triggers.
    pub fn commit<R: Row>(&mut self, row: R) {
        let data = row.into_data();
        let id = data.id();
        let rows = self.rows_mut(R::TABLE);
        if rows.get(&id) == Some(&data) {
            return;
        }
        rows.insert(id, data);
        self.dirty.insert(R::TABLE);
    }

    /// Delete a row.
    pub fn remove<R: Row>(&mut self, row: &R) {
        if self.rows_mut(R::TABLE).remove(&row.id()).is_some() {
            self.dirty.insert(R::TABLE);
        }
    }

    /// This process's own Minion row.
    pub fn minion_self(&self) -> Option<Minion> {
        self.select(|m: &Minion| m.is_self).into_iter().next()
    }

    /// The singleton Etcd row.
    pub fn etcd(&self) -> Option<Etcd> {
        self.all::<Etcd>().into_iter().next()
    }

    /// The singleton Cluster row.
    pub fn cluster(&self) -> Option<Cluster> {
        self.all::<Cluster>().into_iter().next()
    }
}
