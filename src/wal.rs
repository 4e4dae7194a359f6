//! Write-ahead log and transaction manager.
//!
//! A transaction buffers log records in memory from `begin` until `commit`.
//! Only `commit` writes to the log file, in append order, followed by a
//! flush; a crash between `begin` and `commit` therefore loses the whole
//! transaction, which is exactly the atomicity the facade relies on.
//! Mount-time recovery replays the log from the beginning and stops at the
//! first torn or corrupt record.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Cursor, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::checksum::checksum;
use crate::error::FsError;
use crate::unix_now;

/// Default wall-clock budget for one transaction.
pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a record payload; anything larger is a torn record.
const MAX_PAYLOAD: u32 = 1 << 20;

/// Operation kinds recorded in the log. The numeric codes are part of the
/// on-disk format and must never be reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LogOp {
    /// A fresh inode record was written into a slot.
    CreateInode = 1,
    /// An existing inode record was replaced.
    UpdateInode = 2,
    /// An inode slot was zeroed and released.
    FreeInode = 3,
    /// A data or indirect block received new content.
    WriteBlock = 4,
    /// A block was released.
    FreeBlock = 5,
    /// A directory gained an entry.
    DirInsert = 6,
    /// A directory lost an entry.
    DirRemove = 7,
}

impl LogOp {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(LogOp::CreateInode),
            2 => Some(LogOp::UpdateInode),
            3 => Some(LogOp::FreeInode),
            4 => Some(LogOp::WriteBlock),
            5 => Some(LogOp::FreeBlock),
            6 => Some(LogOp::DirInsert),
            7 => Some(LogOp::DirRemove),
            _ => None,
        }
    }
}

/// One operation inside a transaction, with undo and redo payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub tx_id: u64,
    pub op: LogOp,
    pub inode: u32,
    pub block: u32,
    pub timestamp: u64,
    pub checksum: u32,
    /// Prior state, kept for undo.
    pub old_data: Vec<u8>,
    /// New state, applied on replay.
    pub new_data: Vec<u8>,
}

impl LogRecord {
    /// A record with no payloads. The transaction id is stamped by the
    /// manager when the record is appended.
    pub fn new(op: LogOp, inode: u32, block: u32) -> Self {
        LogRecord {
            tx_id: 0,
            op,
            inode,
            block,
            timestamp: unix_now(),
            checksum: 0,
            old_data: Vec::new(),
            new_data: Vec::new(),
        }
    }

    /// Attaches the redo payload.
    pub fn with_new_data(mut self, data: Vec<u8>) -> Self {
        self.new_data = data;
        self
    }

    /// Attaches the undo payload.
    pub fn with_old_data(mut self, data: Vec<u8>) -> Self {
        self.old_data = data;
        self
    }

    /// Recomputes the checksum over the serialized record with the
    /// checksum field zeroed.
    pub fn update_checksum(&mut self) {
        self.checksum = 0;
        self.checksum = checksum(&self.to_bytes());
    }

    /// True when the stored checksum matches the record content.
    pub fn is_valid(&self) -> bool {
        let mut copy = self.clone();
        copy.checksum = 0;
        self.checksum == checksum(&copy.to_bytes())
    }

    /// Serializes the record in its on-disk layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(36 + self.old_data.len() + self.new_data.len());
        let mut cur = Cursor::new(&mut buf);
        cur.write_u64::<LittleEndian>(self.tx_id).unwrap();
        cur.write_u32::<LittleEndian>(self.op as u32).unwrap();
        cur.write_u32::<LittleEndian>(self.inode).unwrap();
        cur.write_u32::<LittleEndian>(self.block).unwrap();
        cur.write_u64::<LittleEndian>(self.timestamp).unwrap();
        cur.write_u32::<LittleEndian>(self.checksum).unwrap();
        cur.write_u32::<LittleEndian>(self.old_data.len() as u32).unwrap();
        cur.write_all(&self.old_data).unwrap();
        cur.write_u32::<LittleEndian>(self.new_data.len() as u32).unwrap();
        cur.write_all(&self.new_data).unwrap();
        buf
    }

    /// Reads one record from the log.
    ///
    /// Returns `Ok(None)` on a clean end of file. Any partial read, unknown
    /// opcode or absurd payload length is a torn tail and returns an error;
    /// recovery stops there.
    pub fn read_from(r: &mut impl Read) -> Result<Option<Self>, FsError> {
        let tx_id = match r.read_u64::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let op_code = r.read_u32::<LittleEndian>()?;
        let op = LogOp::from_code(op_code).ok_or_else(|| FsError::CorruptedFilesystem {
            reason: format!("unknown log opcode {op_code}"),
        })?;
        let inode = r.read_u32::<LittleEndian>()?;
        let block = r.read_u32::<LittleEndian>()?;
        let timestamp = r.read_u64::<LittleEndian>()?;
        let stored_checksum = r.read_u32::<LittleEndian>()?;
        let old_len = r.read_u32::<LittleEndian>()?;
        if old_len > MAX_PAYLOAD {
            return Err(FsError::CorruptedFilesystem {
                reason: format!("log record old payload of {old_len} bytes"),
            });
        }
        let mut old_data = vec![0u8; old_len as usize];
        r.read_exact(&mut old_data)?;
        let new_len = r.read_u32::<LittleEndian>()?;
        if new_len > MAX_PAYLOAD {
            return Err(FsError::CorruptedFilesystem {
                reason: format!("log record new payload of {new_len} bytes"),
            });
        }
        let mut new_data = vec![0u8; new_len as usize];
        r.read_exact(&mut new_data)?;
        Ok(Some(LogRecord {
            tx_id,
            op,
            inode,
            block,
            timestamp,
            checksum: stored_checksum,
            old_data,
            new_data,
        }))
    }
}

/// An in-memory transaction: an ordered buffer of log records.
/// Its three states are mutually exclusive: active (in the manager's
/// map), committed (id retired into the committed set) or aborted
/// (dropped).
#[derive(Debug)]
pub struct Transaction {
    pub id: u64,
    records: Vec<LogRecord>,
    started: Instant,
}

impl Transaction {
    fn new(id: u64) -> Self {
        Transaction { id, records: Vec::new(), started: Instant::now() }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn duration(&self) -> Duration {
        self.started.elapsed()
    }

    fn is_expired(&self, timeout: Duration) -> bool {
        self.started.elapsed() > timeout
    }
}

/// Counters reported by [`TransactionManager::stats`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxStats {
    pub active_transactions: u32,
    pub total_transactions: u64,
    pub buffered_records: u64,
    pub average_active_duration: Duration,
}

/// Issues transaction ids, buffers records, persists them on commit and
/// replays them on mount.
pub struct TransactionManager {
    active: Mutex<HashMap<u64, Transaction>>,
    committed: Mutex<HashSet<u64>>,
    next_id: AtomicU64,
    log_file: Mutex<File>,
    log_path: PathBuf,
    timeout: Mutex<Duration>,
}

impl TransactionManager {
    /// Opens (creating if needed) the log file in append mode. The id
    /// counter resumes past the largest id already present in the log so
    /// ids stay monotonic for the lifetime of the log file.
    pub fn new(log_path: &Path) -> Result<Self, FsError> {
        let file = OpenOptions::new().create(true).append(true).open(log_path)?;
        let mut max_id = 0u64;
        let _ = Self::scan(log_path, |rec| {
            max_id = max_id.max(rec.tx_id);
            Ok(())
        });
        info!("transaction log {:?} opened, next id {}", log_path, max_id + 1);
        Ok(TransactionManager {
            active: Mutex::new(HashMap::new()),
            committed: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(max_id + 1),
            log_file: Mutex::new(file),
            log_path: log_path.to_path_buf(),
            timeout: Mutex::new(DEFAULT_TX_TIMEOUT),
        })
    }

    /// Starts a transaction and returns its id. Expired transactions are
    /// swept first so a stalled caller cannot pin the active set forever.
    pub fn begin(&self) -> u64 {
        self.cleanup_expired();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.active.lock().insert(id, Transaction::new(id));
        debug!("began transaction {}", id);
        id
    }

    /// Buffers a record under an active transaction. The record's checksum
    /// is recomputed here, after the transaction id is stamped.
    pub fn append(&self, tx_id: u64, mut record: LogRecord) -> Result<(), FsError> {
        let mut active = self.active.lock();
        let tx = active
            .get_mut(&tx_id)
            .ok_or(FsError::TransactionNotFound { tx: tx_id })?;
        record.tx_id = tx_id;
        record.update_checksum();
        tx.records.push(record);
        Ok(())
    }

    /// Writes the transaction's records to the log in append order and
    /// flushes them to stable storage.
    ///
    /// A second commit of the same id is a no-op. A failure while writing
    /// aborts the transaction and surfaces the cause; the caller reverses
    /// any in-memory effects.
    pub fn commit(&self, tx_id: u64) -> Result<(), FsError> {
        if self.committed.lock().contains(&tx_id) {
            debug!("transaction {} already committed", tx_id);
            return Ok(());
        }
        let tx = self
            .active
            .lock()
            .remove(&tx_id)
            .ok_or(FsError::TransactionNotFound { tx: tx_id })?;

        let write_result = (|| -> Result<(), FsError> {
            let mut file = self.log_file.lock();
            for record in &tx.records {
                file.write_all(&record.to_bytes())?;
            }
            file.flush()?;
            file.sync_all()?;
            Ok(())
        })();

        match write_result {
            Ok(()) => {
                self.committed.lock().insert(tx_id);
                debug!("committed transaction {} with {} records", tx_id, tx.records.len());
                Ok(())
            }
            Err(e) => {
                warn!("commit of transaction {} failed: {}", tx_id, e);
                Err(FsError::TransactionAborted { tx: tx_id, reason: e.to_string() })
            }
        }
    }

    /// Discards a transaction's buffered records.
    pub fn rollback(&self, tx_id: u64) -> Result<(), FsError> {
        let tx = self
            .active
            .lock()
            .remove(&tx_id)
            .ok_or(FsError::TransactionNotFound { tx: tx_id })?;
        debug!("rolled back transaction {} with {} records", tx_id, tx.records.len());
        Ok(())
    }

    /// True when the id belongs to a live transaction.
    pub fn is_active(&self, tx_id: u64) -> bool {
        self.active.lock().contains_key(&tx_id)
    }

    /// Aborts every transaction older than the timeout.
    pub fn cleanup_expired(&self) {
        let timeout = *self.timeout.lock();
        let mut active = self.active.lock();
        active.retain(|id, tx| {
            if tx.is_expired(timeout) {
                warn!("transaction {} expired after {:?}, aborting", id, tx.duration());
                false
            } else {
                true
            }
        });
    }

    /// Flushes the log file.
    pub fn checkpoint(&self) -> Result<(), FsError> {
        let mut file = self.log_file.lock();
        file.flush()?;
        file.sync_all()?;
        debug!("transaction log checkpoint complete");
        Ok(())
    }

    /// Replays the log from the beginning, handing each valid record to
    /// `apply` in recorded order. Returns the number of records replayed.
    /// Replay stops silently at a torn tail or the first bad checksum.
    pub fn recover(&self, mut apply: impl FnMut(&LogRecord) -> Result<(), FsError>) -> Result<u64, FsError> {
        info!("replaying transaction log {:?}", self.log_path);
        let replayed = Self::scan(&self.log_path, |rec| apply(rec))?;
        info!("replayed {} log records", replayed);
        Ok(replayed)
    }

    /// Sets the transaction timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
    }

    /// Current transaction timeout.
    pub fn timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    /// Count of live transactions.
    pub fn active_count(&self) -> u32 {
        self.active.lock().len() as u32
    }

    /// Summary counters over the active set.
    pub fn stats(&self) -> TxStats {
        let active = self.active.lock();
        let buffered: u64 = active.values().map(|t| t.record_count() as u64).sum();
        let average = if active.is_empty() {
            Duration::ZERO
        } else {
            let total: Duration = active.values().map(Transaction::duration).sum();
            total / active.len() as u32
        };
        TxStats {
            active_transactions: active.len() as u32,
            total_transactions: self.next_id.load(Ordering::SeqCst) - 1,
            buffered_records: buffered,
            average_active_duration: average,
        }
    }

    /// Reads records sequentially from `path`, stopping at EOF or the
    /// first record that fails to parse or checksum.
    fn scan(path: &Path, mut f: impl FnMut(&LogRecord) -> Result<(), FsError>) -> Result<u64, FsError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut count = 0u64;
        loop {
            match LogRecord::read_from(&mut reader) {
                Ok(Some(record)) => {
                    if !record.is_valid() {
                        warn!("log record with bad checksum, stopping replay");
                        break;
                    }
                    f(&record)?;
                    count += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("torn log tail: {}", e);
                    break;
                }
            }
        }
        Ok(count)
    }
}

/// Scoped transaction that rolls back on drop unless committed.
///
/// Every facade mutation runs inside one of these so an early return or a
/// panic can never leave a half-buffered transaction behind.
pub struct TransactionGuard<'a> {
    manager: &'a TransactionManager,
    id: u64,
    committed: bool,
}

impl<'a> TransactionGuard<'a> {
    pub fn new(manager: &'a TransactionManager) -> Self {
        let id = manager.begin();
        TransactionGuard { manager, id, committed: false }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Buffers a record under this transaction.
    pub fn append(&self, record: LogRecord) -> Result<(), FsError> {
        self.manager.append(self.id, record)
    }

    /// Commits the transaction; after this the drop is a no-op.
    pub fn commit(&mut self) -> Result<(), FsError> {
        self.manager.commit(self.id)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.manager.rollback(self.id) {
                debug!("rollback of transaction {} on drop: {}", self.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &tempfile::TempDir) -> TransactionManager {
        TransactionManager::new(&dir.path().join("wal")).unwrap()
    }

    #[test]
    fn test_record_round_trip() {
        let mut record = LogRecord::new(LogOp::WriteBlock, 3, 17)
            .with_new_data(vec![1, 2, 3, 4])
            .with_old_data(vec![9, 9]);
        record.tx_id = 5;
        record.update_checksum();
        assert!(record.is_valid());

        let bytes = record.to_bytes();
        let parsed = LogRecord::read_from(&mut Cursor::new(&bytes)).unwrap().unwrap();
        assert_eq!(parsed, record);
        assert!(parsed.is_valid());
    }

    #[test]
    fn test_tampered_record_fails_checksum() {
        let mut record = LogRecord::new(LogOp::FreeBlock, 0, 8);
        record.update_checksum();
        let mut bytes = record.to_bytes();
        bytes[16] ^= 0x01; // flip a bit inside the block number field
        let parsed = LogRecord::read_from(&mut Cursor::new(&bytes)).unwrap().unwrap();
        assert!(!parsed.is_valid());
    }

    #[test]
    fn test_ids_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let a = mgr.begin();
        let b = mgr.begin();
        assert!(b > a);
    }

    #[test]
    fn test_commit_persists_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let tx = mgr.begin();
        mgr.append(tx, LogRecord::new(LogOp::FreeBlock, 0, 4)).unwrap();
        mgr.append(tx, LogRecord::new(LogOp::FreeBlock, 0, 5)).unwrap();
        mgr.commit(tx).unwrap();
        mgr.commit(tx).unwrap(); // second commit is a no-op

        let mut blocks = Vec::new();
        mgr.recover(|rec| {
            blocks.push(rec.block);
            Ok(())
        })
        .unwrap();
        assert_eq!(blocks, vec![4, 5]);
    }

    #[test]
    fn test_rollback_discards_records() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let tx = mgr.begin();
        mgr.append(tx, LogRecord::new(LogOp::FreeBlock, 0, 4)).unwrap();
        mgr.rollback(tx).unwrap();
        assert!(!mgr.is_active(tx));
        let replayed = mgr.recover(|_| Ok(())).unwrap();
        assert_eq!(replayed, 0);
        assert!(matches!(
            mgr.append(tx, LogRecord::new(LogOp::FreeBlock, 0, 5)),
            Err(FsError::TransactionNotFound { .. })
        ));
    }

    #[test]
    fn test_rollback_after_commit_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let tx = mgr.begin();
        mgr.commit(tx).unwrap();
        assert!(matches!(
            mgr.rollback(tx),
            Err(FsError::TransactionNotFound { .. })
        ));
    }

    #[test]
    fn test_ids_resume_past_logged_history() {
        let dir = tempfile::tempdir().unwrap();
        let last = {
            let mgr = manager(&dir);
            let tx = mgr.begin();
            mgr.append(tx, LogRecord::new(LogOp::FreeBlock, 0, 1)).unwrap();
            mgr.commit(tx).unwrap();
            tx
        };
        let mgr = manager(&dir);
        assert!(mgr.begin() > last);
    }

    #[test]
    fn test_expired_transactions_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        mgr.set_timeout(Duration::ZERO);
        let tx = mgr.begin();
        std::thread::sleep(Duration::from_millis(5));
        mgr.cleanup_expired();
        assert!(!mgr.is_active(tx));
        assert!(matches!(
            mgr.commit(tx),
            Err(FsError::TransactionNotFound { .. })
        ));
    }

    #[test]
    fn test_torn_tail_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal");
        {
            let mgr = TransactionManager::new(&path).unwrap();
            let tx = mgr.begin();
            mgr.append(tx, LogRecord::new(LogOp::FreeBlock, 0, 7)).unwrap();
            mgr.commit(tx).unwrap();
        }
        // Append garbage that looks like the start of a record.
        {
            use std::io::Write;
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xAB; 11]).unwrap();
        }
        let mgr = TransactionManager::new(&path).unwrap();
        let replayed = mgr.recover(|_| Ok(())).unwrap();
        assert_eq!(replayed, 1);
    }

    #[test]
    fn test_guard_rolls_back_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let id = {
            let guard = TransactionGuard::new(&mgr);
            guard.append(LogRecord::new(LogOp::FreeBlock, 0, 3)).unwrap();
            guard.id()
        };
        assert!(!mgr.is_active(id));
        assert_eq!(mgr.recover(|_| Ok(())).unwrap(), 0);
    }

    #[test]
    fn test_guard_commit_sticks() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        {
            let mut guard = TransactionGuard::new(&mgr);
            guard.append(LogRecord::new(LogOp::FreeBlock, 0, 3)).unwrap();
            guard.commit().unwrap();
        }
        assert_eq!(mgr.recover(|_| Ok(())).unwrap(), 1);
    }

    #[test]
    fn test_stats_track_active_set() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let tx = mgr.begin();
        mgr.append(tx, LogRecord::new(LogOp::FreeBlock, 0, 1)).unwrap();
        let stats = mgr.stats();
        assert_eq!(stats.active_transactions, 1);
        assert_eq!(stats.buffered_records, 1);
        assert_eq!(stats.total_transactions, 1);
        mgr.rollback(tx).unwrap();
        assert_eq!(mgr.stats().active_transactions, 0);
    }
}
