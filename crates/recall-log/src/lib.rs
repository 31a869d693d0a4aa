//! Append-only exchange log, the source of truth for every tenant.
//!
//! One JSONL file per tenant: `{root}/tenant_{id}.jsonl`, one exchange
//! per line in write order. Appends assign the tenant's next sequence
//! number under a per-tenant lock and are flushed and fsynced before
//! the call returns; a write error is propagated, never swallowed.
//!
//! The vector index is a best-effort secondary; anything missing there
//! can be rebuilt by replaying these files.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use recall_models::{Exchange, NewExchange};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

mod error;

pub use error::{Error, Result};

/// Append-only per-tenant log store.
pub struct ExchangeLog {
    root: PathBuf,
    tenants: RwLock<HashMap<i64, Arc<Mutex<TenantState>>>>,
    write_ok: AtomicBool,
}

/// Mutable per-tenant state, guarded by the tenant's write lock.
struct TenantState {
    next_sequence: u64,
    last_created: DateTime<Utc>,
}

impl ExchangeLog {
    /// Open (or create) a log store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::Write(format!("Failed to create log directory: {}", e)))?;

        Ok(Self {
            root,
            tenants: RwLock::new(HashMap::new()),
            write_ok: AtomicBool::new(true),
        })
    }

    fn tenant_path(&self, tenant_id: i64) -> PathBuf {
        self.root.join(format!("tenant_{}.jsonl", tenant_id))
    }

    /// Append an exchange, assigning the tenant's next sequence number.
    ///
    /// Serialized per tenant; different tenants append concurrently.
    /// Returns the fully-assigned exchange once it is durable on disk.
    pub async fn append(&self, tenant_id: i64, new: NewExchange) -> Result<Exchange> {
        let text = new.text.trim();
        if text.is_empty() {
            return Err(Error::InvalidInput(
                "Exchange text must not be empty".to_string(),
            ));
        }

        let state = self.tenant_state(tenant_id).await?;
        let mut guard = state.lock().await;

        // Logical timestamps are monotonic per tenant even if the wall
        // clock steps backwards between serialized appends.
        let created_at = Utc::now().max(guard.last_created);

        let exchange = Exchange {
            tenant_id,
            sequence_id: guard.next_sequence,
            author_kind: new.author_kind,
            author_id: new.author_id,
            author_name: new.author_name,
            text: text.to_string(),
            created_at,
            embedding: None,
        };

        let line = serde_json::to_string(&exchange)?;

        match self.write_line(tenant_id, &line).await {
            Ok(()) => {
                guard.next_sequence += 1;
                guard.last_created = created_at;
                self.write_ok.store(true, Ordering::Relaxed);
                debug!(
                    tenant_id,
                    sequence_id = exchange.sequence_id,
                    "Exchange appended"
                );
                Ok(exchange)
            }
            Err(e) => {
                self.write_ok.store(false, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Read the most recent `limit` exchanges for a tenant, oldest
    /// first (newest-last). Missing tenants yield an empty vec.
    pub async fn read_recent(&self, tenant_id: i64, limit: usize) -> Result<Vec<Exchange>> {
        let path = self.tenant_path(tenant_id);
        let file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let mut recent: VecDeque<Exchange> = VecDeque::with_capacity(limit);

        while let Some(line) = lines.next_line().await? {
            match parse_line(tenant_id, &line) {
                Some(exchange) => {
                    if recent.len() == limit {
                        recent.pop_front();
                    }
                    recent.push_back(exchange);
                }
                None => continue,
            }
        }

        Ok(recent.into_iter().collect())
    }

    /// Lazily replay a tenant's full log in sequence order.
    ///
    /// Off the request-serving path; used by reindexing tooling.
    /// Restartable by constructing a new replay.
    pub async fn replay(&self, tenant_id: i64) -> Result<LogReplay> {
        let path = self.tenant_path(tenant_id);
        let file = match File::open(&path).await {
            Ok(f) => Some(f),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        Ok(LogReplay {
            tenant_id,
            lines: file.map(|f| BufReader::new(f).lines()),
        })
    }

    /// List tenant ids with at least one logged exchange.
    pub async fn tenants(&self) -> Result<Vec<i64>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name
                .strip_prefix("tenant_")
                .and_then(|rest| rest.strip_suffix(".jsonl"))
                .and_then(|id| id.parse().ok())
            {
                ids.push(id);
            }
        }

        ids.sort_unstable();
        Ok(ids)
    }

    /// Whether the last append succeeded. Cheap health signal.
    pub fn is_healthy(&self) -> bool {
        self.write_ok.load(Ordering::Relaxed)
    }

    /// Base directory of this log store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get or recover the per-tenant write state.
    async fn tenant_state(&self, tenant_id: i64) -> Result<Arc<Mutex<TenantState>>> {
        if let Some(state) = self.tenants.read().await.get(&tenant_id) {
            return Ok(state.clone());
        }

        // Scan outside the map lock: recovering one tenant's large
        // file must not stall appends for every other tenant.
        let recovered = self.recover_tenant(tenant_id).await?;
        let state = Arc::new(Mutex::new(recovered));

        // Another writer may have recovered this tenant while we
        // scanned; the first insert wins and both scans agree, since
        // the file cannot grow before a state exists to lock.
        let mut tenants = self.tenants.write().await;
        Ok(tenants.entry(tenant_id).or_insert(state).clone())
    }

    /// Scan a tenant's file to recover the next sequence number and
    /// last timestamp after a restart.
    async fn recover_tenant(&self, tenant_id: i64) -> Result<TenantState> {
        let path = self.tenant_path(tenant_id);
        let file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TenantState {
                    next_sequence: 1,
                    last_created: DateTime::<Utc>::MIN_UTC,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let mut last: Option<Exchange> = None;

        while let Some(line) = lines.next_line().await? {
            if let Some(exchange) = parse_line(tenant_id, &line) {
                last = Some(exchange);
            }
        }

        let state = match last {
            Some(exchange) => TenantState {
                next_sequence: exchange.sequence_id + 1,
                last_created: exchange.created_at,
            },
            None => TenantState {
                next_sequence: 1,
                last_created: DateTime::<Utc>::MIN_UTC,
            },
        };

        debug!(
            tenant_id,
            next_sequence = state.next_sequence,
            "Recovered tenant log state"
        );

        Ok(state)
    }

    async fn write_line(&self, tenant_id: i64, line: &str) -> Result<()> {
        let path = self.tenant_path(tenant_id);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::Write(format!("Failed to open {}: {}", path.display(), e)))?;

        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Write(format!("Failed to append exchange: {}", e)))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| Error::Write(format!("Failed to append exchange: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| Error::Write(format!("Failed to flush log: {}", e)))?;
        // Flush-before-ack: the append is only acknowledged once the
        // data has reached the disk.
        file.sync_data()
            .await
            .map_err(|e| Error::Write(format!("Failed to sync log: {}", e)))?;

        Ok(())
    }
}

/// Lazy sequence reader over one tenant's log file.
pub struct LogReplay {
    tenant_id: i64,
    lines: Option<Lines<BufReader<File>>>,
}

impl LogReplay {
    /// Next exchange in sequence order, or `None` at end of log.
    /// Corrupt lines are skipped with a warning.
    pub async fn next(&mut self) -> Result<Option<Exchange>> {
        let Some(lines) = self.lines.as_mut() else {
            return Ok(None);
        };

        while let Some(line) = lines.next_line().await? {
            if let Some(exchange) = parse_line(self.tenant_id, &line) {
                return Ok(Some(exchange));
            }
        }

        Ok(None)
    }
}

/// Parse one log line; corrupt lines are logged and skipped so a
/// damaged record never takes down a request.
fn parse_line(tenant_id: i64, line: &str) -> Option<Exchange> {
    if line.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(exchange) => Some(exchange),
        Err(e) => {
            warn!(tenant_id, error = %e, "Skipping corrupt log line");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_models::AuthorKind;

    fn new_exchange(text: &str) -> NewExchange {
        NewExchange {
            author_kind: AuthorKind::Human,
            author_id: Some(42),
            author_name: Some("Alice".to_string()),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExchangeLog::open(dir.path()).await.unwrap();

        let first = log.append(7, new_exchange("hello")).await.unwrap();
        assert_eq!(first.sequence_id, 1);

        let second = log.append(7, new_exchange("world")).await.unwrap();
        assert_eq!(second.sequence_id, 2);
        assert!(second.created_at >= first.created_at);
    }

    #[tokio::test]
    async fn test_sequences_are_per_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExchangeLog::open(dir.path()).await.unwrap();

        log.append(1, new_exchange("a")).await.unwrap();
        log.append(1, new_exchange("b")).await.unwrap();
        let other = log.append(2, new_exchange("c")).await.unwrap();

        assert_eq!(other.sequence_id, 1);
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExchangeLog::open(dir.path()).await.unwrap();

        let result = log.append(1, new_exchange("   ")).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_sequence_recovered_after_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let log = ExchangeLog::open(dir.path()).await.unwrap();
            log.append(7, new_exchange("hello")).await.unwrap();
            log.append(7, new_exchange("world")).await.unwrap();
        }

        let log = ExchangeLog::open(dir.path()).await.unwrap();
        let third = log.append(7, new_exchange("again")).await.unwrap();
        assert_eq!(third.sequence_id, 3);
    }

    #[tokio::test]
    async fn test_read_recent_newest_last() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExchangeLog::open(dir.path()).await.unwrap();

        for i in 1..=5 {
            log.append(7, new_exchange(&format!("msg {}", i)))
                .await
                .unwrap();
        }

        let recent = log.read_recent(7, 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].text, "msg 3");
        assert_eq!(recent[2].text, "msg 5");
    }

    #[tokio::test]
    async fn test_read_recent_missing_tenant_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExchangeLog::open(dir.path()).await.unwrap();

        let recent = log.read_recent(999, 10).await.unwrap();
        assert!(recent.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExchangeLog::open(dir.path()).await.unwrap();

        log.append(7, new_exchange("good")).await.unwrap();

        // Damage the file with a half-written line.
        let path = dir.path().join("tenant_7.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"tenant_id\":7,\"seq");
        std::fs::write(&path, content).unwrap();

        let log = ExchangeLog::open(dir.path()).await.unwrap();
        let recent = log.read_recent(7, 10).await.unwrap();
        assert_eq!(recent.len(), 1);

        // Recovery must also skip the corrupt tail.
        let next = log.append(7, new_exchange("after")).await.unwrap();
        assert_eq!(next.sequence_id, 2);
    }

    #[tokio::test]
    async fn test_replay_in_sequence_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExchangeLog::open(dir.path()).await.unwrap();

        for i in 1..=3 {
            log.append(7, new_exchange(&format!("msg {}", i)))
                .await
                .unwrap();
        }

        let mut replay = log.replay(7).await.unwrap();
        let mut seqs = Vec::new();
        while let Some(exchange) = replay.next().await.unwrap() {
            seqs.push(exchange.sequence_id);
        }
        assert_eq!(seqs, vec![1, 2, 3]);

        let mut empty = log.replay(12345).await.unwrap();
        assert!(empty.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_appends_same_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(ExchangeLog::open(dir.path()).await.unwrap());

        let a = {
            let log = log.clone();
            tokio::spawn(async move { log.append(7, new_exchange("first")).await })
        };
        let b = {
            let log = log.clone();
            tokio::spawn(async move { log.append(7, new_exchange("second")).await })
        };

        let mut seqs = vec![
            a.await.unwrap().unwrap().sequence_id,
            b.await.unwrap().unwrap().sequence_id,
        ];
        seqs.sort_unstable();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_concurrent_first_touch_recovery() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = ExchangeLog::open(dir.path()).await.unwrap();
            log.append(7, new_exchange("one")).await.unwrap();
            log.append(7, new_exchange("two")).await.unwrap();
        }

        // Both appends race the recovery scan after a reopen; they
        // must agree on one state and continue the sequence.
        let log = Arc::new(ExchangeLog::open(dir.path()).await.unwrap());
        let a = {
            let log = log.clone();
            tokio::spawn(async move { log.append(7, new_exchange("three")).await })
        };
        let b = {
            let log = log.clone();
            tokio::spawn(async move { log.append(7, new_exchange("four")).await })
        };

        let mut seqs = vec![
            a.await.unwrap().unwrap().sequence_id,
            b.await.unwrap().unwrap().sequence_id,
        ];
        seqs.sort_unstable();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_tenants_listing() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExchangeLog::open(dir.path()).await.unwrap();

        log.append(-100, new_exchange("group chat")).await.unwrap();
        log.append(7, new_exchange("private")).await.unwrap();

        assert_eq!(log.tenants().await.unwrap(), vec![-100, 7]);
    }
}
