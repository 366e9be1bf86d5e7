//! Translation memory store backed by SQLite.
//! Maps (source-content hash, language) to a stored translation, with exact
//! lookup, a candidate-narrowed fuzzy search, and atomic upsert keyed by the
//! (object, field, language) identity tuple. The store is the only piece of
//! cross-request shared mutable state in the core; request-scoped caching
//! lives in [`MemorySession`], never in globals.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::config::FuzzyTuning;
use crate::error::TranslateError;
use crate::similarity;

/// Capacity of the per-session point-lookup cache.
const SESSION_LOOKUP_CAPACITY: usize = 256;

/// First 16 bytes of the blake3 digest of the content. Stored alongside each
/// record to detect staleness and to drive exact-match reuse.
pub fn content_hash(text: &str) -> [u8; 16] {
    let digest = blake3::hash(text.as_bytes());
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&digest.as_bytes()[..16]);
    hash
}

/// Unique identity of one stored translation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectIdentity {
    pub object_id: i64,
    pub object_type: String,
    pub field_name: String,
    pub language_code: String,
}

impl ObjectIdentity {
    fn cache_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.object_id, self.object_type, self.field_name, self.language_code
        )
    }
}

/// A persisted translation record.
#[derive(Debug, Clone)]
pub struct TranslationRecord {
    pub id: i64,
    pub identity: ObjectIdentity,
    pub original_content: String,
    pub translated_content: String,
    pub original_hash: [u8; 16],
    pub is_auto_translated: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TranslationRecord {
    /// True when the stored hash no longer matches `current_content`, i.e.
    /// the source changed after this translation was written.
    pub fn is_stale(&self, current_content: &str) -> bool {
        self.original_hash != content_hash(current_content)
    }
}

/// One scored fuzzy-search result. Ephemeral; never persisted.
#[derive(Debug, Clone)]
pub struct FuzzyMatch {
    pub translation_id: i64,
    pub original: String,
    pub translated: String,
    pub similarity: u8,
    pub object_type: String,
    pub field_name: String,
}

/// Where a [`MemoryHit`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSource {
    Exact,
    Fuzzy,
}

/// Best available memory match for a query text.
#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub translated: String,
    pub similarity: u8,
    pub source: HitSource,
}

/// Aggregate stats for one target language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_entries: u64,
    pub unique_originals: u64,
    pub total_chars: u64,
}

/// SQLite-backed translation memory.
pub struct MemoryStore {
    conn: Mutex<Connection>,
    tuning: FuzzyTuning,
}

impl MemoryStore {
    /// Open (or create) the memory database at the given path.
    pub fn open(db_path: &Path, tuning: FuzzyTuning) -> Result<Self, TranslateError> {
        let conn = Connection::open(db_path)
            .map_err(|e| TranslateError::Persistence(format!("open failed: {e}")))?;
        let store = Self::with_connection(conn, tuning)?;
        info!(path = %db_path.display(), "translation memory opened");
        Ok(store)
    }

    /// In-memory store, used by tests and ephemeral callers.
    pub fn open_in_memory(tuning: FuzzyTuning) -> Result<Self, TranslateError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TranslateError::Persistence(format!("open failed: {e}")))?;
        Self::with_connection(conn, tuning)
    }

    fn with_connection(conn: Connection, tuning: FuzzyTuning) -> Result<Self, TranslateError> {
        // WAL mode for concurrent readers while one writer upserts.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS translation_memory (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                object_id INTEGER NOT NULL,
                object_type TEXT NOT NULL,
                field_name TEXT NOT NULL,
                language_code TEXT NOT NULL,
                original_content TEXT NOT NULL,
                translated_content TEXT NOT NULL,
                original_hash BLOB NOT NULL,
                is_auto_translated INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(object_id, object_type, field_name, language_code)
            );
            CREATE INDEX IF NOT EXISTS idx_memory_hash
                ON translation_memory(original_hash, language_code);
            CREATE INDEX IF NOT EXISTS idx_memory_lang_len
                ON translation_memory(language_code, length(original_content));",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            tuning,
        })
    }

    /// Insert-or-update by identity tuple. Atomic; two concurrent requests
    /// translating the same field cannot lose each other's write. Idempotent
    /// beyond `updated_at`.
    pub fn put(
        &self,
        identity: &ObjectIdentity,
        original: &str,
        translated: &str,
        is_auto: bool,
    ) -> Result<(), TranslateError> {
        let conn = self.conn.lock();
        let hash = content_hash(original);
        let now = now_unix();
        conn.prepare_cached(
            "INSERT INTO translation_memory
             (object_id, object_type, field_name, language_code,
              original_content, translated_content, original_hash,
              is_auto_translated, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(object_id, object_type, field_name, language_code)
             DO UPDATE SET
                original_content = excluded.original_content,
                translated_content = excluded.translated_content,
                original_hash = excluded.original_hash,
                is_auto_translated = excluded.is_auto_translated,
                updated_at = max(updated_at, excluded.updated_at)",
        )?
        .execute(params![
            identity.object_id,
            identity.object_type,
            identity.field_name,
            identity.language_code,
            original,
            translated,
            hash.as_slice(),
            is_auto as i32,
            now,
        ])?;
        Ok(())
    }

    /// Point lookup by identity tuple.
    pub fn get(&self, identity: &ObjectIdentity) -> Result<Option<TranslationRecord>, TranslateError> {
        let conn = self.conn.lock();
        let record = conn
            .prepare_cached(
                "SELECT id, object_id, object_type, field_name, language_code,
                        original_content, translated_content, original_hash,
                        is_auto_translated, created_at, updated_at
                 FROM translation_memory
                 WHERE object_id = ?1 AND object_type = ?2
                   AND field_name = ?3 AND language_code = ?4",
            )?
            .query_row(
                params![
                    identity.object_id,
                    identity.object_type,
                    identity.field_name,
                    identity.language_code,
                ],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Batched point lookup: resolve a list of identities in one store round
    /// trip (a single connection lock, one cached statement reused per key).
    /// Identities with no record are simply absent from the result.
    pub fn get_many(
        &self,
        identities: &[ObjectIdentity],
    ) -> Result<HashMap<ObjectIdentity, TranslationRecord>, TranslateError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, object_id, object_type, field_name, language_code,
                    original_content, translated_content, original_hash,
                    is_auto_translated, created_at, updated_at
             FROM translation_memory
             WHERE object_id = ?1 AND object_type = ?2
               AND field_name = ?3 AND language_code = ?4",
        )?;
        let mut found = HashMap::with_capacity(identities.len());
        for identity in identities {
            let record = stmt
                .query_row(
                    params![
                        identity.object_id,
                        identity.object_type,
                        identity.field_name,
                        identity.language_code,
                    ],
                    row_to_record,
                )
                .optional()?;
            if let Some(record) = record {
                found.insert(identity.clone(), record);
            }
        }
        Ok(found)
    }

    /// Hash lookup across all objects and fields: memory reuse when distinct
    /// fields carry identical content. Newest record wins.
    pub fn find_exact(
        &self,
        text: &str,
        language: &str,
    ) -> Result<Option<TranslationRecord>, TranslateError> {
        let conn = self.conn.lock();
        let hash = content_hash(text);
        let record = conn
            .prepare_cached(
                "SELECT id, object_id, object_type, field_name, language_code,
                        original_content, translated_content, original_hash,
                        is_auto_translated, created_at, updated_at
                 FROM translation_memory
                 WHERE original_hash = ?1 AND language_code = ?2
                 ORDER BY updated_at DESC
                 LIMIT 1",
            )?
            .query_row(params![hash.as_slice(), language], row_to_record)
            .optional()?;
        Ok(record)
    }

    /// Approximate retrieval: narrow to a small candidate set by length window
    /// (and a keyword LIKE pre-filter when the query has a significant leading
    /// word), then score each candidate with the similarity engine. Results
    /// are sorted by descending score and truncated to `limit`. Not exhaustive
    /// over all stored records — the narrowing is a cost heuristic.
    pub fn find_fuzzy(
        &self,
        text: &str,
        language: &str,
        min_similarity: u8,
        limit: usize,
    ) -> Result<Vec<FuzzyMatch>, TranslateError> {
        let normalized = similarity::normalize(text);
        if normalized.chars().count() < self.tuning.min_text_len
            || normalized.chars().count() > self.tuning.max_text_len
        {
            return Ok(Vec::new());
        }

        let query_len = text.len() as f64;
        let min_len = (query_len * (1.0 - self.tuning.length_window)).floor() as i64;
        let max_len = (query_len * (1.0 + self.tuning.length_window)).ceil() as i64;
        let keyword = significant_keyword(&normalized, &self.tuning).map(|w| format!("%{w}%"));

        let candidates: Vec<(i64, String, String, String, String)> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(
                "SELECT id, original_content, translated_content, object_type, field_name
                 FROM translation_memory
                 WHERE language_code = ?1
                   AND length(original_content) BETWEEN ?2 AND ?3
                   AND (?4 IS NULL OR original_content LIKE ?4)
                 ORDER BY abs(length(original_content) - ?5)
                 LIMIT ?6",
            )?;
            let rows = stmt.query_map(
                params![
                    language,
                    min_len,
                    max_len,
                    keyword,
                    text.len() as i64,
                    self.tuning.candidate_cap as i64,
                ],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )?;
            rows.collect::<Result<_, _>>()?
        };

        debug!(
            candidates = candidates.len(),
            min_similarity, "fuzzy candidate scan"
        );

        let mut matches: Vec<FuzzyMatch> = candidates
            .into_iter()
            .filter_map(|(id, original, translated, object_type, field_name)| {
                let score = similarity::similarity(text, &original);
                (score >= min_similarity).then_some(FuzzyMatch {
                    translation_id: id,
                    original,
                    translated,
                    similarity: score,
                    object_type,
                    field_name,
                })
            })
            .collect();

        matches.sort_by(|a, b| b.similarity.cmp(&a.similarity));
        matches.truncate(limit);
        Ok(matches)
    }

    /// Exact match first (similarity 100); fuzzy fallback unless the caller
    /// asked for exact-only (`min_similarity >= 100`).
    pub fn get_best(
        &self,
        text: &str,
        language: &str,
        min_similarity: u8,
    ) -> Result<Option<MemoryHit>, TranslateError> {
        if let Some(record) = self.find_exact(text, language)? {
            return Ok(Some(MemoryHit {
                translated: record.translated_content,
                similarity: 100,
                source: HitSource::Exact,
            }));
        }
        if min_similarity >= 100 {
            return Ok(None);
        }
        let best = self
            .find_fuzzy(text, language, min_similarity, 1)?
            .into_iter()
            .next()
            .map(|m| MemoryHit {
                translated: m.translated,
                similarity: m.similarity,
                source: HitSource::Fuzzy,
            });
        Ok(best)
    }

    /// Bulk teardown when the source object is deleted. Returns rows removed.
    pub fn delete_for_object(
        &self,
        object_id: i64,
        object_type: &str,
    ) -> Result<usize, TranslateError> {
        let conn = self.conn.lock();
        let count = conn.execute(
            "DELETE FROM translation_memory WHERE object_id = ?1 AND object_type = ?2",
            params![object_id, object_type],
        )?;
        if count > 0 {
            info!(object_id, object_type, removed = count, "object translations deleted");
        }
        Ok(count)
    }

    /// Full data reset. Returns rows removed.
    pub fn purge_all(&self) -> Result<usize, TranslateError> {
        let conn = self.conn.lock();
        let count = conn.execute("DELETE FROM translation_memory", [])?;
        info!(removed = count, "translation memory purged");
        Ok(count)
    }

    /// Aggregate stats for one language.
    pub fn stats(&self, language: &str) -> Result<MemoryStats, TranslateError> {
        let conn = self.conn.lock();
        let stats = conn.prepare_cached(
            "SELECT COUNT(*), COUNT(DISTINCT original_hash),
                    COALESCE(SUM(length(original_content)), 0)
             FROM translation_memory WHERE language_code = ?1",
        )?
        .query_row(params![language], |row| {
            Ok(MemoryStats {
                total_entries: row.get::<_, i64>(0)? as u64,
                unique_originals: row.get::<_, i64>(1)? as u64,
                total_chars: row.get::<_, i64>(2)? as u64,
            })
        })?;
        Ok(stats)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TranslationRecord> {
    let hash_blob: Vec<u8> = row.get(7)?;
    let mut original_hash = [0u8; 16];
    if hash_blob.len() == 16 {
        original_hash.copy_from_slice(&hash_blob);
    }
    Ok(TranslationRecord {
        id: row.get(0)?,
        identity: ObjectIdentity {
            object_id: row.get(1)?,
            object_type: row.get(2)?,
            field_name: row.get(3)?,
            language_code: row.get(4)?,
        },
        original_content: row.get(5)?,
        translated_content: row.get(6)?,
        original_hash,
        is_auto_translated: row.get::<_, i32>(8)? != 0,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// First word of at least `significant_word_len` chars among the leading
/// tokens, usable as a LIKE pre-filter. Words carrying LIKE wildcards are
/// skipped rather than escaped.
fn significant_keyword(normalized: &str, tuning: &FuzzyTuning) -> Option<String> {
    normalized
        .split_whitespace()
        .take(tuning.keyword_scan_tokens)
        .find(|w| {
            w.chars().count() >= tuning.significant_word_len
                && !w.contains(['%', '_', '\\'])
        })
        .map(str::to_string)
}

/// Request-scoped view over the store. Carries the point-lookup cache and the
/// fuzzy/best-match memoization for one unit of work; drop it when the unit
/// of work ends. Never share one session across concurrent requests.
pub struct MemorySession<'a> {
    store: &'a MemoryStore,
    lookups: Mutex<LruCache<String, Option<TranslationRecord>>>,
    best_memo: Mutex<HashMap<(String, String, u8), Option<MemoryHit>>>,
}

impl<'a> MemorySession<'a> {
    pub fn new(store: &'a MemoryStore) -> Self {
        Self {
            store,
            lookups: Mutex::new(LruCache::new(
                NonZeroUsize::new(SESSION_LOOKUP_CAPACITY).expect("capacity must be > 0"),
            )),
            best_memo: Mutex::new(HashMap::new()),
        }
    }

    /// Cached point lookup. Repeated reads of the same field during one
    /// render pass hit the session cache, not SQLite.
    pub fn get(&self, identity: &ObjectIdentity) -> Result<Option<TranslationRecord>, TranslateError> {
        let key = identity.cache_key();
        if let Some(cached) = self.lookups.lock().get(&key) {
            return Ok(cached.clone());
        }
        let record = self.store.get(identity)?;
        self.lookups.lock().put(key, record.clone());
        Ok(record)
    }

    /// Upsert through to the store, invalidating the session cache for the
    /// affected identity.
    pub fn put(
        &self,
        identity: &ObjectIdentity,
        original: &str,
        translated: &str,
        is_auto: bool,
    ) -> Result<(), TranslateError> {
        self.store.put(identity, original, translated, is_auto)?;
        self.lookups.lock().pop(&identity.cache_key());
        self.best_memo.lock().clear();
        Ok(())
    }

    /// Memoized `get_best`: identical (text, language, threshold) queries
    /// within this unit of work are answered once.
    pub fn get_best(
        &self,
        text: &str,
        language: &str,
        min_similarity: u8,
    ) -> Result<Option<MemoryHit>, TranslateError> {
        let key = (
            similarity::normalize(text),
            language.to_string(),
            min_similarity,
        );
        if let Some(hit) = self.best_memo.lock().get(&key) {
            return Ok(hit.clone());
        }
        let hit = self.store.get_best(text, language, min_similarity)?;
        self.best_memo.lock().insert(key, hit.clone());
        Ok(hit)
    }

    pub fn store(&self) -> &MemoryStore {
        self.store
    }
}

/// Current time as Unix timestamp (seconds).
fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
