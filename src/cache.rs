//! The derived local SQL cache.
//!
//! Source of truth for a note or folder is always the CRDT files under an
//! SD; this cache exists so `listNotes`/`searchNotes` don't have to
//! recompose every document on every call. It is rebuilt wholesale from
//! the CRDT layer when `schema_version` changes — `pinned` and tag names
//! are the only fields not re-derivable that way, so those live in
//! `app_state`/`tags` and are migrated, never dropped, across a rebuild.
//!
//! Connection handling keeps things simple: one [`rusqlite::Connection`],
//! schema applied with `execute_batch` against a bundled `.sql` file, and
//! migrations run as plain `ALTER TABLE`/`CREATE TABLE IF NOT EXISTS`
//! statements.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{CoreError, Result};
use crate::ids::{FolderId, NoteId, SdId, SdUuid};
use crate::moves::{MoveRecord, MoveState, TargetConflict};

/// Current schema version. Bumping this forces [`Cache::open`] to rebuild
/// the derived tables (`notes`, `notes_fts`, `folders`) from the CRDT
/// layer on next wake-discovery pass; `tags`, `note_tags`, and `app_state`
/// are migrated in place instead.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = include_str!("cache_schema.sql");

/// One row of the derived `notes` table.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteRow {
    /// Note id (matches the CRDT document's [`NoteId`]).
    pub id: NoteId,
    /// Storage dir this note belongs to.
    pub sd_id: SdId,
    /// Containing folder, or `None` for the SD root.
    pub folder_id: Option<FolderId>,
    /// First non-whitespace line of the document.
    pub title: String,
    /// First 200 characters of body after the title.
    pub preview: String,
    /// Soft-delete flag mirrored from the CRDT `deleted` field.
    pub deleted: bool,
    /// Cache-only property; not part of the CRDT document.
    pub pinned: bool,
    /// Hint timestamp of the note's last known update. A hint, not a
    /// truth: writer timestamps carry no cross-instance ordering
    /// guarantee.
    pub updated_at_ms: i64,
}

/// One row of the derived `folders` table.
#[derive(Debug, Clone, PartialEq)]
pub struct FolderRow {
    /// Folder id.
    pub id: FolderId,
    /// Storage dir this folder belongs to.
    pub sd_id: SdId,
    /// Parent folder, or `None` for a root-level folder.
    pub parent_id: Option<FolderId>,
    /// Display name.
    pub name: String,
}

/// Filter applied by [`Cache::list_notes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NoteFilter {
    /// Notes that are not soft-deleted.
    #[default]
    Active,
    /// Only soft-deleted notes (the "Recently Deleted" virtual folder).
    Deleted,
    /// Every row regardless of `deleted`.
    All,
}

/// Result of cleaning orphaned rows at startup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OrphanCleanupStats {
    /// Notes deleted for pointing at a non-existent storage dir.
    pub orphaned_notes: usize,
    /// Folders deleted for pointing at a non-existent storage dir.
    pub orphaned_folders: usize,
    /// `note_tags` rows deleted for pointing at a non-existent note.
    pub orphaned_note_tags: usize,
    /// Tags deleted once they have no remaining associations.
    pub orphaned_tags: usize,
}

/// The local SQL cache: one SQLite database per profile.
pub struct Cache {
    conn: Connection,
}

impl Cache {
    /// Open (creating if necessary) the cache database at `path`, applying
    /// the schema and any pending migrations.
    ///
    /// Failure to open or migrate is the one fatal condition here: callers
    /// should treat an `Err` here as unrecoverable rather than retrying
    /// automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CoreError::CacheMigrationFailed(format!("opening cache db: {e}")))?;
        Self::from_connection(conn)
    }

    /// Open an in-memory cache, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::CacheMigrationFailed(format!("opening cache db: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| CoreError::CacheMigrationFailed(format!("applying schema: {e}")))?;
        let cache = Self { conn };
        cache.migrate()?;
        Ok(cache)
    }

    fn migrate(&self) -> Result<()> {
        let current: i64 = self
            .conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))
            .map_err(|e| CoreError::CacheMigrationFailed(format!("reading schema_version: {e}")))?;

        if current < SCHEMA_VERSION {
            // User-data tables (tags, note_tags, app_state) survive a
            // rebuild; the derived tables are cleared so the next
            // wake-discovery pass repopulates them from the CRDT layer.
            self.conn
                .execute_batch("DELETE FROM notes; DELETE FROM folders; DELETE FROM notes_fts;")
                .map_err(|e| CoreError::CacheMigrationFailed(format!("rebuilding derived tables: {e}")))?;
            self.conn
                .execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )
                .map_err(|e| CoreError::CacheMigrationFailed(format!("writing schema_version: {e}")))?;
        }
        Ok(())
    }

    /// Direct access to the underlying connection, for callers (e.g. move
    /// execution) that need to wrap several statements in one transaction.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ---- storage_dirs --------------------------------------------------

    /// Register a storage dir (or fetch its existing id if already known)
    /// and return its local [`SdId`].
    pub fn upsert_storage_dir(&self, sd_uuid: SdUuid, root_path: &str) -> Result<SdId> {
        self.conn
            .execute(
                "INSERT INTO storage_dirs (sd_uuid, root_path) VALUES (?1, ?2)
                 ON CONFLICT(sd_uuid) DO UPDATE SET root_path = excluded.root_path",
                params![sd_uuid.to_string(), root_path],
            )
            .map_err(CoreError::Rusqlite)?;
        let id: i64 = self
            .conn
            .query_row(
                "SELECT id FROM storage_dirs WHERE sd_uuid = ?1",
                params![sd_uuid.to_string()],
                |r| r.get(0),
            )
            .map_err(CoreError::Rusqlite)?;
        Ok(SdId(id))
    }

    /// Look up the local [`SdId`] for a known [`SdUuid`].
    pub fn sd_id_for_uuid(&self, sd_uuid: SdUuid) -> Result<Option<SdId>> {
        self.conn
            .query_row(
                "SELECT id FROM storage_dirs WHERE sd_uuid = ?1",
                params![sd_uuid.to_string()],
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map(|opt| opt.map(SdId))
            .map_err(CoreError::Rusqlite)
    }

    /// Every storage dir this profile knows about, as `(SdId, SdUuid,
    /// root_path)`.
    pub fn list_storage_dirs(&self) -> Result<Vec<(SdId, SdUuid, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, sd_uuid, root_path FROM storage_dirs")
            .map_err(CoreError::Rusqlite)?;
        let rows = stmt
            .query_map([], |r| {
                let id: i64 = r.get(0)?;
                let uuid_str: String = r.get(1)?;
                let path: String = r.get(2)?;
                Ok((id, uuid_str, path))
            })
            .map_err(CoreError::Rusqlite)?;
        let mut out = Vec::new();
        for row in rows {
            let (id, uuid_str, path) = row.map_err(CoreError::Rusqlite)?;
            let Ok(uuid) = uuid_str.parse::<SdUuid>() else {
                continue;
            };
            out.push((SdId(id), uuid, path));
        }
        Ok(out)
    }

    // ---- notes ----------------------------------------------------------

    /// Insert or fully replace a note row, keeping the FTS index in sync.
    /// Scoped by `(sd_id, id)`: the same note id can hold a separate active
    /// row in another SD, most notably during a cross-SD move conflict.
    pub fn upsert_note(&self, note: &NoteRow, body: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO notes (id, sd_id, folder_id, title, preview, deleted, pinned, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(sd_id, id) DO UPDATE SET
                    folder_id = excluded.folder_id,
                    title = excluded.title,
                    preview = excluded.preview,
                    deleted = excluded.deleted,
                    updated_at_ms = excluded.updated_at_ms",
                params![
                    note.id.to_string(),
                    note.sd_id.0,
                    note.folder_id.map(|f| f.to_string()),
                    note.title,
                    note.preview,
                    note.deleted,
                    note.pinned,
                    note.updated_at_ms,
                ],
            )
            .map_err(CoreError::Rusqlite)?;

        self.conn
            .execute(
                "DELETE FROM notes_fts WHERE note_id = ?1",
                params![note.id.to_string()],
            )
            .map_err(CoreError::Rusqlite)?;
        self.conn
            .execute(
                "INSERT INTO notes_fts (note_id, title, body) VALUES (?1, ?2, ?3)",
                params![note.id.to_string(), note.title, body],
            )
            .map_err(CoreError::Rusqlite)?;
        Ok(())
    }

    /// Fetch one note row by id within `sd_id`, if known.
    pub fn get_note(&self, sd_id: SdId, note: NoteId) -> Result<Option<NoteRow>> {
        self.conn
            .query_row(
                "SELECT id, sd_id, folder_id, title, preview, deleted, pinned, updated_at_ms
                 FROM notes WHERE sd_id = ?1 AND id = ?2",
                params![sd_id.0, note.to_string()],
                Self::row_to_note,
            )
            .optional()
            .map_err(CoreError::Rusqlite)
    }

    /// Move a note between folders (or to the SD root) without touching its
    /// CRDT-derived fields.
    pub fn set_note_folder(&self, sd_id: SdId, note: NoteId, folder_id: Option<FolderId>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE notes SET folder_id = ?3 WHERE sd_id = ?1 AND id = ?2",
                params![sd_id.0, note.to_string(), folder_id.map(|f| f.to_string())],
            )
            .map_err(CoreError::Rusqlite)?;
        Ok(())
    }

    /// Set the cache-only `pinned` flag.
    pub fn set_pinned(&self, sd_id: SdId, note: NoteId, pinned: bool) -> Result<()> {
        self.conn
            .execute(
                "UPDATE notes SET pinned = ?3 WHERE sd_id = ?1 AND id = ?2",
                params![sd_id.0, note.to_string(), pinned],
            )
            .map_err(CoreError::Rusqlite)?;
        Ok(())
    }

    /// Mark a note soft-deleted in the cache (the CRDT merge that actually
    /// sets `deleted=true` happens separately; this just keeps the cache
    /// consistent with it).
    pub fn soft_delete_note(&self, sd_id: SdId, note: NoteId) -> Result<()> {
        self.conn
            .execute(
                "UPDATE notes SET deleted = 1 WHERE sd_id = ?1 AND id = ?2",
                params![sd_id.0, note.to_string()],
            )
            .map_err(CoreError::Rusqlite)?;
        Ok(())
    }

    /// Remove a note's row entirely (hard-delete, driven by DeletionSync).
    /// Idempotent. Scoped to `sd_id`: the same note id may still hold an
    /// active row in another SD (mid cross-SD move), in which case the
    /// FTS/tag rows it shares by id must survive.
    pub fn remove_note(&self, sd_id: SdId, note: NoteId) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM notes WHERE sd_id = ?1 AND id = ?2",
                params![sd_id.0, note.to_string()],
            )
            .map_err(CoreError::Rusqlite)?;

        let still_present: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM notes WHERE id = ?1)",
                params![note.to_string()],
                |r| r.get(0),
            )
            .map_err(CoreError::Rusqlite)?;
        if !still_present {
            self.conn
                .execute(
                    "DELETE FROM notes_fts WHERE note_id = ?1",
                    params![note.to_string()],
                )
                .map_err(CoreError::Rusqlite)?;
            self.conn
                .execute(
                    "DELETE FROM note_tags WHERE note_id = ?1",
                    params![note.to_string()],
                )
                .map_err(CoreError::Rusqlite)?;
        }
        Ok(())
    }

    /// Every note id this cache currently has a row for, used by wake
    /// discovery to diff against disk.
    pub fn known_note_ids(&self, sd_id: SdId) -> Result<std::collections::HashSet<NoteId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM notes WHERE sd_id = ?1")
            .map_err(CoreError::Rusqlite)?;
        let rows = stmt
            .query_map(params![sd_id.0], |r| r.get::<_, String>(0))
            .map_err(CoreError::Rusqlite)?;
        let mut out = std::collections::HashSet::new();
        for row in rows {
            if let Ok(id) = row.map_err(CoreError::Rusqlite)?.parse::<NoteId>() {
                out.insert(id);
            }
        }
        Ok(out)
    }

    /// `listNotes(sdId, folderId, filter)`.
    pub fn list_notes(
        &self,
        sd_id: SdId,
        folder_id: Option<FolderId>,
        filter: NoteFilter,
    ) -> Result<Vec<NoteRow>> {
        let deleted_clause = match filter {
            NoteFilter::Active => "AND deleted = 0",
            NoteFilter::Deleted => "AND deleted = 1",
            NoteFilter::All => "",
        };
        let sql = format!(
            "SELECT id, sd_id, folder_id, title, preview, deleted, pinned, updated_at_ms
             FROM notes WHERE sd_id = ?1 AND folder_id IS ?2 {deleted_clause}
             ORDER BY pinned DESC, updated_at_ms DESC"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(CoreError::Rusqlite)?;
        let rows = stmt
            .query_map(
                params![sd_id.0, folder_id.map(|f| f.to_string())],
                Self::row_to_note,
            )
            .map_err(CoreError::Rusqlite)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(CoreError::Rusqlite)
    }

    /// `searchNotes(query)` over the FTS5 index.
    pub fn search_notes(&self, query: &str) -> Result<Vec<NoteRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT n.id, n.sd_id, n.folder_id, n.title, n.preview, n.deleted, n.pinned, n.updated_at_ms
                 FROM notes_fts f
                 JOIN notes n ON n.id = f.note_id
                 WHERE notes_fts MATCH ?1 AND n.deleted = 0
                 ORDER BY rank",
            )
            .map_err(CoreError::Rusqlite)?;
        let rows = stmt.query_map(params![query], Self::row_to_note).map_err(CoreError::Rusqlite)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(CoreError::Rusqlite)
    }

    fn row_to_note(r: &rusqlite::Row) -> rusqlite::Result<NoteRow> {
        let id: String = r.get(0)?;
        let sd_id: i64 = r.get(1)?;
        let folder_id: Option<String> = r.get(2)?;
        Ok(NoteRow {
            id: id.parse().unwrap_or_default(),
            sd_id: SdId(sd_id),
            folder_id: folder_id.and_then(|s| s.parse().ok()),
            title: r.get(3)?,
            preview: r.get(4)?,
            deleted: r.get(5)?,
            pinned: r.get(6)?,
            updated_at_ms: r.get(7)?,
        })
    }

    // ---- folders ----------------------------------------------------------

    /// Insert or replace a folder row.
    pub fn upsert_folder(&self, folder: &FolderRow) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO folders (id, sd_id, parent_id, name) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    sd_id = excluded.sd_id, parent_id = excluded.parent_id, name = excluded.name",
                params![
                    folder.id.to_string(),
                    folder.sd_id.0,
                    folder.parent_id.map(|f| f.to_string()),
                    folder.name,
                ],
            )
            .map_err(CoreError::Rusqlite)?;
        Ok(())
    }

    /// Folders for one SD.
    pub fn list_folders(&self, sd_id: SdId) -> Result<Vec<FolderRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, sd_id, parent_id, name FROM folders WHERE sd_id = ?1")
            .map_err(CoreError::Rusqlite)?;
        let rows = stmt
            .query_map(params![sd_id.0], |r| {
                let id: String = r.get(0)?;
                let sd_id: i64 = r.get(1)?;
                let parent_id: Option<String> = r.get(2)?;
                Ok(FolderRow {
                    id: id.parse().unwrap_or_default(),
                    sd_id: SdId(sd_id),
                    parent_id: parent_id.and_then(|s| s.parse().ok()),
                    name: r.get(3)?,
                })
            })
            .map_err(CoreError::Rusqlite)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(CoreError::Rusqlite)
    }

    // ---- tags ------------------------------------------------------------

    /// Replace the set of tags associated with `note`.
    /// Tag rows with no remaining association are left for
    /// `cleanup_orphaned_data` to sweep, not deleted eagerly here, so a
    /// tag a user is mid-typing doesn't flicker out of an autocomplete
    /// list.
    pub fn set_tags_for_note(&self, note: NoteId, tags: &[String]) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM note_tags WHERE note_id = ?1",
                params![note.to_string()],
            )
            .map_err(CoreError::Rusqlite)?;
        for tag in tags {
            self.conn
                .execute(
                    "INSERT INTO tags (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
                    params![tag],
                )
                .map_err(CoreError::Rusqlite)?;
            let tag_id: i64 = self
                .conn
                .query_row("SELECT id FROM tags WHERE name = ?1", params![tag], |r| r.get(0))
                .map_err(CoreError::Rusqlite)?;
            self.conn
                .execute(
                    "INSERT INTO note_tags (note_id, tag_id) VALUES (?1, ?2)
                     ON CONFLICT(note_id, tag_id) DO NOTHING",
                    params![note.to_string(), tag_id],
                )
                .map_err(CoreError::Rusqlite)?;
        }
        Ok(())
    }

    /// Every tag name currently attached to `note`.
    pub fn tags_for_note(&self, note: NoteId) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT t.name FROM tags t
                 JOIN note_tags nt ON nt.tag_id = t.id
                 WHERE nt.note_id = ?1 ORDER BY t.name",
            )
            .map_err(CoreError::Rusqlite)?;
        let rows = stmt
            .query_map(params![note.to_string()], |r| r.get::<_, String>(0))
            .map_err(CoreError::Rusqlite)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(CoreError::Rusqlite)
    }

    // ---- app_state ---------------------------------------------------------

    /// Get one app-level setting.
    pub fn get_app_state(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM app_state WHERE key = ?1", params![key], |r| r.get(0))
            .optional()
            .map_err(CoreError::Rusqlite)
    }

    /// Set one app-level setting.
    pub fn set_app_state(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO app_state (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(CoreError::Rusqlite)?;
        Ok(())
    }

    // ---- orphan cleanup ------------------------------------------------

    /// Remove rows that no longer point anywhere valid. Run at startup.
    pub fn cleanup_orphaned_data(&self) -> Result<OrphanCleanupStats> {
        let mut stats = OrphanCleanupStats::default();

        stats.orphaned_notes = self
            .conn
            .execute(
                "DELETE FROM notes WHERE sd_id NOT IN (SELECT id FROM storage_dirs)",
                [],
            )
            .map_err(CoreError::Rusqlite)?;
        stats.orphaned_folders = self
            .conn
            .execute(
                "DELETE FROM folders WHERE sd_id NOT IN (SELECT id FROM storage_dirs)",
                [],
            )
            .map_err(CoreError::Rusqlite)?;
        stats.orphaned_note_tags = self
            .conn
            .execute(
                "DELETE FROM note_tags WHERE note_id NOT IN (SELECT id FROM notes)",
                [],
            )
            .map_err(CoreError::Rusqlite)?;
        stats.orphaned_tags = self
            .conn
            .execute(
                "DELETE FROM tags WHERE id NOT IN (SELECT tag_id FROM note_tags)",
                [],
            )
            .map_err(CoreError::Rusqlite)?;

        Ok(stats)
    }

    // ---- note_moves --------------------------------------------------------

    /// Persist a new or updated move record.
    pub fn upsert_move(&self, record: &MoveRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO note_moves
                    (id, note_id, source_sd_uuid, target_sd_uuid, target_folder_id, state,
                     initiated_by, initiated_at_ms, last_modified_ms, source_sd_path,
                     target_sd_path, error, keep_both_note_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(id) DO UPDATE SET
                    state = excluded.state,
                    initiated_by = excluded.initiated_by,
                    last_modified_ms = excluded.last_modified_ms,
                    error = excluded.error,
                    keep_both_note_id = excluded.keep_both_note_id",
                params![
                    record.id.to_string(),
                    record.note.to_string(),
                    record.source_sd.to_string(),
                    record.target_sd.to_string(),
                    record.target_folder.to_string(),
                    move_state_str(record.state),
                    record.initiated_by.to_string(),
                    record.initiated_at_ms,
                    record.last_modified_ms,
                    record.source_sd_path.to_string_lossy().to_string(),
                    record.target_sd_path.to_string_lossy().to_string(),
                    record.error,
                    record.keep_both_note_id.map(|id| id.to_string()),
                ],
            )
            .map_err(CoreError::Rusqlite)?;
        Ok(())
    }

    /// Every move record not yet in a terminal state, owned by `initiated_by`.
    /// Pass `None` for `initiated_by` to fetch every in-flight move
    /// regardless of owner (used to find stuck moves with a foreign owner).
    pub fn list_nonterminal_moves(&self, initiated_by: Option<&str>) -> Result<Vec<MoveRecord>> {
        let sql = "SELECT id, note_id, source_sd_uuid, target_sd_uuid, target_folder_id, state,
                          initiated_by, initiated_at_ms, last_modified_ms, source_sd_path,
                          target_sd_path, error, keep_both_note_id
                   FROM note_moves
                   WHERE state NOT IN ('completed', 'cancelled', 'rolled_back')";
        let mut stmt = self.conn.prepare(sql).map_err(CoreError::Rusqlite)?;
        let rows = stmt.query_map([], Self::row_to_move).map_err(CoreError::Rusqlite)?;
        let mut out = Vec::new();
        for row in rows {
            let record = row.map_err(CoreError::Rusqlite)?;
            if initiated_by.is_none_or(|who| record.initiated_by.as_str() == who) {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Fetch one move record by id, if known.
    pub fn get_move(&self, id: crate::ids::MoveId) -> Result<Option<MoveRecord>> {
        self.conn
            .query_row(
                "SELECT id, note_id, source_sd_uuid, target_sd_uuid, target_folder_id, state,
                        initiated_by, initiated_at_ms, last_modified_ms, source_sd_path,
                        target_sd_path, error, keep_both_note_id
                 FROM note_moves WHERE id = ?1",
                params![id.to_string()],
                Self::row_to_move,
            )
            .optional()
            .map_err(CoreError::Rusqlite)
    }

    /// Purge terminal move rows older than `retention_days`.
    pub fn purge_old_moves(&self, now_ms: i64, retention_days: u32) -> Result<usize> {
        let cutoff = now_ms - (retention_days as i64) * 24 * 60 * 60 * 1000;
        self.conn
            .execute(
                "DELETE FROM note_moves
                 WHERE state IN ('completed', 'cancelled', 'rolled_back')
                 AND last_modified_ms < ?1",
                params![cutoff],
            )
            .map_err(CoreError::Rusqlite)
    }

    fn row_to_move(r: &rusqlite::Row) -> rusqlite::Result<MoveRecord> {
        let state_str: String = r.get(5)?;
        Ok(MoveRecord {
            id: r.get::<_, String>(0)?.parse().unwrap_or_default(),
            note: r.get::<_, String>(1)?.parse().unwrap_or_default(),
            source_sd: r.get::<_, String>(2)?.parse().unwrap_or_default(),
            target_sd: r.get::<_, String>(3)?.parse().unwrap_or_default(),
            target_folder: r.get::<_, String>(4)?.parse().unwrap_or_default(),
            state: move_state_from_str(&state_str),
            initiated_by: r.get::<_, String>(6)?.parse().unwrap_or_default(),
            initiated_at_ms: r.get(7)?,
            last_modified_ms: r.get(8)?,
            source_sd_path: r.get::<_, String>(9)?.into(),
            target_sd_path: r.get::<_, String>(10)?.into(),
            error: r.get(11)?,
            keep_both_note_id: r.get::<_, Option<String>>(12)?.and_then(|s| s.parse().ok()),
        })
    }
}

fn move_state_str(state: MoveState) -> &'static str {
    match state {
        MoveState::Initiated => "initiated",
        MoveState::Copying => "copying",
        MoveState::FilesCopied => "files_copied",
        MoveState::DbUpdated => "db_updated",
        MoveState::Cleaning => "cleaning",
        MoveState::Completed => "completed",
        MoveState::Cancelled => "cancelled",
        MoveState::RolledBack => "rolled_back",
    }
}

fn move_state_from_str(s: &str) -> MoveState {
    match s {
        "copying" => MoveState::Copying,
        "files_copied" => MoveState::FilesCopied,
        "db_updated" => MoveState::DbUpdated,
        "cleaning" => MoveState::Cleaning,
        "completed" => MoveState::Completed,
        "cancelled" => MoveState::Cancelled,
        "rolled_back" => MoveState::RolledBack,
        _ => MoveState::Initiated,
    }
}

impl crate::moves::MoveCacheOps for Cache {
    fn detect_conflict(&self, target_sd: SdUuid, note: NoteId) -> Result<TargetConflict> {
        let Some(sd_id) = self.sd_id_for_uuid(target_sd)? else {
            return Ok(TargetConflict::None);
        };
        let row: Option<bool> = self
            .conn
            .query_row(
                "SELECT deleted FROM notes WHERE id = ?1 AND sd_id = ?2",
                params![note.to_string(), sd_id.0],
                |r| r.get(0),
            )
            .optional()
            .map_err(CoreError::Rusqlite)?;
        Ok(match row {
            None => TargetConflict::None,
            Some(false) => TargetConflict::Active,
            Some(true) => TargetConflict::SoftDeletedOnly,
        })
    }

    fn hard_delete_row(&self, sd: SdUuid, note: NoteId) -> Result<()> {
        let Some(sd_id) = self.sd_id_for_uuid(sd)? else {
            return Err(CoreError::StorageUnavailable(std::path::PathBuf::new()));
        };
        self.remove_note(sd_id, note)
    }

    fn insert_moved_row(
        &self,
        source_sd: SdUuid,
        target_sd: SdUuid,
        note: NoteId,
        as_id: NoteId,
        target_folder: FolderId,
    ) -> Result<()> {
        let Some(target_sd_id) = self.sd_id_for_uuid(target_sd)? else {
            return Err(CoreError::StorageUnavailable(std::path::PathBuf::new()));
        };
        let Some(source_sd_id) = self.sd_id_for_uuid(source_sd)? else {
            return Err(CoreError::StorageUnavailable(std::path::PathBuf::new()));
        };
        // The CRDT content itself is copied by `MoveExecutor::copy_to_scratch`;
        // this just seeds a minimal cache row so the note is immediately
        // listable. Title/preview/tags are refreshed on the next
        // `readComposedState`-driven reload. Scoped to the source row
        // specifically: the note id may also name an unrelated row already
        // sitting on the target.
        let source_row = self
            .conn
            .query_row(
                "SELECT title, preview FROM notes WHERE sd_id = ?1 AND id = ?2",
                params![source_sd_id.0, note.to_string()],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(CoreError::Rusqlite)?
            .unwrap_or_default();

        self.upsert_note(
            &NoteRow {
                id: as_id,
                sd_id: target_sd_id,
                folder_id: Some(target_folder),
                title: source_row.0,
                preview: source_row.1,
                deleted: false,
                pinned: false,
                updated_at_ms: 0,
            },
            "",
        )
    }

    fn remove_source_row(&self, source_sd: SdUuid, note: NoteId) -> Result<()> {
        let Some(sd_id) = self.sd_id_for_uuid(source_sd)? else {
            return Err(CoreError::StorageUnavailable(std::path::PathBuf::new()));
        };
        self.remove_note(sd_id, note)
    }

    fn reinsert_source_row(&self, source_sd: SdUuid, note: NoteId) -> Result<()> {
        let Some(sd_id) = self.sd_id_for_uuid(source_sd)? else {
            return Err(CoreError::StorageUnavailable(std::path::PathBuf::new()));
        };
        self.upsert_note(
            &NoteRow {
                id: note,
                sd_id,
                folder_id: None,
                title: String::new(),
                preview: String::new(),
                deleted: false,
                pinned: false,
                updated_at_ms: 0,
            },
            "",
        )
    }
}
