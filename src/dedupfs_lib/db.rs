/// Local metadata store: one SQLite database per mounted filesystem.
use crate::dedupfs_lib::errors::{FsError, Result};
use crate::dedupfs_lib::utils::now_ts;
use crate::dedupfs_lib::ROOT_INODE;
use log::*;
use rusqlite::types::{FromSql, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension, Params};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

const DUMP_MAGIC: &[u8; 4] = b"DFSM";
const DUMP_VERSION: u8 = 1;

/// Tables in dump order, with the ORDER BY clause that makes the dump
/// deterministic for a given row set.
const DUMP_TABLES: &[(&str, &str)] = &[
    ("parameters", "id"),
    ("names", "id"),
    ("inodes", "id"),
    ("symlink_targets", "inode"),
    ("contents", "parent_inode, name_id"),
    ("ext_attributes", "inode, name_id"),
    ("objects", "id"),
    ("blocks", "id"),
    ("inode_blocks", "inode, blockno"),
];

pub struct MetaDb {
    pub(crate) conn: Connection,
}

impl MetaDb {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(5000))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        Ok(self.conn.execute(sql, params)?)
    }

    /// Scalar query. A missing row is `FsError::NoSuchRow`, distinct from
    /// a failed query.
    pub fn get_val<T: FromSql, P: Params>(&self, sql: &str, params: P) -> Result<T> {
        Ok(self.conn.query_row(sql, params, |row| row.get(0))?)
    }

    pub fn has_val<P: Params>(&self, sql: &str, params: P) -> Result<bool> {
        let res: Option<i64> = self
            .conn
            .query_row(sql, params, |_| Ok(0))
            .optional()?;
        Ok(res.is_some())
    }

    /// Execute an INSERT and return the id of the inserted row.
    pub fn rowid<P: Params>(&self, sql: &str, params: P) -> Result<i64> {
        self.conn.execute(sql, params)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// First column of every result row.
    pub fn query_col<T: FromSql, P: Params>(&self, sql: &str, params: P) -> Result<Vec<T>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| row.get(0))?;
        let mut out = vec![];
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Map every result row through `f`.
    pub fn query_rows<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;
        let mut out = vec![];
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Single row mapped through `f`; missing row is `FsError::NoSuchRow`.
    pub fn get_row<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<T>
    where
        P: Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        Ok(self.conn.query_row(sql, params, f)?)
    }

    pub fn begin(&self) -> Result<()> {
        self.execute("BEGIN TRANSACTION", [])?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.execute("COMMIT", [])?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        self.execute("ROLLBACK", [])?;
        Ok(())
    }

    /// `PRAGMA integrity_check`; anything but "ok" is fatal corruption.
    pub fn integrity_check(&self) -> Result<()> {
        let res: String = self
            .conn
            .query_row("PRAGMA integrity_check(20)", [], |row| row.get(0))?;
        if res == "ok" {
            Ok(())
        } else {
            Err(FsError::Corrupt(res))
        }
    }

    pub fn vacuum(&self) -> Result<()> {
        self.conn.execute_batch("ANALYZE; VACUUM;")?;
        Ok(())
    }
}

pub fn create_tables(db: &MetaDb) -> Result<()> {
    db.conn.execute_batch(
        "
        CREATE TABLE parameters (
            id            INTEGER PRIMARY KEY CHECK (id = 0),
            revision      INT NOT NULL,
            seq_no        INT NOT NULL,
            label         TEXT NOT NULL,
            blocksize     INT NOT NULL,
            needs_fsck    BOOLEAN NOT NULL,
            last_fsck     REAL NOT NULL,
            last_modified REAL NOT NULL,
            max_inode     INT NOT NULL,
            inode_gen     INT NOT NULL
        );

        CREATE TABLE names (
            id       INTEGER PRIMARY KEY AUTOINCREMENT,
            name     BLOB NOT NULL UNIQUE,
            refcount INT NOT NULL
        );

        CREATE TABLE inodes (
            id       INTEGER PRIMARY KEY AUTOINCREMENT,
            mode     INT NOT NULL,
            uid      INT NOT NULL,
            gid      INT NOT NULL,
            mtime    REAL NOT NULL,
            atime    REAL NOT NULL,
            ctime    REAL NOT NULL,
            refcount INT NOT NULL,
            size     INT NOT NULL DEFAULT 0,
            rdev     INT NOT NULL DEFAULT 0,
            locked   BOOLEAN NOT NULL DEFAULT 0,
            -- mapping for blockno 0; other positions live in inode_blocks
            block_id INT REFERENCES blocks(id)
        );

        CREATE TABLE symlink_targets (
            inode  INTEGER PRIMARY KEY REFERENCES inodes(id),
            target BLOB NOT NULL
        );

        CREATE TABLE contents (
            name_id      INTEGER NOT NULL REFERENCES names(id),
            inode        INTEGER NOT NULL REFERENCES inodes(id),
            parent_inode INTEGER NOT NULL REFERENCES inodes(id),
            PRIMARY KEY (parent_inode, name_id)
        );

        CREATE TABLE ext_attributes (
            inode   INTEGER NOT NULL REFERENCES inodes(id),
            name_id INTEGER NOT NULL REFERENCES names(id),
            value   BLOB NOT NULL,
            PRIMARY KEY (inode, name_id)
        );

        CREATE TABLE objects (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            refcount   INT NOT NULL,
            size       INT NOT NULL,
            compr_size INT
        );

        CREATE TABLE blocks (
            id       INTEGER PRIMARY KEY AUTOINCREMENT,
            hash     BLOB UNIQUE,
            refcount INT NOT NULL,
            obj_id   INTEGER NOT NULL REFERENCES objects(id)
        );

        CREATE TABLE inode_blocks (
            inode    INTEGER NOT NULL REFERENCES inodes(id),
            blockno  INT NOT NULL,
            block_id INTEGER NOT NULL REFERENCES blocks(id),
            PRIMARY KEY (inode, blockno)
        );

        CREATE INDEX ix_contents_inode ON contents(inode);
        CREATE INDEX ix_blocks_obj_id ON blocks(obj_id);
        CREATE INDEX ix_inode_blocks_block_id ON inode_blocks(block_id);
        CREATE INDEX ix_ext_attributes_inode ON ext_attributes(inode);
        ",
    )?;
    Ok(())
}

/// Insert the root directory inode.
pub fn init_tables(db: &MetaDb) -> Result<()> {
    let now = now_ts();
    db.execute(
        "INSERT INTO inodes (id, mode, uid, gid, mtime, atime, ctime, refcount)
         VALUES (?, ?, 0, 0, ?, ?, ?, 1)",
        rusqlite::params![ROOT_INODE, libc::S_IFDIR | 0o755, now, now, now],
    )?;
    Ok(())
}

/// Run `f` inside a transaction, rolling back on error.
pub fn with_txn<T>(db: &MetaDb, f: impl FnOnce() -> Result<T>) -> Result<T> {
    db.begin()?;
    match f() {
        Ok(v) => {
            db.commit()?;
            Ok(v)
        }
        Err(e) => {
            db.rollback().ok();
            Err(e)
        }
    }
}

fn write_str<W: Write>(w: &mut W, s: &str) -> Result<()> {
    w.write_all(&[s.len() as u8])?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn write_bytes<W: Write>(w: &mut W, b: &[u8]) -> Result<()> {
    w.write_all(&(b.len() as u32).to_le_bytes())?;
    w.write_all(b)?;
    Ok(())
}

fn read_exact<R: Read>(r: &mut R, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    Ok(read_exact(r, 1)?[0])
}

fn read_str<R: Read>(r: &mut R) -> Result<String> {
    let len = read_u8(r)? as usize;
    String::from_utf8(read_exact(r, len)?).map_err(|_| FsError::Corrupt("dump string".to_string()))
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let buf = read_exact(r, 4)?;
    Ok(u32::from_le_bytes(buf.try_into().unwrap()))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let buf = read_exact(r, 8)?;
    Ok(u64::from_le_bytes(buf.try_into().unwrap()))
}

/// Serialize all tables to a compact row-oriented stream. Rows are emitted
/// in primary-key order, so identical row sets produce identical bytes.
pub fn dump_metadata<W: Write>(db: &MetaDb, mut w: W) -> Result<()> {
    w.write_all(DUMP_MAGIC)?;
    w.write_all(&[DUMP_VERSION])?;
    for (table, order) in DUMP_TABLES {
        let count: i64 = db.get_val(&format!("SELECT COUNT(*) FROM {}", table), [])?;
        let mut stmt = db
            .conn
            .prepare(&format!("SELECT * FROM {} ORDER BY {}", table, order))?;
        let ncols = stmt.column_count();
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

        write_str(&mut w, table)?;
        w.write_all(&(count as u64).to_le_bytes())?;
        w.write_all(&[ncols as u8])?;
        for name in &names {
            write_str(&mut w, name)?;
        }

        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            for i in 0..ncols {
                match row.get_ref(i)? {
                    ValueRef::Null => w.write_all(&[0])?,
                    ValueRef::Integer(v) => {
                        w.write_all(&[1])?;
                        w.write_all(&v.to_le_bytes())?;
                    }
                    ValueRef::Real(v) => {
                        w.write_all(&[2])?;
                        w.write_all(&v.to_le_bytes())?;
                    }
                    ValueRef::Text(t) => {
                        w.write_all(&[3])?;
                        write_bytes(&mut w, t)?;
                    }
                    ValueRef::Blob(b) => {
                        w.write_all(&[4])?;
                        write_bytes(&mut w, b)?;
                    }
                }
            }
        }
        debug!("dumped {} rows from {}", count, table);
    }
    Ok(())
}

/// Inverse of `dump_metadata`, into a database with freshly created tables.
pub fn restore_metadata<R: Read>(mut r: R, db: &MetaDb) -> Result<()> {
    let magic = read_exact(&mut r, 4)?;
    if magic != DUMP_MAGIC {
        return Err(FsError::Corrupt("bad dump magic".to_string()));
    }
    if read_u8(&mut r)? != DUMP_VERSION {
        return Err(FsError::Corrupt("unsupported dump version".to_string()));
    }
    db.begin()?;
    let res = restore_tables(&mut r, db);
    match res {
        Ok(()) => db.commit(),
        Err(e) => {
            db.rollback().ok();
            Err(e)
        }
    }
}

fn restore_tables<R: Read>(r: &mut R, db: &MetaDb) -> Result<()> {
    for (expected, _) in DUMP_TABLES {
        let table = read_str(r)?;
        if table != *expected {
            return Err(FsError::Corrupt(format!("unexpected table {} in dump", table)));
        }
        let count = read_u64(r)?;
        let ncols = read_u8(r)? as usize;
        let mut names = Vec::with_capacity(ncols);
        for _ in 0..ncols {
            names.push(read_str(r)?);
        }
        let placeholders = vec!["?"; ncols].join(",");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            names.join(","),
            placeholders
        );
        let mut stmt = db.conn.prepare(&sql)?;
        for _ in 0..count {
            let mut values = Vec::with_capacity(ncols);
            for _ in 0..ncols {
                let value = match read_u8(r)? {
                    0 => Value::Null,
                    1 => Value::Integer(i64::from_le_bytes(
                        read_exact(r, 8)?.try_into().unwrap(),
                    )),
                    2 => Value::Real(f64::from_le_bytes(read_exact(r, 8)?.try_into().unwrap())),
                    3 => {
                        let len = read_u32(r)? as usize;
                        Value::Text(
                            String::from_utf8(read_exact(r, len)?)
                                .map_err(|_| FsError::Corrupt("dump text".to_string()))?,
                        )
                    }
                    4 => {
                        let len = read_u32(r)? as usize;
                        Value::Blob(read_exact(r, len)?)
                    }
                    tag => return Err(FsError::Corrupt(format!("bad value tag {}", tag))),
                };
                values.push(value);
            }
            stmt.execute(params_from_iter(values))?;
        }
        debug!("restored {} rows into {}", count, table);
    }
    Ok(())
}
