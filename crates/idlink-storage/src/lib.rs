use chrono::{DateTime, Utc};
use idlink_core::{resolve, ConsolidatedIdentity, Contact, ContactFragment, LinkPrecedence};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const CONTACT_SCHEMA_VERSION: i64 = 1;

/// Retry budget for resolutions that lose the write lock to a concurrent
/// transaction. Keeps transient SQLITE_BUSY conflicts from surfacing while
/// still bounding the loop against livelock.
const MAX_RESOLVE_ATTEMPTS: u32 = 5;

const CONTACT_COLUMNS: &str =
    "id, email, phone_number, link_precedence, linked_id, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("corrupt contact data: {0}")]
    Corrupt(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("resolution still contended after {attempts} attempts")]
    Contention { attempts: u32 },
}

/// Result of one resolution: the consolidated view plus what the sequence
/// changed, for the caller's logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOutcome {
    pub identity: ConsolidatedIdentity,
    pub created_id: Option<i64>,
    pub demoted_primaries: Vec<i64>,
}

pub struct ContactStore {
    conn: Connection,
}

impl ContactStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > CONTACT_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: CONTACT_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_contacts.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Run the full read-merge-write sequence for one normalized fragment.
    ///
    /// The whole sequence executes inside a single IMMEDIATE transaction, so
    /// the write lock is taken before the lookup reads: two connections
    /// racing on the same previously-unseen identifiers cannot both observe
    /// an empty match set and both create a primary. A resolution that loses
    /// the lock is retried from the top, bounded by MAX_RESOLVE_ATTEMPTS.
    pub fn resolve_identity(
        &mut self,
        fragment: &ContactFragment,
    ) -> Result<ResolveOutcome, StorageError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_resolve(fragment) {
                Err(StorageError::Sqlite(err)) if is_busy(&err) => {
                    if attempt >= MAX_RESOLVE_ATTEMPTS {
                        return Err(StorageError::Contention { attempts: attempt });
                    }
                }
                other => return other,
            }
        }
    }

    fn try_resolve(&mut self, fragment: &ContactFragment) -> Result<ResolveOutcome, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let matched = find_by_identifier(&tx, fragment)?;
        let primary_ids = resolve::governing_primary_ids(&matched);
        let related = contacts_for_primaries(&tx, &primary_ids)?;

        let mut created_id = None;
        let winner = match resolve::winning_primary(&related) {
            Some(contact) => contact.clone(),
            None if matched.is_empty() => {
                let contact = create_contact(
                    &tx,
                    fragment.email.as_deref(),
                    fragment.phone_number.as_deref(),
                    LinkPrecedence::Primary,
                    None,
                )?;
                created_id = Some(contact.id);
                contact
            }
            None => {
                return Err(StorageError::Corrupt(format!(
                    "matched contacts reference missing primaries: {primary_ids:?}"
                )));
            }
        };

        let mut demoted_primaries = Vec::new();
        for contact in &related {
            if contact.is_primary() && contact.id != winner.id {
                demote_to_secondary(&tx, contact.id, winner.id)?;
                // Flatten the absorbed cluster so links stay single-hop.
                relink_cluster(&tx, contact.id, winner.id)?;
                demoted_primaries.push(contact.id);
            }
        }

        let mut cluster = cluster_of_primary(&tx, winner.id)?;
        if !resolve::fragment_already_recorded(&cluster, fragment) {
            let contact = create_contact(
                &tx,
                fragment.email.as_deref(),
                fragment.phone_number.as_deref(),
                LinkPrecedence::Secondary,
                Some(winner.id),
            )?;
            created_id = Some(contact.id);
            cluster.push(contact);
        }

        let identity = resolve::consolidate(&winner, &cluster);
        tx.commit()?;

        Ok(ResolveOutcome {
            identity,
            created_id,
            demoted_primaries,
        })
    }

    pub fn contact(&self, id: i64) -> Result<Option<Contact>, StorageError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                [id],
                contact_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// The full cluster of a primary: the primary itself plus every contact
    /// linked to it, in seniority order.
    pub fn cluster_of(&self, primary_id: i64) -> Result<Vec<Contact>, StorageError> {
        cluster_of_primary(&self.conn, primary_id)
    }

    pub fn contact_count(&self) -> Result<i64, StorageError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM contacts", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn primary_count(&self) -> Result<i64, StorageError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM contacts WHERE link_precedence = 'primary'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

fn find_by_identifier(
    conn: &Connection,
    fragment: &ContactFragment,
) -> Result<Vec<Contact>, StorageError> {
    let mut statement = conn.prepare(&format!(
        "
        SELECT {CONTACT_COLUMNS}
        FROM contacts
        WHERE (?1 IS NOT NULL AND email = ?1)
           OR (?2 IS NOT NULL AND phone_number = ?2)
        ORDER BY created_at ASC, id ASC
        "
    ))?;

    let rows = statement.query_map(
        params![fragment.email, fragment.phone_number],
        contact_from_row,
    )?;

    let mut contacts = Vec::new();
    for row in rows {
        contacts.push(row?);
    }
    Ok(contacts)
}

/// The union of every cluster governed by one of the given primaries.
fn contacts_for_primaries(
    conn: &Connection,
    primary_ids: &BTreeSet<i64>,
) -> Result<Vec<Contact>, StorageError> {
    if primary_ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = primary_ids
        .iter()
        .map(|_| "?")
        .collect::<Vec<_>>()
        .join(", ");
    let mut statement = conn.prepare(&format!(
        "
        SELECT {CONTACT_COLUMNS}
        FROM contacts
        WHERE id IN ({placeholders}) OR linked_id IN ({placeholders})
        ORDER BY created_at ASC, id ASC
        "
    ))?;

    let rows = statement.query_map(
        params_from_iter(primary_ids.iter().chain(primary_ids.iter())),
        contact_from_row,
    )?;

    let mut contacts = Vec::new();
    for row in rows {
        contacts.push(row?);
    }
    Ok(contacts)
}

fn cluster_of_primary(conn: &Connection, primary_id: i64) -> Result<Vec<Contact>, StorageError> {
    let mut statement = conn.prepare(&format!(
        "
        SELECT {CONTACT_COLUMNS}
        FROM contacts
        WHERE id = ?1 OR linked_id = ?1
        ORDER BY created_at ASC, id ASC
        "
    ))?;

    let rows = statement.query_map([primary_id], contact_from_row)?;

    let mut contacts = Vec::new();
    for row in rows {
        contacts.push(row?);
    }
    Ok(contacts)
}

fn create_contact(
    conn: &Connection,
    email: Option<&str>,
    phone_number: Option<&str>,
    link_precedence: LinkPrecedence,
    linked_id: Option<i64>,
) -> Result<Contact, StorageError> {
    let now = Utc::now();
    conn.execute(
        "
        INSERT INTO contacts (
            email,
            phone_number,
            link_precedence,
            linked_id,
            created_at,
            updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ",
        params![
            email,
            phone_number,
            link_precedence.as_str(),
            linked_id,
            now.to_rfc3339(),
            now.to_rfc3339(),
        ],
    )?;

    Ok(Contact {
        id: conn.last_insert_rowid(),
        email: email.map(str::to_string),
        phone_number: phone_number.map(str::to_string),
        link_precedence,
        linked_id,
        created_at: now,
        updated_at: now,
    })
}

/// Demote a primary under the winning primary. Only link_precedence,
/// linked_id, and updated_at change; identifiers and created_at are frozen
/// at creation.
fn demote_to_secondary(
    conn: &Connection,
    demoted_id: i64,
    winner_id: i64,
) -> Result<(), StorageError> {
    conn.execute(
        "
        UPDATE contacts
        SET link_precedence = 'secondary', linked_id = ?2, updated_at = ?3
        WHERE id = ?1
        ",
        params![demoted_id, winner_id, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Re-point every contact that hung off a demoted primary at the winner.
fn relink_cluster(
    conn: &Connection,
    demoted_id: i64,
    winner_id: i64,
) -> Result<(), StorageError> {
    conn.execute(
        "
        UPDATE contacts
        SET linked_id = ?2, updated_at = ?3
        WHERE linked_id = ?1
        ",
        params![demoted_id, winner_id, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn contact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    let precedence_raw: String = row.get(3)?;
    let link_precedence = LinkPrecedence::from_str(&precedence_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, err)),
        )
    })?;

    let created_at = parse_timestamp_column(row.get::<_, String>(5)?, 5)?;
    let updated_at = parse_timestamp_column(row.get::<_, String>(6)?, 6)?;

    Ok(Contact {
        id: row.get(0)?,
        email: row.get(1)?,
        phone_number: row.get(2)?,
        link_precedence,
        linked_id: row.get(4)?,
        created_at,
        updated_at,
    })
}

fn parse_timestamp_column(value: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}
