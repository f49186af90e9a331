use chrono::{DateTime, SecondsFormat, Utc};
use facegate_core::{Embedding, LookupError, ReferenceLookup};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("User already exists")]
    DuplicateIdentity,
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("embedding is empty")]
    EmptyEmbedding,
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidEmbeddingValue,
    #[error("invalid stored timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// Outcome class of an authentication log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogStatus {
    #[serde(rename = "In Process")]
    InProcess,
    Verified,
    Rejected,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::InProcess => "In Process",
            LogStatus::Verified => "Verified",
            LogStatus::Rejected => "Rejected",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "Verified" => LogStatus::Verified,
            "Rejected" => LogStatus::Rejected,
            _ => LogStatus::InProcess,
        }
    }
}

/// Geographic coordinates reported by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Coordinates {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Registration data for a new user.
pub struct NewUser<'a> {
    pub email: &'a str,
    pub name: &'a str,
    /// Encoded front capture, stored as the profile picture.
    pub profile_image: &'a [u8],
    pub reference: &'a Embedding,
    pub location: Coordinates,
}

/// An authentication attempt to record.
pub struct NewLogEntry<'a> {
    pub email: &'a str,
    pub name: Option<&'a str>,
    pub status: LogStatus,
    pub verified: bool,
    pub detail: &'a str,
    pub location: Coordinates,
    pub time_taken: Option<f64>,
}

/// One row of the authentication log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub status: LogStatus,
    pub verification_status: bool,
    pub detail: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub time_taken: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// SQLite-backed user and authentication-log storage.
///
/// Reference embeddings are encrypted with AES-256-GCM before storage. A
/// per-installation 32-byte key is generated at first use and stored at
/// `{db_dir}/.key` (mode 0600).
#[derive(Clone)]
pub struct Store {
    conn: Connection,
    enc_key: [u8; 32],
}

impl Store {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): fixed all-zeros key
            [0u8; 32]
        } else {
            let dir = db_path.parent().unwrap_or(Path::new("."));
            std::fs::create_dir_all(dir).map_err(StoreError::KeyIo)?;
            load_or_generate_key(&dir.join(".key"))?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS users (
                     email TEXT PRIMARY KEY,
                     name TEXT NOT NULL,
                     profile_image BLOB NOT NULL,
                     embedding BLOB NOT NULL,
                     model_version TEXT,
                     latitude REAL,
                     longitude REAL,
                     created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS logs (
                     id TEXT PRIMARY KEY,
                     email TEXT NOT NULL,
                     name TEXT,
                     status TEXT NOT NULL,
                     verification_status INTEGER NOT NULL DEFAULT 0,
                     detail TEXT NOT NULL,
                     latitude REAL,
                     longitude REAL,
                     time_taken REAL,
                     timestamp TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_logs_email ON logs(email, timestamp);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// Persist a new user. Fails with `DuplicateIdentity` if the email exists.
    pub async fn insert_user(&self, user: NewUser<'_>) -> Result<(), StoreError> {
        let blob = self.encrypt_embedding(&user.reference.values)?;
        let model_version = user.reference.model_version.clone();
        let email = user.email.to_string();
        let name = user.name.to_string();
        let image = user.profile_image.to_vec();
        let Coordinates { latitude, longitude } = user.location;
        let created_at = now_rfc3339();

        let inserted = self
            .conn
            .call(move |conn| {
                let affected = conn.execute(
                    "INSERT INTO users (email, name, profile_image, embedding, model_version, latitude, longitude, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(email) DO NOTHING",
                    rusqlite::params![email, name, image, blob, model_version, latitude, longitude, created_at],
                )?;
                Ok(affected > 0)
            })
            .await?;

        if inserted {
            Ok(())
        } else {
            Err(StoreError::DuplicateIdentity)
        }
    }

    pub async fn user_exists(&self, email: &str) -> Result<bool, StoreError> {
        let email = email.to_string();
        self.conn
            .call(move |conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM users WHERE email = ?1", [&email], |row| row.get(0))?;
                Ok(count > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn user_name(&self, email: &str) -> Result<Option<String>, StoreError> {
        let email = email.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT name FROM users WHERE email = ?1")?;
                let mut rows = stmt.query_map([&email], |row| row.get::<_, String>(0))?;
                let name = rows.next().transpose()?;
                Ok(name)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Decrypted reference embedding of `email`, if enrolled.
    pub async fn reference_embedding(&self, email: &str) -> Result<Option<Embedding>, StoreError> {
        let email = email.to_string();
        let row: Option<(Vec<u8>, Option<String>)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT embedding, model_version FROM users WHERE email = ?1")?;
                let mut rows = stmt.query_map([&email], |row| {
                    Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Option<String>>(1)?))
                })?;
                let row = rows.next().transpose()?;
                Ok(row)
            })
            .await?;

        let Some((blob, model_version)) = row else {
            return Ok(None);
        };
        Ok(Some(Embedding {
            values: self.decrypt_embedding(&blob)?,
            model_version,
        }))
    }

    /// Append an authentication attempt. Returns the generated UUID.
    pub async fn record_attempt(&self, entry: NewLogEntry<'_>) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let id_clone = id.clone();
        let email = entry.email.to_string();
        let name = entry.name.map(str::to_string);
        let status = entry.status.as_str();
        let verified = entry.verified;
        let detail = entry.detail.to_string();
        let Coordinates { latitude, longitude } = entry.location;
        let time_taken = entry.time_taken;
        let timestamp = now_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO logs (id, email, name, status, verification_status, detail, latitude, longitude, time_taken, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    rusqlite::params![id_clone, email, name, status, verified, detail, latitude, longitude, time_taken, timestamp],
                )?;
                Ok(())
            })
            .await?;

        Ok(id)
    }

    /// Mark the newest log entry of `email` as a successful login.
    /// Returns `false` when the email has no log entries.
    pub async fn mark_latest_verified(
        &self,
        email: &str,
        location: Coordinates,
        time_taken: Option<f64>,
    ) -> Result<bool, StoreError> {
        let email = email.to_string();
        let timestamp = now_rfc3339();
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "UPDATE logs
                     SET status = 'Verified', verification_status = 1, detail = 'Logged in Successfully',
                         latitude = ?2, longitude = ?3, time_taken = ?4, timestamp = ?5
                     WHERE id = (SELECT id FROM logs WHERE email = ?1 ORDER BY timestamp DESC, rowid DESC LIMIT 1)",
                    rusqlite::params![email, location.latitude, location.longitude, time_taken, timestamp],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Every log entry, newest first.
    pub async fn logs(&self) -> Result<Vec<LogEntry>, StoreError> {
        type Row = (
            String,
            String,
            Option<String>,
            String,
            bool,
            String,
            Option<f64>,
            Option<f64>,
            Option<f64>,
            String,
        );
        let rows: Vec<Row> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, email, name, status, verification_status, detail, latitude, longitude, time_taken, timestamp
                     FROM logs ORDER BY timestamp DESC, rowid DESC",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        rows.into_iter()
            .map(
                |(id, email, name, status, verified, detail, latitude, longitude, time_taken, timestamp)| {
                    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                        .map_err(|_| StoreError::InvalidTimestamp(timestamp.clone()))?
                        .with_timezone(&Utc);
                    Ok(LogEntry {
                        id,
                        email,
                        name,
                        status: LogStatus::parse(&status),
                        verification_status: verified,
                        detail,
                        latitude,
                        longitude,
                        time_taken,
                        timestamp,
                    })
                },
            )
            .collect()
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_embedding(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        validate_embedding_values(values)?;
        let plaintext = embedding_to_bytes(values);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_embedding(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_embedding(&plaintext)
    }
}

/// Blocking [`ReferenceLookup`] over the async store, for engine worker threads.
pub struct StoreReferences {
    store: Store,
    runtime: tokio::runtime::Handle,
}

impl StoreReferences {
    pub fn new(store: Store, runtime: tokio::runtime::Handle) -> Self {
        Self { store, runtime }
    }
}

impl ReferenceLookup for StoreReferences {
    fn reference_embedding(&self, identity: &str) -> Result<Option<Embedding>, LookupError> {
        self.runtime
            .block_on(self.store.reference_embedding(identity))
            .map_err(|e| LookupError(e.to_string()))
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one
/// with mode 0600.
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("encryption key file has wrong length ({} bytes, expected 32)", bytes.len()),
            ))
        })?;
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }

    let mut values = Vec::with_capacity(bytes.len() / 4);
    for chunk in bytes.chunks_exact(4) {
        let arr: [u8; 4] = chunk
            .try_into()
            .map_err(|_| StoreError::InvalidBlob(bytes.len()))?;
        let v = f32::from_le_bytes(arr);
        if !v.is_finite() {
            return Err(StoreError::InvalidEmbeddingValue);
        }
        values.push(v);
    }
    Ok(values)
}

fn validate_embedding_values(values: &[f32]) -> Result<(), StoreError> {
    if values.is_empty() {
        return Err(StoreError::EmptyEmbedding);
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidEmbeddingValue);
    }
    Ok(())
}
