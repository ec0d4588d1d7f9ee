//! Generic storage for mirrored records
//!
//! Every mirrored table starts with the same five sync columns; the
//! [`SyncRecord`] impls describe the domain columns that follow.

use crate::error::{Error, Result};
use crate::models::{
    LoginAttempt, LoginState, RecordId, Role, SyncMeta, SyncStatus, User, UserSession,
};
use libsql::{Connection, Row, Value};

/// Sync columns shared by every mirrored table, in select order
const META_COLUMNS: [&str; 5] = ["local_id", "remote_id", "sync_status", "updated_at", "source"];

/// A record stored in a mirrored table
pub trait SyncRecord: Sized + Clone + Send + Sync + 'static {
    /// Local table name
    const TABLE: &'static str;
    /// Domain columns, in the order of [`SyncRecord::column_values`]
    const COLUMNS: &'static [&'static str];
    /// Column holding the natural key, if the record has one
    const NATURAL_KEY: Option<&'static str> = None;

    fn meta(&self) -> &SyncMeta;
    fn meta_mut(&mut self) -> &mut SyncMeta;

    /// Values for [`SyncRecord::COLUMNS`]
    fn column_values(&self) -> Vec<Value>;

    /// Rebuild a record from its domain columns
    fn from_columns(meta: SyncMeta, columns: &RowReader<'_>) -> Result<Self>;

    /// Value of the natural key column
    fn natural_key(&self) -> Option<String> {
        None
    }
}

/// Typed access to a row, relative to the first domain column
pub struct RowReader<'r> {
    row: &'r Row,
    offset: i32,
}

impl<'r> RowReader<'r> {
    const fn new(row: &'r Row, offset: i32) -> Self {
        Self { row, offset }
    }

    fn value(&self, index: i32) -> Result<Value> {
        Ok(self.row.get_value(self.offset + index)?)
    }

    pub fn text(&self, index: i32) -> Result<String> {
        match self.value(index)? {
            Value::Text(value) => Ok(value),
            other => Err(column_error(index, "text", &other)),
        }
    }

    pub fn opt_text(&self, index: i32) -> Result<Option<String>> {
        match self.value(index)? {
            Value::Null => Ok(None),
            Value::Text(value) => Ok(Some(value)),
            other => Err(column_error(index, "text", &other)),
        }
    }

    pub fn int(&self, index: i32) -> Result<i64> {
        match self.value(index)? {
            Value::Integer(value) => Ok(value),
            other => Err(column_error(index, "integer", &other)),
        }
    }

    pub fn opt_int(&self, index: i32) -> Result<Option<i64>> {
        match self.value(index)? {
            Value::Null => Ok(None),
            Value::Integer(value) => Ok(Some(value)),
            other => Err(column_error(index, "integer", &other)),
        }
    }

    pub fn flag(&self, index: i32) -> Result<bool> {
        Ok(self.int(index)? != 0)
    }

    pub fn count(&self, index: i32) -> Result<u32> {
        Ok(u32::try_from(self.int(index)?.max(0)).unwrap_or(u32::MAX))
    }

    pub fn record_id(&self, index: i32) -> Result<RecordId> {
        parse_record_id(&self.text(index)?)
    }

    pub fn opt_record_id(&self, index: i32) -> Result<Option<RecordId>> {
        self.opt_text(index)?
            .map(|value| parse_record_id(&value))
            .transpose()
    }
}

fn column_error(index: i32, expected: &str, found: &Value) -> Error {
    Error::Database(format!(
        "expected {expected} in column {index}, found {found:?}"
    ))
}

fn parse_record_id(value: &str) -> Result<RecordId> {
    value
        .parse()
        .map_err(|error| Error::Database(format!("invalid record id `{value}`: {error}")))
}

/// Column value helpers
pub mod values {
    use libsql::Value;

    pub fn text(value: &str) -> Value {
        Value::Text(value.to_string())
    }

    pub fn opt_text(value: Option<&str>) -> Value {
        value.map_or(Value::Null, text)
    }

    pub const fn int(value: i64) -> Value {
        Value::Integer(value)
    }

    pub const fn opt_int(value: Option<i64>) -> Value {
        match value {
            Some(value) => Value::Integer(value),
            None => Value::Null,
        }
    }

    pub const fn flag(value: bool) -> Value {
        Value::Integer(if value { 1 } else { 0 })
    }
}

fn read_meta(row: &Row) -> Result<SyncMeta> {
    let reader = RowReader::new(row, 0);
    let status = reader.text(2)?;
    Ok(SyncMeta {
        local_id: reader.record_id(0)?,
        remote_id: reader.opt_text(1)?,
        sync_status: status.parse().map_err(Error::Database)?,
        updated_at: reader.int(3)?,
        source: reader.text(4)?,
    })
}

fn meta_values(meta: &SyncMeta) -> Vec<Value> {
    vec![
        values::text(&meta.local_id.as_str()),
        values::opt_text(meta.remote_id.as_deref()),
        values::text(meta.sync_status.as_str()),
        values::int(meta.updated_at),
        values::text(&meta.source),
    ]
}

fn select_columns<R: SyncRecord>() -> String {
    META_COLUMNS
        .iter()
        .chain(R::COLUMNS.iter())
        .copied()
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Repository over any [`SyncRecord`] table
pub struct RecordRepository<'a> {
    conn: &'a Connection,
}

impl<'a> RecordRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Fetch a record by local id
    pub async fn get<R: SyncRecord>(&self, local_id: &RecordId) -> Result<Option<R>> {
        self.find_one("local_id = ?", vec![values::text(&local_id.as_str())])
            .await
    }

    /// Fetch a record by mirror document id
    pub async fn find_by_remote_id<R: SyncRecord>(&self, remote_id: &str) -> Result<Option<R>> {
        self.find_one("remote_id = ?", vec![values::text(remote_id)])
            .await
    }

    /// Fetch a record by its natural key; always `None` for records without one
    pub async fn find_by_natural_key<R: SyncRecord>(&self, key: &str) -> Result<Option<R>> {
        let Some(column) = R::NATURAL_KEY else {
            return Ok(None);
        };
        self.find_one(&format!("{column} = ?"), vec![values::text(key)])
            .await
    }

    /// Records in any of `statuses`, oldest change first
    pub async fn list_by_status<R: SyncRecord>(
        &self,
        statuses: &[SyncStatus],
        limit: usize,
    ) -> Result<Vec<R>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let mut params: Vec<Value> = statuses
            .iter()
            .map(|status| values::text(status.as_str()))
            .collect();
        params.push(values::int(i64::try_from(limit).unwrap_or(i64::MAX)));
        self.list_where(
            &format!(
                "sync_status IN ({}) ORDER BY updated_at ASC LIMIT ?",
                placeholders(statuses.len())
            ),
            params,
        )
        .await
    }

    /// Records matching a raw `WHERE` clause
    pub async fn list_where<R: SyncRecord>(
        &self,
        clause: &str,
        params: Vec<Value>,
    ) -> Result<Vec<R>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {clause}",
            select_columns::<R>(),
            R::TABLE
        );
        let mut rows = self.conn.query(&sql, params).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::read::<R>(&row)?);
        }
        Ok(records)
    }

    async fn find_one<R: SyncRecord>(
        &self,
        clause: &str,
        params: Vec<Value>,
    ) -> Result<Option<R>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {clause} LIMIT 1",
            select_columns::<R>(),
            R::TABLE
        );
        let mut rows = self.conn.query(&sql, params).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::read::<R>(&row)?)),
            None => Ok(None),
        }
    }

    fn read<R: SyncRecord>(row: &Row) -> Result<R> {
        let meta = read_meta(row)?;
        let offset = i32::try_from(META_COLUMNS.len()).unwrap_or(i32::MAX);
        R::from_columns(meta, &RowReader::new(row, offset))
    }

    /// Insert or fully overwrite a record keyed by local id
    pub async fn save<R: SyncRecord>(&self, record: &R) -> Result<()> {
        let columns: Vec<&str> = META_COLUMNS
            .iter()
            .chain(R::COLUMNS.iter())
            .copied()
            .collect();
        let updates = columns
            .iter()
            .skip(1)
            .map(|column| format!("{column} = excluded.{column}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(local_id) DO UPDATE SET {updates}",
            R::TABLE,
            columns.join(", "),
            placeholders(columns.len()),
        );

        let mut params = meta_values(record.meta());
        params.extend(record.column_values());
        self.conn.execute(&sql, params).await.map_err(|error| {
            if error.to_string().contains("UNIQUE constraint failed") {
                Error::Conflict(format!("{} already has this key: {error}", R::TABLE))
            } else {
                Error::LibSql(error)
            }
        })?;
        Ok(())
    }

    /// Number of rows in `table` with the given status
    pub async fn count_by_status(&self, table: &str, status: SyncStatus) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT COUNT(*) FROM {table} WHERE sync_status = ?"),
                vec![values::text(status.as_str())],
            )
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

impl SyncRecord for User {
    const TABLE: &'static str = "users";
    const COLUMNS: &'static [&'static str] = &[
        "email",
        "password_hash",
        "full_name",
        "phone",
        "role",
        "is_active",
        "failed_attempts",
        "is_locked",
        "locked_at",
        "locked_until",
        "last_failed_login",
        "last_login",
        "external_uid",
        "created_at",
    ];
    const NATURAL_KEY: Option<&'static str> = Some("email");

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn column_values(&self) -> Vec<Value> {
        vec![
            values::text(&self.email),
            values::opt_text(self.password_hash.as_deref()),
            values::opt_text(self.full_name.as_deref()),
            values::opt_text(self.phone.as_deref()),
            values::text(self.role.as_str()),
            values::flag(self.is_active),
            values::int(i64::from(self.login.failed_attempts)),
            values::flag(self.login.is_locked),
            values::opt_int(self.login.locked_at),
            values::opt_int(self.login.locked_until),
            values::opt_int(self.login.last_failed_login),
            values::opt_int(self.login.last_login),
            values::opt_text(self.external_uid.as_deref()),
            values::int(self.created_at),
        ]
    }

    fn from_columns(meta: SyncMeta, columns: &RowReader<'_>) -> Result<Self> {
        let role: Role = columns.text(4)?.parse().map_err(Error::Database)?;
        Ok(Self {
            meta,
            email: columns.text(0)?,
            password_hash: columns.opt_text(1)?,
            full_name: columns.opt_text(2)?,
            phone: columns.opt_text(3)?,
            role,
            is_active: columns.flag(5)?,
            login: LoginState {
                failed_attempts: columns.count(6)?,
                is_locked: columns.flag(7)?,
                locked_at: columns.opt_int(8)?,
                locked_until: columns.opt_int(9)?,
                last_failed_login: columns.opt_int(10)?,
                last_login: columns.opt_int(11)?,
            },
            external_uid: columns.opt_text(12)?,
            created_at: columns.int(13)?,
        })
    }

    fn natural_key(&self) -> Option<String> {
        Some(self.email.clone())
    }
}

impl SyncRecord for UserSession {
    const TABLE: &'static str = "user_sessions";
    const COLUMNS: &'static [&'static str] = &[
        "user_id",
        "session_token",
        "refresh_token",
        "device_info",
        "ip_address",
        "created_at",
        "expires_at",
        "is_valid",
    ];
    const NATURAL_KEY: Option<&'static str> = Some("session_token");

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn column_values(&self) -> Vec<Value> {
        vec![
            values::text(&self.user_id.as_str()),
            values::text(&self.session_token),
            values::text(&self.refresh_token),
            values::opt_text(self.device_info.as_deref()),
            values::opt_text(self.ip_address.as_deref()),
            values::int(self.created_at),
            values::int(self.expires_at),
            values::flag(self.is_valid),
        ]
    }

    fn from_columns(meta: SyncMeta, columns: &RowReader<'_>) -> Result<Self> {
        Ok(Self {
            meta,
            user_id: columns.record_id(0)?,
            session_token: columns.text(1)?,
            refresh_token: columns.text(2)?,
            device_info: columns.opt_text(3)?,
            ip_address: columns.opt_text(4)?,
            created_at: columns.int(5)?,
            expires_at: columns.int(6)?,
            is_valid: columns.flag(7)?,
        })
    }

    fn natural_key(&self) -> Option<String> {
        Some(self.session_token.clone())
    }
}

impl SyncRecord for LoginAttempt {
    const TABLE: &'static str = "login_attempts";
    const COLUMNS: &'static [&'static str] = &[
        "user_id",
        "email",
        "ip_address",
        "user_agent",
        "success",
        "failure_reason",
        "attempted_at",
    ];

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn column_values(&self) -> Vec<Value> {
        vec![
            values::opt_text(self.user_id.map(|id| id.as_str()).as_deref()),
            values::text(&self.email),
            values::opt_text(self.ip_address.as_deref()),
            values::opt_text(self.user_agent.as_deref()),
            values::flag(self.success),
            values::opt_text(self.failure_reason.as_deref()),
            values::int(self.attempted_at),
        ]
    }

    fn from_columns(meta: SyncMeta, columns: &RowReader<'_>) -> Result<Self> {
        Ok(Self {
            meta,
            user_id: columns.opt_record_id(0)?,
            email: columns.text(1)?,
            ip_address: columns.opt_text(2)?,
            user_agent: columns.opt_text(3)?,
            success: columns.flag(4)?,
            failure_reason: columns.opt_text(5)?,
            attempted_at: columns.int(6)?,
        })
    }
}
