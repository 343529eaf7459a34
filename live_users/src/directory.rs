use crate::{
    db::DbPool,
    error::{DirectoryError, UniqueField},
    model::{Account, Address, NewAccount, Status, User, UserQuery},
};
use rusqlite::{params, types::Value, OptionalExtension, Row};
use std::sync::Arc;
use uuid::Uuid;

/// Persistent store of user accounts.
///
/// Methods are synchronous; async callers go through [`blocking`].
pub trait UserDirectory: Send + Sync {
    /// Insert a new account, offline, with `last_active = at`.
    fn create(&self, account: NewAccount, at: i64) -> Result<Account, DirectoryError>;
    fn find_by_id(&self, id: &Uuid) -> Result<Option<Account>, DirectoryError>;
    fn find_by_login(&self, login_id: &str) -> Result<Option<Account>, DirectoryError>;
    fn find(&self, query: &UserQuery) -> Result<Vec<User>, DirectoryError>;
    fn count(&self) -> Result<u64, DirectoryError>;
    /// Write `status` stamped `at`. Applies only if no newer status write
    /// exists; `last_active` never moves backwards. Returns whether a row changed.
    fn update_status(&self, id: &Uuid, status: Status, at: i64) -> Result<bool, DirectoryError>;
    /// Advance `last_active` to `at` without touching status.
    fn touch(&self, id: &Uuid, at: i64) -> Result<bool, DirectoryError>;
    /// Flip the user offline if still online with `last_active < cutoff`.
    fn expire_if_stale(&self, id: &Uuid, cutoff: i64) -> Result<bool, DirectoryError>;
}

/// Run a directory call on the blocking pool.
pub async fn blocking<T, F>(directory: &Arc<dyn UserDirectory>, f: F) -> Result<T, DirectoryError>
where
    T: Send + 'static,
    F: FnOnce(&dyn UserDirectory) -> Result<T, DirectoryError> + Send + 'static,
{
    let directory = directory.clone();
    tokio::task::spawn_blocking(move || f(directory.as_ref())).await?
}

/// SQLite-backed directory.
#[derive(Clone)]
pub struct SqliteDirectory {
    pool: DbPool,
}

type PooledConn = r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>;

const ACCOUNT_COLUMNS: &str = "id, first_name, last_name, email, mobile_no, street, city, state, country, pincode, login_id, status, last_active, created_at, password_hash";

impl SqliteDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<PooledConn, DirectoryError> {
        Ok(self.pool.get()?)
    }

    fn find_one(&self, column: &str, value: &str) -> Result<Option<Account>, DirectoryError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM users WHERE {column} = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let raw = stmt.query_row([value], RawAccount::from_row).optional()?;
        raw.map(RawAccount::into_account).transpose()
    }
}

/// Make `%`, `_` and `\` match literally under `ESCAPE '\'`.
fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

struct RawAccount {
    id: String,
    first_name: String,
    last_name: String,
    email: String,
    mobile_no: String,
    address: Address,
    login_id: String,
    status: String,
    last_active: i64,
    created_at: i64,
    password_hash: String,
}

impl RawAccount {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            first_name: row.get(1)?,
            last_name: row.get(2)?,
            email: row.get(3)?,
            mobile_no: row.get(4)?,
            address: Address {
                street: row.get(5)?,
                city: row.get(6)?,
                state: row.get(7)?,
                country: row.get(8)?,
                pincode: row.get(9)?,
            },
            login_id: row.get(10)?,
            status: row.get(11)?,
            last_active: row.get(12)?,
            created_at: row.get(13)?,
            password_hash: row.get(14)?,
        })
    }

    fn into_account(self) -> Result<Account, DirectoryError> {
        let id = Uuid::parse_str(&self.id).map_err(|e| DirectoryError::Corrupt(e.to_string()))?;
        let status = self
            .status
            .parse::<Status>()
            .map_err(|e| DirectoryError::Corrupt(e.to_string()))?;
        Ok(Account {
            user: User {
                id,
                first_name: self.first_name,
                last_name: self.last_name,
                email: self.email,
                mobile_no: self.mobile_no,
                address: self.address,
                login_id: self.login_id,
                status,
                last_active: self.last_active,
                created_at: self.created_at,
            },
            password_hash: self.password_hash,
        })
    }
}

impl UserDirectory for SqliteDirectory {
    fn create(&self, account: NewAccount, at: i64) -> Result<Account, DirectoryError> {
        let email = account.email.to_lowercase();
        let conn = self.conn()?;
        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT email, login_id FROM users WHERE email = ?1 OR login_id = ?2 LIMIT 1",
                params![email, account.login_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((existing_email, _)) = existing {
            let field = if existing_email == email {
                UniqueField::Email
            } else {
                UniqueField::LoginId
            };
            return Err(DirectoryError::Duplicate(field));
        }
        let id = Uuid::new_v4();
        let res = conn.execute(
            "INSERT INTO users (id, first_name, last_name, email, mobile_no, street, city, state, country, pincode, login_id, password_hash, status, last_active, status_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 'offline', ?13, ?13, ?13)",
            params![
                id.to_string(),
                account.first_name,
                account.last_name,
                email,
                account.mobile_no,
                account.address.street,
                account.address.city,
                account.address.state,
                account.address.country,
                account.address.pincode,
                account.login_id,
                account.password_hash,
                at
            ],
        );
        match res {
            Ok(_) => Ok(Account {
                user: User {
                    id,
                    first_name: account.first_name,
                    last_name: account.last_name,
                    email,
                    mobile_no: account.mobile_no,
                    address: account.address,
                    login_id: account.login_id,
                    status: Status::Offline,
                    last_active: at,
                    created_at: at,
                },
                password_hash: account.password_hash,
            }),
            // lost a race against a concurrent registration
            Err(e)
                if matches!(
                    e.sqlite_error_code(),
                    Some(rusqlite::ErrorCode::ConstraintViolation)
                ) =>
            {
                let field = if e.to_string().contains("users.email") {
                    UniqueField::Email
                } else {
                    UniqueField::LoginId
                };
                Err(DirectoryError::Duplicate(field))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn find_by_id(&self, id: &Uuid) -> Result<Option<Account>, DirectoryError> {
        self.find_one("id", &id.to_string())
    }

    fn find_by_login(&self, login_id: &str) -> Result<Option<Account>, DirectoryError> {
        self.find_one("login_id", login_id)
    }

    fn find(&self, query: &UserQuery) -> Result<Vec<User>, DirectoryError> {
        let mut sql = format!("SELECT {ACCOUNT_COLUMNS} FROM users WHERE 1 = 1");
        let mut args: Vec<Value> = Vec::new();
        if let Some(status) = query.status {
            args.push(Value::Text(status.as_str().into()));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(before) = query.active_before {
            args.push(Value::Integer(before));
            sql.push_str(&format!(" AND last_active < ?{}", args.len()));
        }
        let search = query.search.as_deref().map(str::trim);
        if let Some(search) = search.filter(|s| !s.is_empty()) {
            args.push(Value::Text(format!("%{}%", escape_like(&search.to_lowercase()))));
            let n = args.len();
            sql.push_str(&format!(
                " AND (lower(first_name) LIKE ?{n} ESCAPE '\\' \
                 OR lower(last_name) LIKE ?{n} ESCAPE '\\' \
                 OR email LIKE ?{n} ESCAPE '\\')"
            ));
        }
        sql.push_str(" ORDER BY created_at, id");
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), RawAccount::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|raw| raw.into_account().map(|a| a.user))
            .collect()
    }

    fn count(&self) -> Result<u64, DirectoryError> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    fn update_status(&self, id: &Uuid, status: Status, at: i64) -> Result<bool, DirectoryError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE users SET status = ?2, last_active = MAX(last_active, ?3), status_at = ?3 \
             WHERE id = ?1 AND status_at <= ?3",
            params![id.to_string(), status.as_str(), at],
        )?;
        Ok(changed > 0)
    }

    fn touch(&self, id: &Uuid, at: i64) -> Result<bool, DirectoryError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE users SET last_active = MAX(last_active, ?2) WHERE id = ?1",
            params![id.to_string(), at],
        )?;
        Ok(changed > 0)
    }

    fn expire_if_stale(&self, id: &Uuid, cutoff: i64) -> Result<bool, DirectoryError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE users SET status = 'offline' WHERE id = ?1 AND status = 'online' AND last_active < ?2",
            params![id.to_string(), cutoff],
        )?;
        Ok(changed > 0)
    }
}
