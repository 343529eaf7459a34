pub use presence_api::{Address, Status, User};
use std::sync::atomic::{AtomicI64, Ordering};
use time::OffsetDateTime;
use uuid::Uuid;

/// A stored account: the public user plus its credential hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub user: User,
    pub password_hash: String,
}

impl Account {
    pub fn id(&self) -> Uuid {
        self.user.id
    }
}

/// Profile data for a new account, already validated and hashed.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub mobile_no: String,
    pub address: Address,
    pub login_id: String,
    pub password_hash: String,
}

/// Filter for directory lookups. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct UserQuery {
    pub status: Option<Status>,
    /// Only users whose `last_active` is strictly older than this.
    pub active_before: Option<i64>,
    /// Case-insensitive substring over first name, last name and email.
    pub search: Option<String>,
}

static LAST_STAMP: AtomicI64 = AtomicI64::new(i64::MIN);

/// Current wall clock in unix milliseconds. Never less than an earlier
/// call, so status stamps keep moving forward if the system clock steps back.
pub fn now_ms() -> i64 {
    let wall = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
    advance(&LAST_STAMP, wall)
}

fn advance(last: &AtomicI64, wall: i64) -> i64 {
    last.fetch_max(wall, Ordering::Relaxed).max(wall)
}
