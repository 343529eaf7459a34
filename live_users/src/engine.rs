//! Presence reconciliation.
//!
//! Every presence event is routed to the partition worker owning its user id
//! and applied there to completion before that worker takes its next event.
//! Events for one user are therefore applied in submission order, while
//! different users proceed in parallel. Storage failures are logged and
//! reported as [`Outcome::Failed`]; they never stop a worker.

use crate::{
    directory::{blocking, UserDirectory},
    fanout::Fanout,
    model::{now_ms, Status, UserQuery},
    registry::{ConnectionId, SessionRegistry},
};
use futures::future::join_all;
use presence_api::ServerEvent;
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of one presence event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// State was written and fanned out.
    Applied,
    /// Nothing to do: superseded session, unknown user, or already handled.
    Ignored,
    /// The directory write failed; logged and swallowed.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnlineReason {
    Login,
    Connect,
    Registered,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub partitions: usize,
    /// Online users idle longer than this are expired by a sweep.
    pub stale_after: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            partitions: 4,
            stale_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
enum Command {
    Online {
        conn: Option<ConnectionId>,
        reason: OnlineReason,
    },
    Heartbeat {
        conn: ConnectionId,
    },
    Disconnect {
        conn: ConnectionId,
    },
    ConnectionClosed {
        conn: ConnectionId,
    },
    SetStatus {
        status: Status,
    },
    ForceOffline,
    Expire {
        cutoff: i64,
        last_active: i64,
    },
}

struct Job {
    user: Uuid,
    command: Command,
    done: oneshot::Sender<Outcome>,
}

/// How an offline transition is announced.
#[derive(Clone, Copy)]
enum Notice {
    StatusUpdate,
    Offline,
}

/// Handle to the presence engine. Cheap to clone.
#[derive(Clone)]
pub struct PresenceEngine {
    inner: Arc<Inner>,
}

struct Inner {
    partitions: Vec<mpsc::UnboundedSender<Job>>,
    registry: Arc<SessionRegistry>,
    directory: Arc<dyn UserDirectory>,
    fanout: Fanout,
    stale_after: Duration,
}

impl PresenceEngine {
    /// Start the partition workers. They stop once every handle is dropped.
    pub fn spawn(
        directory: Arc<dyn UserDirectory>,
        registry: Arc<SessionRegistry>,
        fanout: Fanout,
        settings: EngineSettings,
    ) -> Self {
        let partitions = (0..settings.partitions.max(1))
            .map(|idx| {
                let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
                let worker = Reconciler {
                    registry: registry.clone(),
                    directory: directory.clone(),
                    fanout: fanout.clone(),
                };
                tokio::spawn(async move {
                    while let Some(job) = rx.recv().await {
                        let outcome = worker.apply(job.user, job.command).await;
                        // the caller may have gone away; the write stands regardless
                        let _ = job.done.send(outcome);
                    }
                    debug!(partition = idx, "presence partition stopped");
                });
                tx
            })
            .collect();
        Self {
            inner: Arc::new(Inner {
                partitions,
                registry,
                directory,
                fanout,
                stale_after: settings.stale_after,
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn fanout(&self) -> &Fanout {
        &self.inner.fanout
    }

    pub fn stale_after(&self) -> Duration {
        self.inner.stale_after
    }

    /// Credentials were verified. `conn` is set when the login came over the
    /// realtime channel.
    pub async fn login(&self, user: Uuid, conn: Option<ConnectionId>) -> Outcome {
        self.submit(
            user,
            Command::Online {
                conn,
                reason: OnlineReason::Login,
            },
        )
        .await
    }

    /// A connection announced which user it belongs to.
    pub async fn connect(&self, user: Uuid, conn: ConnectionId) -> Outcome {
        self.submit(
            user,
            Command::Online {
                conn: Some(conn),
                reason: OnlineReason::Connect,
            },
        )
        .await
    }

    /// A new account exists. Also announces the account to every client.
    pub async fn register(&self, user: Uuid, conn: Option<ConnectionId>) -> Outcome {
        self.submit(
            user,
            Command::Online {
                conn,
                reason: OnlineReason::Registered,
            },
        )
        .await
    }

    pub async fn heartbeat(&self, user: Uuid, conn: ConnectionId) -> Outcome {
        self.submit(user, Command::Heartbeat { conn }).await
    }

    /// Explicit disconnect sent over `conn`. Ignored when the user is bound
    /// to a different, newer connection.
    pub async fn disconnect(&self, user: Uuid, conn: ConnectionId) -> Outcome {
        self.submit(user, Command::Disconnect { conn }).await
    }

    /// Client-requested status change.
    pub async fn update_status(&self, user: Uuid, status: Status) -> Outcome {
        self.submit(user, Command::SetStatus { status }).await
    }

    /// Unconditional offline, used outside the realtime channel.
    pub async fn mark_offline(&self, user: Uuid) -> Outcome {
        self.submit(user, Command::ForceOffline).await
    }

    /// The transport under `conn` closed.
    pub async fn connection_closed(&self, conn: ConnectionId) -> Outcome {
        match self.inner.registry.find_user_by_connection(conn) {
            Some(user) => self.submit(user, Command::ConnectionClosed { conn }).await,
            None => Outcome::Ignored,
        }
    }

    /// Expire stale online users. Returns how many went offline.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(now_ms()).await
    }

    /// Expire users online and idle for longer than the threshold as of `now`.
    pub async fn sweep_at(&self, now: i64) -> usize {
        let cutoff = now - self.inner.stale_after.as_millis() as i64;
        let query = UserQuery {
            status: Some(Status::Online),
            active_before: Some(cutoff),
            ..Default::default()
        };
        let stale = match blocking(&self.inner.directory, move |d| d.find(&query)).await {
            Ok(users) => users,
            Err(e) => {
                error!(error = %e, "staleness sweep failed");
                return 0;
            }
        };
        let outcomes = join_all(stale.into_iter().map(|user| {
            self.submit(
                user.id,
                Command::Expire {
                    cutoff,
                    last_active: user.last_active,
                },
            )
        }))
        .await;
        outcomes
            .into_iter()
            .filter(|o| *o == Outcome::Applied)
            .count()
    }

    async fn submit(&self, user: Uuid, command: Command) -> Outcome {
        let partitions = &self.inner.partitions;
        let idx = (user.as_u128() % partitions.len() as u128) as usize;
        let (done, rx) = oneshot::channel();
        if partitions[idx].send(Job { user, command, done }).is_err() {
            error!(user_id = %user, partition = idx, "presence partition is gone");
            return Outcome::Failed;
        }
        rx.await.unwrap_or(Outcome::Failed)
    }
}

/// Applies events for the users of one partition.
struct Reconciler {
    registry: Arc<SessionRegistry>,
    directory: Arc<dyn UserDirectory>,
    fanout: Fanout,
}

impl Reconciler {
    async fn apply(&self, user: Uuid, command: Command) -> Outcome {
        match command {
            Command::Online { conn, reason } => self.online(user, conn, reason).await,
            Command::Heartbeat { conn } => self.heartbeat(user, conn).await,
            Command::Disconnect { conn } => {
                match self.registry.connection_for(&user) {
                    Some(bound) if bound != conn => {
                        debug!(
                            user_id = %user,
                            conn_id = %conn,
                            bound = %bound,
                            "disconnect from superseded connection"
                        );
                        return Outcome::Ignored;
                    }
                    Some(_) => {
                        self.registry.unbind(&user);
                    }
                    None => {}
                }
                self.offline(user, Notice::StatusUpdate).await
            }
            Command::ConnectionClosed { conn } => {
                if !self.registry.unbind_if(&user, conn) {
                    debug!(user_id = %user, conn_id = %conn, "close already handled");
                    return Outcome::Ignored;
                }
                self.offline(user, Notice::StatusUpdate).await
            }
            Command::SetStatus { status } => self.set_status(user, status).await,
            Command::ForceOffline => {
                self.registry.unbind(&user);
                self.offline(user, Notice::Offline).await
            }
            Command::Expire {
                cutoff,
                last_active,
            } => self.expire(user, cutoff, last_active).await,
        }
    }

    async fn online(
        &self,
        user: Uuid,
        conn: Option<ConnectionId>,
        reason: OnlineReason,
    ) -> Outcome {
        let outcome = self.set_status(user, Status::Online).await;
        // an unknown user must not take over the connection
        if let Some(conn) = conn {
            if outcome != Outcome::Ignored || self.exists(user).await {
                if let Some(old) = self.registry.bind(user, conn) {
                    debug!(
                        user_id = %user,
                        conn_id = %conn,
                        superseded = %old,
                        "session superseded"
                    );
                }
            }
        }
        if outcome == Outcome::Applied {
            info!(user_id = %user, ?reason, "user online");
            if reason == OnlineReason::Registered {
                self.announce_new_user(user).await;
            }
        }
        outcome
    }

    /// Lookup failures count as existing; the binding is kept.
    async fn exists(&self, user: Uuid) -> bool {
        match blocking(&self.directory, move |d| d.find_by_id(&user)).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                error!(user_id = %user, error = %e, "user lookup failed");
                true
            }
        }
    }

    async fn announce_new_user(&self, user: Uuid) {
        match blocking(&self.directory, move |d| d.find_by_id(&user)).await {
            Ok(Some(account)) => {
                self.fanout.publish(ServerEvent::NewUserRegistered {
                    user_data: account.user,
                });
            }
            Ok(None) => warn!(user_id = %user, "registered user vanished"),
            Err(e) => error!(user_id = %user, error = %e, "loading registered user failed"),
        }
    }

    async fn heartbeat(&self, user: Uuid, conn: ConnectionId) -> Outcome {
        if !self.registry.is_bound(&user, conn) {
            debug!(user_id = %user, conn_id = %conn, "heartbeat without session");
            return Outcome::Ignored;
        }
        let at = now_ms();
        match blocking(&self.directory, move |d| d.touch(&user, at)).await {
            Ok(true) => Outcome::Applied,
            Ok(false) => Outcome::Ignored,
            Err(e) => {
                error!(user_id = %user, error = %e, "presence write failed");
                Outcome::Failed
            }
        }
    }

    async fn set_status(&self, user: Uuid, status: Status) -> Outcome {
        let at = now_ms();
        match blocking(&self.directory, move |d| d.update_status(&user, status, at)).await {
            Ok(true) => {
                self.fanout.publish(ServerEvent::StatusUpdate {
                    user_id: user,
                    status,
                    last_active: at,
                });
                Outcome::Applied
            }
            Ok(false) => {
                warn!(
                    user_id = %user,
                    %status,
                    "status write skipped: unknown user or newer write"
                );
                Outcome::Ignored
            }
            Err(e) => {
                error!(user_id = %user, %status, error = %e, "presence write failed");
                Outcome::Failed
            }
        }
    }

    async fn offline(&self, user: Uuid, notice: Notice) -> Outcome {
        let at = now_ms();
        let write = blocking(&self.directory, move |d| {
            d.update_status(&user, Status::Offline, at)
        });
        match write.await {
            Ok(true) => {
                let event = match notice {
                    Notice::StatusUpdate => ServerEvent::StatusUpdate {
                        user_id: user,
                        status: Status::Offline,
                        last_active: at,
                    },
                    Notice::Offline => ServerEvent::Offline { user_id: user },
                };
                self.fanout.publish(event);
                info!(user_id = %user, "user offline");
                Outcome::Applied
            }
            Ok(false) => Outcome::Ignored,
            Err(e) => {
                error!(user_id = %user, error = %e, "presence write failed");
                Outcome::Failed
            }
        }
    }

    async fn expire(&self, user: Uuid, cutoff: i64, last_active: i64) -> Outcome {
        match blocking(&self.directory, move |d| d.expire_if_stale(&user, cutoff)).await {
            Ok(true) => {
                self.fanout.publish(ServerEvent::StatusUpdate {
                    user_id: user,
                    status: Status::Offline,
                    last_active,
                });
                info!(user_id = %user, last_active, "stale user expired");
                Outcome::Applied
            }
            // refreshed or already offline since the scan
            Ok(false) => Outcome::Ignored,
            Err(e) => {
                error!(user_id = %user, error = %e, "presence write failed");
                Outcome::Failed
            }
        }
    }
}
