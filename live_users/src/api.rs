use crate::{
    auth,
    config::Config,
    db,
    directory::{blocking, SqliteDirectory, UserDirectory},
    engine::{Outcome, PresenceEngine},
    error::ApiError,
    fanout::Fanout,
    model::{Address, NewAccount, Status, User, UserQuery},
    registry::SessionRegistry,
    validation::{validate_registration, RegisterReq},
    ws::ws_handler,
};
use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{StatusCode, Uri},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use uuid::Uuid;

/// Shared handles for every request and realtime connection.
#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<dyn UserDirectory>,
    pub engine: PresenceEngine,
    pub config: Config,
}

impl AppState {
    /// Open the on-disk directory under `config.data_dir` and start the engine.
    pub async fn new(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let pool = db::open_pool(config.database_path())?;
        Ok(Self::with_directory(
            config,
            Arc::new(SqliteDirectory::new(pool)),
        ))
    }

    /// Start the engine over an existing directory. Must run inside a tokio runtime.
    pub fn with_directory(config: Config, directory: Arc<dyn UserDirectory>) -> Self {
        let engine = PresenceEngine::spawn(
            directory.clone(),
            Arc::new(SessionRegistry::new()),
            Fanout::new(),
            config.presence.engine_settings(),
        );
        Self {
            directory,
            engine,
            config,
        }
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/users", get(list_users).post(register))
        .route("/users/login", post(login))
        .route("/users/offline", post(mark_offline))
        .route("/users/:id", get(get_user))
        .route("/ws", get(ws_handler))
        .fallback(not_found)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn not_found(uri: Uri) -> ApiError {
    tracing::debug!(%uri, "no route");
    ApiError::NotFound("Route not found")
}

#[derive(Deserialize, Default)]
struct ListParams {
    q: Option<String>,
    status: Option<String>,
}

#[derive(Serialize)]
struct UsersResp {
    success: bool,
    users: Vec<User>,
    total: u64,
}

async fn list_users(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<UsersResp>, ApiError> {
    let status = match params.status.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => Some(
            s.parse::<Status>()
                .map_err(|e| ApiError::BadRequest(e.to_string()))?,
        ),
        None => None,
    };
    let query = UserQuery {
        status,
        active_before: None,
        search: params.q,
    };
    let (users, total) =
        blocking(&state.directory, move |d| Ok((d.find(&query)?, d.count()?))).await?;
    Ok(Json(UsersResp {
        success: true,
        users,
        total,
    }))
}

#[derive(Serialize)]
struct UserResp {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
    user: User,
}

async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UserResp>, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::NotFound("User not found"))?;
    let user = load_user(&state, id).await?;
    Ok(Json(UserResp {
        success: true,
        message: None,
        user,
    }))
}

async fn load_user(state: &AppState, id: Uuid) -> Result<User, ApiError> {
    blocking(&state.directory, move |d| d.find_by_id(&id))
        .await?
        .map(|a| a.user)
        .ok_or(ApiError::NotFound("User not found"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginReq {
    login_id: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    body: Result<Json<LoginReq>, JsonRejection>,
) -> Result<Json<UserResp>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let account = auth::authenticate(&state.directory, &req.login_id, &req.password).await?;
    let id = account.id();
    if state.engine.login(id, None).await == Outcome::Failed {
        return Err(ApiError::Internal("Login failed".into()));
    }
    let user = load_user(&state, id).await?;
    Ok(Json(UserResp {
        success: true,
        message: Some("Login successful"),
        user,
    }))
}

async fn register(
    State(state): State<AppState>,
    body: Result<Json<RegisterReq>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    validate_registration(&req).map_err(ApiError::Validation)?;
    let password_hash = auth::hash_password_blocking(req.password).await?;
    let account = NewAccount {
        first_name: req.first_name.trim().to_string(),
        last_name: req.last_name.trim().to_string(),
        email: req.email.trim().to_string(),
        mobile_no: req.mobile_no.trim().to_string(),
        address: Address {
            street: req.street,
            city: req.city,
            state: req.state,
            country: req.country,
            pincode: req.pincode,
        },
        login_id: req.login_id.trim().to_string(),
        password_hash,
    };
    let at = crate::model::now_ms();
    let id = blocking(&state.directory, move |d| d.create(account, at))
        .await?
        .id();
    tracing::info!(user_id = %id, "user registered");
    // the account exists either way; a failed presence write is already logged
    if state.engine.register(id, None).await == Outcome::Failed {
        tracing::warn!(user_id = %id, "registered user left offline");
    }
    let user = load_user(&state, id).await?;
    Ok((
        StatusCode::CREATED,
        Json(UserResp {
            success: true,
            message: Some("User registered successfully"),
            user,
        }),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfflineReq {
    user_id: Uuid,
}

/// Page-unload beacon. Browsers send it as text/plain, so the body is
/// parsed by hand rather than through the `Json` extractor.
async fn mark_offline(
    State(state): State<AppState>,
    body: String,
) -> Result<StatusCode, ApiError> {
    let req: OfflineReq = serde_json::from_str(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid offline request: {e}")))?;
    match state.engine.mark_offline(req.user_id).await {
        Outcome::Failed => Err(ApiError::Internal("Error updating offline status".into())),
        Outcome::Applied | Outcome::Ignored => Ok(StatusCode::OK),
    }
}

/// Run the HTTP server with the resolved configuration.
pub async fn run_http_server(config: Config) -> Result<()> {
    let addr: SocketAddr = config.bind.parse()?;
    let state = AppState::new(config).await?;
    tracing::info!(%addr, "listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::PresenceConfig, error::DirectoryError, model::Account};
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    fn config() -> Config {
        Config {
            bind: "127.0.0.1:0".into(),
            data_dir: std::env::temp_dir(),
            logging_enabled: false,
            presence: PresenceConfig::default(),
        }
    }

    fn state() -> AppState {
        let pool = db::memory_pool().unwrap();
        AppState::with_directory(config(), Arc::new(SqliteDirectory::new(pool)))
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let app = build_router(state());
        let resp = app
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let v = body_json(resp).await;
        assert_eq!(v["success"], false);
        assert_eq!(v["message"], "Route not found");
    }

    #[tokio::test]
    async fn beacon_accepts_text_plain() {
        let state = state();
        let id = state
            .directory
            .create(
                crate::directory::tests::new_account("ada"),
                crate::model::now_ms(),
            )
            .unwrap()
            .id();
        state.engine.update_status(id, Status::Online).await;
        let app = build_router(state.clone());
        let resp = app
            .oneshot(
                Request::post("/users/offline")
                    .header("content-type", "text/plain;charset=UTF-8")
                    .body(Body::from(format!(r#"{{"userId":"{id}"}}"#)))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let user = state.directory.find_by_id(&id).unwrap().unwrap().user;
        assert_eq!(user.status, Status::Offline);
    }

    /// Stores accounts but fails every presence write.
    struct NoPresenceWrites(SqliteDirectory);

    impl UserDirectory for NoPresenceWrites {
        fn create(&self, a: NewAccount, at: i64) -> Result<Account, DirectoryError> {
            self.0.create(a, at)
        }
        fn find_by_id(&self, id: &Uuid) -> Result<Option<Account>, DirectoryError> {
            self.0.find_by_id(id)
        }
        fn find_by_login(&self, login_id: &str) -> Result<Option<Account>, DirectoryError> {
            self.0.find_by_login(login_id)
        }
        fn find(&self, query: &UserQuery) -> Result<Vec<User>, DirectoryError> {
            self.0.find(query)
        }
        fn count(&self) -> Result<u64, DirectoryError> {
            self.0.count()
        }
        fn update_status(&self, _: &Uuid, _: Status, _: i64) -> Result<bool, DirectoryError> {
            Err(DirectoryError::Unavailable("down".into()))
        }
        fn touch(&self, _: &Uuid, _: i64) -> Result<bool, DirectoryError> {
            Err(DirectoryError::Unavailable("down".into()))
        }
        fn expire_if_stale(&self, _: &Uuid, _: i64) -> Result<bool, DirectoryError> {
            Err(DirectoryError::Unavailable("down".into()))
        }
    }

    fn registration_body(login: &str) -> Body {
        Body::from(
            serde_json::json!({
                "firstName": "Ada",
                "lastName": "Lovelace",
                "email": format!("{login}@example.com"),
                "mobileNo": "5551234567",
                "street": "1 Main St",
                "city": "London",
                "state": "LDN",
                "country": "UK",
                "pincode": "N1",
                "loginId": login,
                "password": "secret123"
            })
            .to_string(),
        )
    }

    #[tokio::test]
    async fn registration_survives_failed_presence_write() {
        let pool = db::memory_pool().unwrap();
        let state = AppState::with_directory(
            config(),
            Arc::new(NoPresenceWrites(SqliteDirectory::new(pool))),
        );
        let app = build_router(state.clone());

        let resp = app
            .clone()
            .oneshot(
                Request::post("/users")
                    .header("content-type", "application/json")
                    .body(registration_body("ada"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let v = body_json(resp).await;
        assert_eq!(v["success"], true);
        assert_eq!(v["user"]["loginId"], "ada");
        assert_eq!(v["user"]["status"], "offline");
        assert_eq!(state.directory.count().unwrap(), 1);

        // login still authenticates; the presence failure surfaces as 500
        let resp = app
            .oneshot(
                Request::post("/users/login")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"loginId":"ada","password":"secret123"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await["success"], false);
    }

    #[tokio::test]
    async fn bad_status_filter_is_rejected() {
        let app = build_router(state());
        let resp = app
            .oneshot(
                Request::get("/users?status=away")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
