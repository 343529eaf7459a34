use live_users::{
    api::{build_router, AppState},
    config::{Config, PresenceConfig},
};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::net::{SocketAddr, TcpListener};
use tokio::task::JoinHandle;

async fn spawn_server() -> (SocketAddr, JoinHandle<()>, AppState, tempfile::TempDir) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        bind: addr.to_string(),
        data_dir: tmp.path().to_path_buf(),
        logging_enabled: false,
        presence: PresenceConfig::default(),
    };
    let state = AppState::new(config).await.unwrap();
    let app = build_router(state.clone());
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, server, state, tmp)
}

fn registration(login: &str, email: &str) -> Value {
    json!({
        "firstName": "Ada",
        "lastName": "Lovelace",
        "email": email,
        "mobileNo": "5551234567",
        "street": "1 Main St",
        "city": "London",
        "state": "LDN",
        "country": "UK",
        "pincode": "N1",
        "loginId": login,
        "password": "secret123"
    })
}

#[tokio::test]
async fn health_and_unknown_route() {
    let (addr, server, _state, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("http://{}/health", addr)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "ok");

    let resp = client.get(format!("http://{}/api/nope", addr)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let v: Value = resp.json().await.unwrap();
    assert_eq!(v, json!({"success": false, "message": "Route not found"}));

    server.abort();
}

#[tokio::test]
async fn register_login_and_list() {
    let (addr, server, _state, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{}/users", addr))
        .json(&registration("ada", "Ada@Example.com"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let v: Value = resp.json().await.unwrap();
    assert_eq!(v["success"], true);
    assert_eq!(v["message"], "User registered successfully");
    assert_eq!(v["user"]["status"], "online");
    assert_eq!(v["user"]["email"], "ada@example.com");
    assert_eq!(v["user"]["address"]["city"], "London");
    assert!(v["user"].get("password").is_none());
    assert!(v["user"].get("passwordHash").is_none());
    let id = v["user"]["id"].as_str().unwrap().to_string();

    let resp = client
        .post(format!("http://{}/users/login", addr))
        .json(&json!({"loginId": "ada", "password": "secret123"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let v: Value = resp.json().await.unwrap();
    assert_eq!(v["message"], "Login successful");
    assert_eq!(v["user"]["id"], id);

    let resp = client
        .post(format!("http://{}/users/login", addr))
        .json(&json!({"loginId": "ada", "password": "wrong"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let v: Value = resp.json().await.unwrap();
    assert_eq!(v["success"], false);
    assert_eq!(v["message"], "Invalid login credentials");

    client
        .post(format!("http://{}/users", addr))
        .json(&registration("grace", "grace@example.com"))
        .send()
        .await
        .unwrap();

    let v: Value = client
        .get(format!("http://{}/users", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(v["success"], true);
    assert_eq!(v["total"], 2);
    assert_eq!(v["users"].as_array().unwrap().len(), 2);

    let v: Value = client
        .get(format!("http://{}/users?q=grace", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(v["users"].as_array().unwrap().len(), 1);
    assert_eq!(v["total"], 2);

    let v: Value = client
        .get(format!("http://{}/users/{}", addr, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(v["user"]["loginId"], "ada");

    let resp = client
        .get(format!("http://{}/users/{}", addr, uuid::Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let v: Value = resp.json().await.unwrap();
    assert_eq!(v["message"], "User not found");

    server.abort();
}

#[tokio::test]
async fn registration_rejects_bad_and_duplicate_input() {
    let (addr, server, _state, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{}/users", addr))
        .json(&json!({"firstName": "Ada", "email": "nope"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let v: Value = resp.json().await.unwrap();
    assert_eq!(v["message"], "Validation Error");
    let errors = v["errors"].as_array().unwrap();
    assert!(errors.contains(&json!("Login ID is required")));
    assert!(errors.contains(&json!("Email is invalid")));

    client
        .post(format!("http://{}/users", addr))
        .json(&registration("ada", "ada@example.com"))
        .send()
        .await
        .unwrap();

    let resp = client
        .post(format!("http://{}/users", addr))
        .json(&registration("other", "ADA@example.com"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let v: Value = resp.json().await.unwrap();
    assert_eq!(v["message"], "Email already registered");

    let resp = client
        .post(format!("http://{}/users", addr))
        .json(&registration("ada", "new@example.com"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let v: Value = resp.json().await.unwrap();
    assert_eq!(v["message"], "Login ID already taken");

    let v: Value = client
        .get(format!("http://{}/users", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(v["total"], 1);

    server.abort();
}

#[tokio::test]
async fn offline_beacon_marks_user_offline() {
    let (addr, server, _state, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();

    let v: Value = client
        .post(format!("http://{}/users", addr))
        .json(&registration("ada", "ada@example.com"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = v["user"]["id"].as_str().unwrap().to_string();

    let resp = client
        .post(format!("http://{}/users/offline", addr))
        .header("content-type", "text/plain;charset=UTF-8")
        .body(json!({ "userId": id }).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let v: Value = client
        .get(format!("http://{}/users?status=offline", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(v["users"][0]["id"], id);

    let resp = client
        .post(format!("http://{}/users/offline", addr))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    server.abort();
}

#[tokio::test]
async fn accounts_survive_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        bind: "127.0.0.1:0".into(),
        data_dir: tmp.path().join("data"),
        logging_enabled: false,
        presence: PresenceConfig::default(),
    };
    {
        let state = AppState::new(config.clone()).await.unwrap();
        let account = live_users::model::NewAccount {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: "ada@example.com".into(),
            mobile_no: "5551234567".into(),
            address: Default::default(),
            login_id: "ada".into(),
            password_hash: "hash".into(),
        };
        state.directory.create(account, 1).unwrap();
    }
    let state = AppState::new(config).await.unwrap();
    assert!(state.directory.find_by_login("ada").unwrap().is_some());
    assert_eq!(state.directory.count().unwrap(), 1);
}
