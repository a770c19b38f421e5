use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::sluice::{
    auth::{
        AuthError, Authenticator, UserRecord, hash_password, validate_addresses, validate_new_user,
        validate_password,
    },
    telemetry,
};

#[derive(Clone)]
pub struct AdminState {
    pub prom: telemetry::SharedPrometheusHandle,
    /// Present when this process runs a tunnel server.
    pub sessions: Option<telemetry::SharedSessions>,
    pub auth: Option<Arc<Authenticator>>,
    pub config_path: PathBuf,
    pub reload_tx: watch::Sender<telemetry::ReloadSignal>,
}

type Shared = Arc<AdminState>;

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/sessions", get(sessions))
        .route("/reload", post(reload))
        .route("/config", get(config))
        .route("/users", get(users))
        .route("/users/{name}", get(user))
        .route("/user", post(add_user).put(update_user))
        .route("/user/{name}", get(user).delete(delete_user))
        .route("/authfile", post(authfile))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, state, shutdown).await
}

pub async fn serve_listener(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(admin_addr = %listener.local_addr()?, "admin: listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Shared>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

async fn sessions(State(st): State<Shared>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&st, &headers).await {
        return resp;
    }
    let snap = st
        .sessions
        .as_ref()
        .map(|s| s.snapshot())
        .unwrap_or_default();
    (StatusCode::OK, Json(snap)).into_response()
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    seq: u64,
}

async fn reload(State(st): State<Shared>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&st, &headers).await {
        return resp;
    }
    let mut next = (*st.reload_tx.borrow()).clone();
    next.next();
    let seq = next.seq;

    // Best-effort: if receivers are gone, still return OK.
    let _ = st.reload_tx.send(next);

    (StatusCode::OK, Json(ReloadResponse { seq })).into_response()
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    path: String,
}

async fn config(State(st): State<Shared>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&st, &headers).await {
        return resp;
    }
    (
        StatusCode::OK,
        Json(ConfigResponse {
            path: st.config_path.display().to_string(),
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct UserView {
    name: String,
    addresses: Vec<String>,
    admin: bool,
}

impl From<&UserRecord> for UserView {
    fn from(u: &UserRecord) -> Self {
        Self {
            name: u.name.clone(),
            addresses: u.addresses.iter().map(|p| p.as_str().to_string()).collect(),
            admin: u.admin,
        }
    }
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let v = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, encoded) = v.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let s = String::from_utf8(decoded).ok()?;
    let (user, pass) = s.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"sluice-admin\"")],
        "Authentication required\n",
    )
        .into_response()
}

/// An authenticated admin request.
struct Admin {
    auth: Arc<Authenticator>,
    name: String,
}

/// Admin users only. Open mode has no admins, so these endpoints are never public.
async fn require_admin(st: &AdminState, headers: &HeaderMap) -> Result<Admin, Response> {
    let Some(auth) = st.auth.clone() else {
        return Err(unauthorized());
    };
    let Some((user, pass)) = basic_credentials(headers) else {
        return Err(unauthorized());
    };
    let checker = auth.clone();
    let name = user.clone();
    let verdict = tokio::task::spawn_blocking(move || checker.authenticate_admin(&name, &pass))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())?;
    match verdict {
        Ok(_) => Ok(Admin { auth, name: user }),
        Err(err) => {
            tracing::warn!(user = %user, err = %err, "admin: authentication failed");
            Err(unauthorized())
        }
    }
}

async fn users(State(st): State<Shared>, headers: HeaderMap) -> Response {
    let admin = match require_admin(&st, &headers).await {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let store = admin.auth.store();
    let list: Vec<UserView> = store.iter().map(|u| UserView::from(u.as_ref())).collect();
    (StatusCode::OK, Json(list)).into_response()
}

async fn user(State(st): State<Shared>, Path(name): Path<String>, headers: HeaderMap) -> Response {
    let admin = match require_admin(&st, &headers).await {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    match admin.auth.store().get(&name) {
        Some(u) => (StatusCode::OK, Json(UserView::from(u.as_ref()))).into_response(),
        None => (StatusCode::NOT_FOUND, "User not found\n").into_response(),
    }
}

/// Body of `POST /user`, `PUT /user` and each entry of `POST /authfile`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UserRequest {
    name: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    addresses: Option<Vec<String>>,
    #[serde(default)]
    admin: bool,
}

impl UserRequest {
    fn validate(&self) -> Result<(), AuthError> {
        validate_new_user(
            &self.name,
            self.password.as_deref().unwrap_or(""),
            self.addresses.as_deref().unwrap_or(&[]),
        )
    }

    /// Hashes the password; call on the blocking pool.
    fn into_record(self) -> Result<UserRecord, AuthError> {
        let hash = hash_password(self.password.as_deref().unwrap_or(""))?;
        UserRecord::new(&self.name, &hash, &self.addresses.unwrap_or_default(), self.admin)
    }
}

fn bad_request(msg: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, format!("{}\n", msg.into())).into_response()
}

fn auth_failure(err: AuthError) -> Response {
    let status = match &err {
        AuthError::Duplicate(_) => StatusCode::CONFLICT,
        AuthError::NotFound(_) => StatusCode::NOT_FOUND,
        AuthError::Invalid(_)
        | AuthError::InvalidName(_)
        | AuthError::InvalidHash(_)
        | AuthError::Pattern { .. } => StatusCode::BAD_REQUEST,
        _ => {
            tracing::error!(err = %err, "admin: user update failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, format!("{err}\n")).into_response()
}

/// Hashing and the users file write both block.
async fn blocking<F>(f: F) -> Result<(), Response>
where
    F: FnOnce() -> Result<(), AuthError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())?
        .map_err(auth_failure)
}

async fn add_user(
    State(st): State<Shared>,
    headers: HeaderMap,
    Json(req): Json<UserRequest>,
) -> Response {
    let admin = match require_admin(&st, &headers).await {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    if let Err(err) = req.validate() {
        return auth_failure(err);
    }
    let name = req.name.clone();
    let auth = admin.auth.clone();
    if let Err(resp) = blocking(move || auth.add_user(req.into_record()?)).await {
        return resp;
    }
    tracing::info!(user = %name, by = %admin.name, "admin: user added");
    StatusCode::CREATED.into_response()
}

async fn update_user(
    State(st): State<Shared>,
    headers: HeaderMap,
    Json(req): Json<UserRequest>,
) -> Response {
    let admin = match require_admin(&st, &headers).await {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    if req.name == admin.name && !req.admin {
        return bad_request("Cannot revoke admin from yourself");
    }
    if let Some(pw) = req.password.as_deref() {
        if let Err(err) = validate_password(pw) {
            return auth_failure(err);
        }
    }
    if let Some(addrs) = req.addresses.as_deref() {
        if let Err(err) = validate_addresses(addrs) {
            return auth_failure(err);
        }
    }
    let name = req.name.clone();
    let auth = admin.auth.clone();
    let res = blocking(move || {
        let hash = req.password.as_deref().map(hash_password).transpose()?;
        auth.update_user(&req.name, hash.as_deref(), req.addresses.as_deref(), req.admin)
    })
    .await;
    if let Err(resp) = res {
        return resp;
    }
    tracing::info!(user = %name, by = %admin.name, "admin: user updated");
    StatusCode::ACCEPTED.into_response()
}

async fn delete_user(
    State(st): State<Shared>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let admin = match require_admin(&st, &headers).await {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    if name == admin.name {
        return bad_request("Cannot delete your own user");
    }
    let auth = admin.auth.clone();
    let target = name.clone();
    if let Err(resp) = blocking(move || auth.remove_user(&target)).await {
        return resp;
    }
    tracing::info!(user = %name, by = %admin.name, "admin: user deleted");
    StatusCode::ACCEPTED.into_response()
}

/// Replaces the whole users file. The requester must stay an admin in it.
async fn authfile(
    State(st): State<Shared>,
    headers: HeaderMap,
    Json(reqs): Json<Vec<UserRequest>>,
) -> Response {
    let admin = match require_admin(&st, &headers).await {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    if reqs.is_empty() {
        return bad_request("No users found in file");
    }
    for r in &reqs {
        if let Err(err) = r.validate() {
            return bad_request(format!("invalid user setting for {}: {err}", r.name));
        }
    }
    if !reqs.iter().any(|r| r.name == admin.name && r.admin) {
        return bad_request("file must include the current requesting user with admin permission");
    }
    let n = reqs.len();
    let auth = admin.auth.clone();
    let res = blocking(move || {
        let records = reqs
            .into_iter()
            .map(UserRequest::into_record)
            .collect::<Result<Vec<_>, _>>()?;
        auth.replace_users(records)
    })
    .await;
    if let Err(resp) = res {
        return resp;
    }
    tracing::info!(users = n, by = %admin.name, "admin: users file replaced");
    StatusCode::ACCEPTED.into_response()
}

#[cfg(test)]
mod tests {
    use metrics_exporter_prometheus::PrometheusBuilder;

    use super::*;
    use crate::sluice::auth::{UserStore, hash_password};

    async fn start(auth: Option<Arc<Authenticator>>) -> (String, watch::Receiver<telemetry::ReloadSignal>, watch::Sender<bool>) {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let (reload_tx, reload_rx) = watch::channel(telemetry::ReloadSignal::new());
        let state = AdminState {
            prom: Arc::new(handle),
            sessions: Some(Arc::new(telemetry::SessionRegistry::new())),
            auth,
            config_path: PathBuf::from("/etc/sluice/sluice.toml"),
            reload_tx,
        };
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", l.local_addr().unwrap());
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(serve_listener(l, state, stop_rx));
        (base, reload_rx, stop_tx)
    }

    fn users_auth() -> Arc<Authenticator> {
        let root = hash_password("root-pw").unwrap();
        let bob = hash_password("bob-pw").unwrap();
        let store = UserStore::from_records(vec![
            UserRecord::new("root", &root, &[".*".to_string()], true).unwrap(),
            UserRecord::new("bob", &bob, &["8080".to_string()], false).unwrap(),
        ])
        .unwrap();
        Arc::new(Authenticator::new(store))
    }

    #[tokio::test]
    async fn health_sessions_and_reload() {
        let (base, mut reload_rx, _stop) = start(Some(users_auth())).await;
        let http = reqwest::Client::new();

        let v: serde_json::Value = http
            .get(format!("{base}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(v["ok"], true);

        let v: serde_json::Value = http
            .get(format!("{base}/sessions"))
            .basic_auth("root", Some("root-pw"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(v, serde_json::json!([]));

        let r = http.get(format!("{base}/metrics")).send().await.unwrap();
        assert_eq!(r.status(), 200);

        let v: serde_json::Value = http
            .post(format!("{base}/reload"))
            .basic_auth("root", Some("root-pw"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(v["seq"], 1);
        reload_rx.changed().await.unwrap();
        assert_eq!(reload_rx.borrow().seq, 1);
    }

    #[tokio::test]
    async fn sessions_reload_and_config_need_an_admin() {
        let (base, reload_rx, _stop) = start(Some(users_auth())).await;
        let http = reqwest::Client::new();

        for (method, path) in [("GET", "/sessions"), ("POST", "/reload"), ("GET", "/config")] {
            let url = format!("{base}{path}");
            let req = match method {
                "POST" => http.post(&url),
                _ => http.get(&url),
            };
            assert_eq!(req.send().await.unwrap().status(), 401, "{path}");
            let req = match method {
                "POST" => http.post(&url),
                _ => http.get(&url),
            };
            let r = req.basic_auth("bob", Some("bob-pw")).send().await.unwrap();
            assert_eq!(r.status(), 401, "{path}");
        }
        assert_eq!(reload_rx.borrow().seq, 0);

        // no users file, no admins
        let (base, _reload, _stop) = start(None).await;
        let r = http.get(format!("{base}/sessions")).send().await.unwrap();
        assert_eq!(r.status(), 401);
    }

    #[tokio::test]
    async fn users_require_admin_basic_auth() {
        let (base, _reload, _stop) = start(Some(users_auth())).await;
        let http = reqwest::Client::new();

        let r = http.get(format!("{base}/users")).send().await.unwrap();
        assert_eq!(r.status(), 401);
        assert!(r.headers().contains_key("www-authenticate"));

        let r = http
            .get(format!("{base}/users"))
            .basic_auth("bob", Some("bob-pw"))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status(), 401);

        let r = http
            .get(format!("{base}/users"))
            .basic_auth("root", Some("root-pw"))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status(), 200);
        let body = r.text().await.unwrap();
        assert!(body.contains("\"bob\""));
        assert!(!body.contains("argon2"));

        let v: serde_json::Value = http
            .get(format!("{base}/users/bob"))
            .basic_auth("root", Some("root-pw"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(v["addresses"], serde_json::json!(["8080"]));
        assert_eq!(v["admin"], false);

        let r = http
            .get(format!("{base}/users/nobody"))
            .basic_auth("root", Some("root-pw"))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status(), 404);
    }

    #[tokio::test]
    async fn open_mode_never_lists_users() {
        let (base, _reload, _stop) = start(Some(Arc::new(Authenticator::new(UserStore::open())))).await;
        let r = reqwest::Client::new()
            .get(format!("{base}/users"))
            .basic_auth("anyone", Some("anything"))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status(), 401);
    }

    async fn send(
        http: &reqwest::Client,
        method: reqwest::Method,
        url: String,
        who: (&str, &str),
        body: Option<serde_json::Value>,
    ) -> reqwest::Response {
        let mut req = http.request(method, url).basic_auth(who.0, Some(who.1));
        if let Some(b) = body {
            req = req.json(&b);
        }
        req.send().await.unwrap()
    }

    #[tokio::test]
    async fn add_update_and_delete_users() {
        let auth = users_auth();
        let (base, _reload, _stop) = start(Some(auth.clone())).await;
        let http = reqwest::Client::new();
        let root = ("root", "root-pw");
        let user = format!("{base}/user");

        let carol = serde_json::json!({
            "name": "carol",
            "password": "carol-password",
            "addresses": ["5432"],
        });
        let r = send(&http, reqwest::Method::POST, user.clone(), root, Some(carol.clone())).await;
        assert_eq!(r.status(), 201);
        assert!(auth.authenticate("carol", "carol-password").is_ok());

        let r = send(&http, reqwest::Method::POST, user.clone(), root, Some(carol)).await;
        assert_eq!(r.status(), 409);

        // non-admins can't manage users
        let dave = serde_json::json!({
            "name": "dave",
            "password": "dave-password",
            "addresses": [".*"],
        });
        let r = send(&http, reqwest::Method::POST, user.clone(), ("bob", "bob-pw"), Some(dave)).await;
        assert_eq!(r.status(), 401);

        let promote = serde_json::json!({ "name": "carol", "admin": true });
        let r = send(&http, reqwest::Method::PUT, user.clone(), root, Some(promote)).await;
        assert_eq!(r.status(), 202);
        let carol = auth.authenticate_admin("carol", "carol-password").unwrap();
        assert_eq!(carol.addresses[0].as_str(), "5432");

        let ghost = serde_json::json!({ "name": "ghost", "admin": false });
        let r = send(&http, reqwest::Method::PUT, user.clone(), root, Some(ghost)).await;
        assert_eq!(r.status(), 404);

        let r = send(&http, reqwest::Method::DELETE, format!("{user}/bob"), root, None).await;
        assert_eq!(r.status(), 202);
        assert!(auth.store().get("bob").is_none());
        let r = send(&http, reqwest::Method::DELETE, format!("{user}/bob"), root, None).await;
        assert_eq!(r.status(), 404);
    }

    #[tokio::test]
    async fn admins_cannot_lock_themselves_out() {
        let auth = users_auth();
        let (base, _reload, _stop) = start(Some(auth.clone())).await;
        let http = reqwest::Client::new();
        let root = ("root", "root-pw");

        let demote = serde_json::json!({ "name": "root", "admin": false });
        let r = send(&http, reqwest::Method::PUT, format!("{base}/user"), root, Some(demote)).await;
        assert_eq!(r.status(), 400);
        assert!(r.text().await.unwrap().contains("revoke admin"));

        let r = send(&http, reqwest::Method::DELETE, format!("{base}/user/root"), root, None).await;
        assert_eq!(r.status(), 400);
        assert!(r.text().await.unwrap().contains("own user"));

        // an uploaded users file must keep the requester as an admin
        let without_root = serde_json::json!([
            { "name": "eve", "password": "eve-password", "addresses": [".*"], "admin": true },
        ]);
        let r = send(&http, reqwest::Method::POST, format!("{base}/authfile"), root, Some(without_root)).await;
        assert_eq!(r.status(), 400);
        let root_not_admin = serde_json::json!([
            { "name": "root", "password": "root-password", "addresses": [".*"] },
        ]);
        let r = send(&http, reqwest::Method::POST, format!("{base}/authfile"), root, Some(root_not_admin)).await;
        assert_eq!(r.status(), 400);
        let r = send(&http, reqwest::Method::POST, format!("{base}/authfile"), root, Some(serde_json::json!([]))).await;
        assert_eq!(r.status(), 400);

        assert!(auth.authenticate_admin("root", "root-pw").is_ok());
        assert!(auth.store().get("bob").is_some());
    }

    #[tokio::test]
    async fn authfile_replaces_every_user() {
        let auth = users_auth();
        let (base, _reload, _stop) = start(Some(auth.clone())).await;
        let http = reqwest::Client::new();
        let body = serde_json::json!([
            { "name": "root", "password": "new-root-pw", "addresses": [".*"], "admin": true },
            { "name": "frank", "password": "frank-password", "addresses": ["22", "80"] },
        ]);
        let r = send(&http, reqwest::Method::POST, format!("{base}/authfile"), ("root", "root-pw"), Some(body)).await;
        assert_eq!(r.status(), 202);
        assert!(auth.store().get("bob").is_none());
        assert!(auth.authenticate_admin("root", "new-root-pw").is_ok());
        assert!(auth.authenticate("frank", "frank-password").is_ok());
    }

    #[tokio::test]
    async fn new_users_are_validated() {
        let (base, _reload, _stop) = start(Some(users_auth())).await;
        let http = reqwest::Client::new();
        let root = ("root", "root-pw");
        let cases = [
            serde_json::json!({ "name": "bad-name", "password": "longenough", "addresses": [".*"] }),
            serde_json::json!({ "name": "short", "password": "1234567", "addresses": [".*"] }),
            serde_json::json!({ "name": "noaddr", "password": "longenough", "addresses": [] }),
            serde_json::json!({ "name": "nopass", "addresses": [".*"] }),
            serde_json::json!({ "name": "badre", "password": "longenough", "addresses": ["(open"] }),
        ];
        for body in cases {
            let r = send(&http, reqwest::Method::POST, format!("{base}/user"), root, Some(body.clone())).await;
            assert_eq!(r.status(), 400, "{body}");
        }

        let short = serde_json::json!({ "name": "bob", "password": "short", "admin": false });
        let r = send(&http, reqwest::Method::PUT, format!("{base}/user"), root, Some(short)).await;
        assert_eq!(r.status(), 400);
    }

    #[test]
    fn basic_header_parsing() {
        let mut h = HeaderMap::new();
        let enc = base64::engine::general_purpose::STANDARD.encode("alice:pa:ss");
        h.insert(header::AUTHORIZATION, format!("basic {enc}").parse().unwrap());
        assert_eq!(
            basic_credentials(&h),
            Some(("alice".to_string(), "pa:ss".to_string()))
        );
        h.insert(header::AUTHORIZATION, "Bearer xyz".parse().unwrap());
        assert_eq!(basic_credentials(&h), None);
    }
}
