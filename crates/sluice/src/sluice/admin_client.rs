//! Client side of the admin API, behind `sluice admin`.

use std::{fmt::Write as _, path::Path, time::Duration};

use anyhow::Context;
use reqwest::Method;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub addresses: Vec<String>,
    pub admin: bool,
}

/// Body for creating or changing a user. `None` fields are left to the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserChange {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub addresses: Option<Vec<String>>,
    #[serde(default)]
    pub admin: bool,
}

pub struct AdminClient {
    http: reqwest::Client,
    base: reqwest::Url,
    user: String,
    password: String,
}

/// `host:port` means plain http; the admin listener does not terminate TLS.
fn base_url(server: &str) -> anyhow::Result<reqwest::Url> {
    let raw = server.trim().trim_end_matches('/');
    if raw.is_empty() {
        anyhow::bail!("admin: empty server url");
    }
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    reqwest::Url::parse(&with_scheme).with_context(|| format!("admin: invalid server url {server:?}"))
}

impl AdminClient {
    pub fn new(server: &str, user: &str, password: &str, insecure: bool) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(insecure)
            .build()
            .context("admin: build http client")?;
        Ok(Self {
            http,
            base: base_url(server)?,
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    async fn call<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> anyhow::Result<String> {
        let url = self
            .base
            .join(path)
            .with_context(|| format!("admin: bad path {path}"))?;
        let mut req = self
            .http
            .request(method.clone(), url)
            .basic_auth(&self.user, Some(&self.password));
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("admin: {method} {path}"))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("admin: {method} {path}: {status}: {}", text.trim());
        }
        Ok(text)
    }

    pub async fn list_users(&self) -> anyhow::Result<Vec<UserInfo>> {
        let body = self.call::<()>(Method::GET, "/users", None).await?;
        serde_json::from_str(&body).context("admin: decode users")
    }

    pub async fn get_user(&self, name: &str) -> anyhow::Result<UserInfo> {
        let body = self
            .call::<()>(Method::GET, &format!("/user/{name}"), None)
            .await?;
        serde_json::from_str(&body).context("admin: decode user")
    }

    pub async fn add_user(&self, user: &UserChange) -> anyhow::Result<()> {
        self.call(Method::POST, "/user", Some(user)).await.map(drop)
    }

    pub async fn update_user(&self, user: &UserChange) -> anyhow::Result<()> {
        self.call(Method::PUT, "/user", Some(user)).await.map(drop)
    }

    pub async fn delete_user(&self, name: &str) -> anyhow::Result<()> {
        self.call::<()>(Method::DELETE, &format!("/user/{name}"), None)
            .await
            .map(drop)
    }

    /// Uploads a JSON array of users with plaintext passwords, replacing all users.
    pub async fn upload_authfile(&self, path: &Path) -> anyhow::Result<usize> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("admin: read {}", path.display()))?;
        let users: Vec<UserChange> = serde_json::from_str(&data)
            .with_context(|| format!("admin: parse {}", path.display()))?;
        self.call(Method::POST, "/authfile", Some(&users)).await?;
        Ok(users.len())
    }
}

pub fn render_table(users: &[UserInfo]) -> String {
    let rows: Vec<[String; 3]> = users
        .iter()
        .map(|u| [u.name.clone(), u.admin.to_string(), u.addresses.join(", ")])
        .collect();
    let header = ["NAME", "ADMIN", "ADDRESSES"];
    let mut widths = header.map(str::len);
    for r in &rows {
        for (w, cell) in widths.iter_mut().zip(r) {
            *w = (*w).max(cell.len());
        }
    }

    let mut out = String::new();
    let mut line = |cells: [&str; 3]| {
        let _ = writeln!(
            out,
            "{:<w0$}  {:<w1$}  {}",
            cells[0],
            cells[1],
            cells[2],
            w0 = widths[0],
            w1 = widths[1]
        );
    };
    line(header);
    for r in &rows {
        line([r[0].as_str(), r[1].as_str(), r[2].as_str()]);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::Arc};

    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::{net::TcpListener, sync::watch};

    use super::*;
    use crate::sluice::{
        admin::{AdminState, serve_listener},
        auth::{Authenticator, UserRecord, UserStore, hash_password},
        telemetry,
    };

    async fn admin_server() -> (String, Arc<Authenticator>, watch::Sender<bool>) {
        let hash = hash_password("root-password").unwrap();
        let store = UserStore::from_records(vec![
            UserRecord::new("root", &hash, &[".*".to_string()], true).unwrap(),
        ])
        .unwrap();
        let auth = Arc::new(Authenticator::new(store));
        let (reload_tx, _) = watch::channel(telemetry::ReloadSignal::new());
        let state = AdminState {
            prom: Arc::new(PrometheusBuilder::new().build_recorder().handle()),
            sessions: None,
            auth: Some(auth.clone()),
            config_path: PathBuf::from("sluice.toml"),
            reload_tx,
        };
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = l.local_addr().unwrap().to_string();
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(serve_listener(l, state, stop_rx));
        (addr, auth, stop_tx)
    }

    #[test]
    fn bare_host_defaults_to_http() {
        assert_eq!(
            base_url("127.0.0.1:9090").unwrap().as_str(),
            "http://127.0.0.1:9090/"
        );
        assert_eq!(
            base_url("https://admin.example.com/").unwrap().as_str(),
            "https://admin.example.com/"
        );
        assert!(base_url("  ").is_err());
    }

    #[tokio::test]
    async fn manages_users_end_to_end() {
        let (addr, auth, _stop) = admin_server().await;
        let c = AdminClient::new(&addr, "root", "root-password", false).unwrap();

        c.add_user(&UserChange {
            name: "alice".into(),
            password: Some("alice-password".into()),
            addresses: Some(vec!["8080".into(), "db:5432".into()]),
            admin: false,
        })
        .await
        .unwrap();
        assert!(auth.authenticate("alice", "alice-password").is_ok());

        let alice = c.get_user("alice").await.unwrap();
        assert_eq!(alice.addresses, vec!["8080", "db:5432"]);
        assert!(!alice.admin);

        c.update_user(&UserChange {
            name: "alice".into(),
            admin: true,
            ..UserChange::default()
        })
        .await
        .unwrap();
        let names: Vec<String> = c
            .list_users()
            .await
            .unwrap()
            .into_iter()
            .filter(|u| u.admin)
            .map(|u| u.name)
            .collect();
        assert_eq!(names, vec!["alice", "root"]);

        c.delete_user("alice").await.unwrap();
        let err = c.get_user("alice").await.unwrap_err();
        assert!(err.to_string().contains("404"), "{err}");
        let err = c.delete_user("root").await.unwrap_err();
        assert!(err.to_string().contains("own user"), "{err}");
    }

    #[tokio::test]
    async fn wrong_credentials_surface_as_errors() {
        let (addr, _auth, _stop) = admin_server().await;
        let c = AdminClient::new(&addr, "root", "nope", false).unwrap();
        let err = c.list_users().await.unwrap_err();
        assert!(err.to_string().contains("401"), "{err}");
    }

    #[tokio::test]
    async fn authfile_upload_from_json() {
        let (addr, auth, _stop) = admin_server().await;
        let c = AdminClient::new(&addr, "root", "root-password", false).unwrap();
        let path = std::env::temp_dir().join(format!("sluice-authfile-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"[
                {"name": "root", "password": "root-password", "addresses": [".*"], "admin": true},
                {"name": "ci", "password": "ci-password", "addresses": ["9000"]}
            ]"#,
        )
        .unwrap();
        assert_eq!(c.upload_authfile(&path).await.unwrap(), 2);
        assert!(auth.authenticate("ci", "ci-password").is_ok());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn table_columns_line_up() {
        let out = render_table(&[
            UserInfo {
                name: "root".into(),
                addresses: vec![".*".into()],
                admin: true,
            },
            UserInfo {
                name: "alexandra".into(),
                addresses: vec!["80".into(), "443".into()],
                admin: false,
            },
        ]);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "NAME       ADMIN  ADDRESSES");
        assert_eq!(lines[1], "root       true   .*");
        assert_eq!(lines[2], "alexandra  false  80, 443");
    }
}
