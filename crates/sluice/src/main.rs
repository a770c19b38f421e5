mod sluice;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "sluice",
    version,
    about = "sluice - reverse TCP tunnels over a single HTTP(S) connection"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses SLUICE_CONFIG; then auto-detects sluice.toml > sluice.yaml > sluice.yml from CWD; then falls back to the OS default path (Linux: /etc/sluice/sluice.toml; others: user config dir).
    #[arg(long, env = "SLUICE_CONFIG")]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print an Argon2id hash suitable for the users file `password_hash` field.
    HashPassword {
        /// Read from stdin when omitted.
        #[arg(long)]
        password: Option<String>,
    },
    /// Manage users on a running server through its admin API.
    Admin {
        /// Admin listener, e.g. `127.0.0.1:9090` or `https://admin.example.com`.
        #[arg(long, env = "SLUICE_ADMIN_URL", default_value = "127.0.0.1:9090")]
        server: String,
        /// An admin user from the server's users file.
        #[arg(long, short = 'u', env = "SLUICE_ADMIN_USER")]
        user: String,
        #[arg(long, short = 'p', env = "SLUICE_ADMIN_PASSWORD", hide_env_values = true)]
        password: String,
        /// Skip TLS certificate verification for https admin urls.
        #[arg(long)]
        insecure: bool,
        #[command(subcommand)]
        action: AdminAction,
    },
}

#[derive(Debug, Subcommand)]
enum AdminAction {
    /// Create a user.
    AddUser {
        #[arg(long, short = 'n')]
        name: String,
        #[arg(long)]
        password: String,
        /// Comma-separated address patterns, e.g. `8080,db:54\d\d`.
        #[arg(long, short = 'a', value_delimiter = ',', required = true)]
        addresses: Vec<String>,
        #[arg(long)]
        admin: bool,
    },
    /// Change a user. Omitted password or addresses stay as they are.
    UpdateUser {
        #[arg(long, short = 'n')]
        name: String,
        #[arg(long)]
        password: Option<String>,
        #[arg(long, short = 'a', value_delimiter = ',')]
        addresses: Option<Vec<String>>,
        /// The user's admin flag after the update.
        #[arg(long)]
        admin: bool,
    },
    DelUser {
        #[arg(long, short = 'n')]
        name: String,
    },
    GetUser {
        #[arg(long, short = 'n')]
        name: String,
        /// Print the server's JSON instead of a table.
        #[arg(long)]
        raw: bool,
    },
    ListUsers {
        #[arg(long)]
        raw: bool,
    },
    /// Replace every user with a JSON array of `{name, password, addresses, admin}`.
    Authfile {
        #[arg(long)]
        file: std::path::PathBuf,
    },
}

async fn run_admin(client: sluice::admin_client::AdminClient, action: AdminAction) -> anyhow::Result<()> {
    use sluice::admin_client::{UserChange, render_table};

    match action {
        AdminAction::AddUser {
            name,
            password,
            addresses,
            admin,
        } => {
            sluice::auth::validate_new_user(&name, &password, &addresses)?;
            client
                .add_user(&UserChange {
                    name: name.clone(),
                    password: Some(password),
                    addresses: Some(addresses),
                    admin,
                })
                .await?;
            println!("user {name} added");
        }
        AdminAction::UpdateUser {
            name,
            password,
            addresses,
            admin,
        } => {
            client
                .update_user(&UserChange {
                    name: name.clone(),
                    password,
                    addresses,
                    admin,
                })
                .await?;
            println!("user {name} updated");
        }
        AdminAction::DelUser { name } => {
            client.delete_user(&name).await?;
            println!("user {name} deleted");
        }
        AdminAction::GetUser { name, raw } => {
            let u = client.get_user(&name).await?;
            if raw {
                println!("{}", serde_json::to_string_pretty(&u)?);
            } else {
                print!("{}", render_table(std::slice::from_ref(&u)));
            }
        }
        AdminAction::ListUsers { raw } => {
            let users = client.list_users().await?;
            if raw {
                println!("{}", serde_json::to_string_pretty(&users)?);
            } else {
                print!("{}", render_table(&users));
            }
        }
        AdminAction::Authfile { file } => {
            let n = client.upload_authfile(&file).await?;
            println!("users file replaced with {n} users");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::HashPassword { password }) => {
            let password = match password {
                Some(p) => p,
                None => {
                    let mut line = String::new();
                    std::io::stdin().read_line(&mut line)?;
                    line.trim_end_matches(['\r', '\n']).to_string()
                }
            };
            if password.is_empty() {
                anyhow::bail!("hash-password: empty password");
            }
            println!("{}", sluice::auth::hash_password(&password)?);
            Ok(())
        }
        Some(Command::Admin {
            server,
            user,
            password,
            insecure,
            action,
        }) => {
            let client = sluice::admin_client::AdminClient::new(&server, &user, &password, insecure)?;
            run_admin(client, action).await
        }
        None => sluice::run(cli.config).await,
    }
}
