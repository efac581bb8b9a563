//! Bootstrap tool: creates a user and issues an API key for it.
//!
//! Usage: relay-apikey <email> [--admin] [--label <label>]
//! The database is taken from POSTGRES_URL or DATABASE_URL. The raw token is
//! printed once; only its hash is stored.

use std::env;

use anyhow::{bail, Context, Result};
use relay_daemon::auth::AuthService;
use relay_db::{Database, NewUser};

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(email) = args.next() else {
        bail!("usage: relay-apikey <email> [--admin] [--label <label>]");
    };

    let mut is_admin = false;
    let mut label = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--admin" => is_admin = true,
            "--label" => {
                label = Some(
                    args.next()
                        .context("--label requires a value")?,
                );
            }
            other => bail!("unknown argument: {other}"),
        }
    }

    let database_url = env::var("POSTGRES_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .context("POSTGRES_URL or DATABASE_URL must be configured")?;
    let db = Database::connect(&database_url).await?;

    let user = db
        .create_user(NewUser {
            email: Some(&email),
            display_name: None,
            is_admin,
        })
        .await?;
    let issued = AuthService::new(db)
        .issue_key(user.id, label.as_deref())
        .await?;

    println!("user_id: {}", user.id);
    println!("api_key_id: {}", issued.record.id);
    println!("token: {}", issued.token);
    Ok(())
}
