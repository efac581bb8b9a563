//! Postgres-backed integration checks. These run only when a Postgres
//! `DATABASE_URL` is available (CI provides one); local `cargo test` without
//! it exercises the SQLite paths in the unit tests instead.

use anyhow::Result;
use futures::future::join_all;
use sqlx::PgPool;

use relay_db::{Database, NewProject, NewUser, WorkspaceState};

#[sqlx::test(migrations = "./migrations")]
async fn concurrent_opens_keep_a_single_warm_workspace(_pool: PgPool) -> Result<()> {
    let database_url = std::env::var("DATABASE_URL")?;
    let db = Database::connect(&database_url).await?;

    let user = db
        .create_user(NewUser {
            email: Some("pg@example.com"),
            display_name: None,
            is_admin: false,
        })
        .await?;
    let mut projects = Vec::new();
    for name in ["p1", "p2", "p3"] {
        projects.push(
            db.create_project(NewProject {
                user_id: user.id,
                name,
                repo_url: "https://github.com/octocat/Hello-World.git",
            })
            .await?,
        );
    }

    // Seed one row per pair, then hammer the transactional upsert from
    // concurrent tasks. Individual transactions may abort under lock
    // contention; the invariant must hold for whatever committed.
    for project in &projects {
        db.open_workspace(user.id, project.id).await?;
    }
    let mut tasks = Vec::new();
    for _round in 0..4 {
        for project in &projects {
            let db = db.clone();
            let user_id = user.id;
            let project_id = project.id;
            tasks.push(tokio::spawn(async move {
                db.open_workspace(user_id, project_id).await
            }));
        }
    }
    for result in join_all(tasks).await {
        let _ = result?;
    }

    let warm = db.list_warm_workspaces(user.id).await?;
    assert_eq!(warm.len(), 1, "expected exactly one warm workspace");
    assert_eq!(warm[0].state, WorkspaceState::Warm);
    assert!(warm[0].volume_name.is_some());

    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn volume_name_survives_cold_cycles(_pool: PgPool) -> Result<()> {
    let database_url = std::env::var("DATABASE_URL")?;
    let db = Database::connect(&database_url).await?;

    let user = db
        .create_user(NewUser {
            email: None,
            display_name: None,
            is_admin: false,
        })
        .await?;
    let project = db
        .create_project(NewProject {
            user_id: user.id,
            name: "p1",
            repo_url: "https://github.com/octocat/Hello-World.git",
        })
        .await?;

    let first = db.open_workspace(user.id, project.id).await?.workspace;
    let volume = first.volume_name.clone().unwrap();

    db.mark_workspace_cold(first.id).await?;
    let reopened = db.open_workspace(user.id, project.id).await?.workspace;
    assert_eq!(reopened.id, first.id);
    assert_eq!(reopened.volume_name.as_deref(), Some(volume.as_str()));

    Ok(())
}
