use relay_daemon::server::docs::ApiDoc;
use utoipa::OpenApi;

fn main() -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&ApiDoc::openapi())?);
    Ok(())
}
