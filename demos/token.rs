use gcp_credentials::CredentialsLoadingStrategy;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let scopes = &["https://www.googleapis.com/auth/cloud-platform"];
    let provider = gcp_credentials::provider(CredentialsLoadingStrategy::Environment, scopes).await?;
    let token = provider.token().await?;
    println!("token expires at {}", token.expires_at());
    if let Ok(project) = provider.project_id().await {
        println!("project: {project}");
    }
    Ok(())
}
