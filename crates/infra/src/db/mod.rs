pub mod store;

use std::time::Duration;

use lapor_domain::ports::db::DbError;
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::{Client, Ws};
use surrealdb::opt::auth::Root;
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::config::AppConfig;

pub use store::SurrealStore;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub endpoint: String,
    pub namespace: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl DbConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            endpoint: config.surreal_endpoint.clone(),
            namespace: config.surreal_ns.clone(),
            database: config.surreal_db.clone(),
            username: config.surreal_user.clone(),
            password: config.surreal_pass.clone(),
        }
    }
}

pub async fn connect(config: &DbConfig) -> anyhow::Result<Surreal<Client>> {
    let db = Surreal::<Client>::init();
    db.connect::<Ws>(&config.endpoint).await?;
    db.signin(Root {
        username: config.username.clone(),
        password: config.password.clone(),
    })
    .await?;
    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await?;
    tracing::info!(
        endpoint = %config.endpoint,
        namespace = %config.namespace,
        database = %config.database,
        "connected to surrealdb"
    );
    Ok(db)
}

/// Cheap reachability check of the configured endpoint.
pub async fn probe_endpoint(endpoint: &str) -> Result<(), DbError> {
    let address = parse_socket_address(endpoint)?;
    let connect = timeout(PROBE_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| DbError::Unavailable("surreal endpoint connect timed out".to_string()))?;
    connect.map_err(|err| DbError::Unavailable(format!("surreal endpoint connect failed: {err}")))?;
    tracing::debug!(endpoint, "surreal health check succeeded");
    Ok(())
}

fn parse_socket_address(endpoint: &str) -> Result<String, DbError> {
    let normalized = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("ws://{endpoint}")
    };
    let parsed = Url::parse(&normalized).map_err(|err| {
        DbError::Unavailable(format!("invalid surreal endpoint '{endpoint}': {err}"))
    })?;

    let host = parsed.host_str().ok_or_else(|| {
        DbError::Unavailable(format!("missing surreal host in endpoint '{endpoint}'"))
    })?;
    let port = match parsed.scheme() {
        "ws" | "http" => parsed.port().unwrap_or(8000),
        _ => parsed.port_or_known_default().unwrap_or(8000),
    };
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_address_defaults_surreal_port() {
        assert_eq!(
            parse_socket_address("ws://127.0.0.1:8000").unwrap(),
            "127.0.0.1:8000"
        );
        assert_eq!(parse_socket_address("db.internal").unwrap(), "db.internal:8000");
        assert_eq!(
            parse_socket_address("wss://db.example.org").unwrap(),
            "db.example.org:443"
        );
    }

    #[test]
    fn rejects_endpoint_without_host() {
        assert!(matches!(
            parse_socket_address("ws://"),
            Err(DbError::Unavailable(_))
        ));
    }
}
