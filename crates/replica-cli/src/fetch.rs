//! The `fetch` subcommand.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use miette::Result;
use replica::{
    BoxError, Fetcher, JsonFileStorage, PhysicalReplica, ReplicaSettings, ReplicaState,
};
use replica_network::{
    BearerCredentials, NetworkError, NetworkExecutor, NetworkRequest, ReqwestTransport,
};
use serde_json::Value;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{info, warn};

pub struct FetchOptions {
    pub url: String,
    pub token: Option<String>,
    pub refresh_url: Option<String>,
    pub refresh_token: Option<String>,
    pub cache_file: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub force: bool,
    pub watch: bool,
}

/// Fetches one URL through the network executor.
struct HttpFetcher {
    executor: NetworkExecutor,
    url: String,
}

#[async_trait]
impl Fetcher<Value> for HttpFetcher {
    async fn fetch(&self) -> Result<Value, BoxError> {
        let request = NetworkRequest::get(self.url.clone());
        Ok(self.executor.execute_json(request).await?)
    }
}

async fn load_settings(path: Option<&Path>) -> Result<ReplicaSettings> {
    let Some(path) = path else {
        return Ok(ReplicaSettings::default());
    };
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| miette::miette!("failed to read {}: {}", path.display(), e))?;
    ReplicaSettings::from_json(&json)
        .map_err(|e| miette::miette!("invalid settings in {}: {}", path.display(), e))
}

fn build_executor(options: &FetchOptions) -> Result<NetworkExecutor> {
    let transport =
        Arc::new(ReqwestTransport::new("").map_err(|e| miette::miette!("{}", e))?);

    let mut credentials = BearerCredentials::new(options.token.clone());
    match (&options.refresh_url, &options.refresh_token) {
        (Some(url), Some(refresh_token)) => {
            credentials = credentials.with_refresh(transport.clone(), url.clone(), refresh_token.clone());
        }
        (Some(_), None) => {
            return Err(miette::miette!("--refresh-url requires --refresh-token"));
        }
        _ => {}
    }

    Ok(
        NetworkExecutor::new(transport, Arc::new(credentials)).on_refresh_failed(Arc::new(
            |e: &NetworkError| {
                warn!(error = %e, "credentials could not be refreshed; sign in again");
            },
        )),
    )
}

fn print_state(state: &ReplicaState<Value>) -> Result<()> {
    if let Some(error) = &state.error {
        eprintln!("error: {}", error);
    }
    if let Some(value) = state.value() {
        let fresh = state.has_fresh_data();
        let rendered =
            serde_json::to_string_pretty(&value).map_err(|e| miette::miette!("{}", e))?;
        println!("{}{}", rendered, if fresh { "" } else { "  (stale)" });
    } else if state.loading {
        eprintln!("loading...");
    }
    Ok(())
}

pub async fn run(options: FetchOptions) -> Result<()> {
    let settings = load_settings(options.config.as_deref()).await?;
    let executor = build_executor(&options)?;

    let fetcher = HttpFetcher {
        executor,
        url: options.url.clone(),
    };
    let mut builder = PhysicalReplica::builder(options.url.clone(), fetcher).settings(settings);
    if let Some(path) = &options.cache_file {
        builder = builder.storage(JsonFileStorage::<Value>::new(path.clone()));
    }
    let replica = builder.build();

    if !options.watch {
        let value = replica
            .get_data(options.force)
            .await
            .map_err(|e| miette::miette!("{}", e))?;
        let rendered =
            serde_json::to_string_pretty(&value).map_err(|e| miette::miette!("{}", e))?;
        println!("{}", rendered);
        return Ok(());
    }

    let (_active_tx, active_rx) = watch::channel(true);
    let mut observer = replica.observe(active_rx);
    if options.force {
        replica.refresh();
    }
    info!(url = %options.url, "watching; press Ctrl-C to stop");

    loop {
        tokio::select! {
            state = observer.next() => {
                match state {
                    Some(state) => print_state(&state)?,
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn options() -> FetchOptions {
        FetchOptions {
            url: "https://example.com/items".to_string(),
            token: None,
            refresh_url: None,
            refresh_token: None,
            cache_file: None,
            config: None,
            force: false,
            watch: false,
        }
    }

    #[tokio::test]
    async fn test_load_settings_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"stale_time_ms": 1500}}"#).unwrap();

        let settings = load_settings(Some(file.path())).await.unwrap();
        assert_eq!(settings.stale_time, Some(Duration::from_millis(1500)));
        assert!(settings.revalidate_on_active_observer_added);
    }

    #[tokio::test]
    async fn test_missing_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_settings(Some(dir.path().join("absent.json").as_path())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_refresh_url_requires_refresh_token() {
        let mut opts = options();
        opts.refresh_url = Some("https://example.com/refresh".to_string());
        assert!(build_executor(&opts).is_err());

        opts.refresh_token = Some("secret".to_string());
        assert!(build_executor(&opts).is_ok());
    }
}
