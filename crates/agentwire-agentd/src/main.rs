mod keys;

use std::path::PathBuf;
use std::sync::Arc;

use bytes::BytesMut;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, info, warn};

use agentwire_core::{OpensshKeyParser, ServerEngine, ServerEvent};

use crate::keys::KeyVault;

#[derive(Debug, Default, Deserialize)]
struct Config {
    socket_path: Option<String>,
    key_paths: Option<Vec<String>>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config();

    let key_paths: Vec<PathBuf> = config
        .key_paths
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(PathBuf::from)
        .collect();

    let vault = match KeyVault::load(&key_paths) {
        Ok(vault) => Arc::new(vault),
        Err(err) => {
            error!(?err, "failed to load keys");
            return;
        }
    };
    info!(count = vault.len(), "loaded identities");

    #[cfg(unix)]
    {
        let socket_path = resolve_socket_path(config.socket_path);
        if let Err(err) = run_unix(socket_path, vault).await {
            error!(?err, "agent exited with error");
        }
    }

    #[cfg(windows)]
    {
        let pipe_name = resolve_pipe_name(config.socket_path);
        if let Err(err) = run_windows(pipe_name, vault).await {
            error!(?err, "agent exited with error");
        }
    }
}

fn load_config() -> Config {
    let path = std::env::var("AGENTWIRE_CONFIG").ok();
    if let Some(path) = path {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if let Ok(config) = serde_json::from_str::<Config>(&contents) {
                return config;
            }
        }
    }
    Config::default()
}

#[cfg(unix)]
fn resolve_socket_path(override_path: Option<String>) -> PathBuf {
    if let Some(path) = override_path {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var("AGENTWIRE_SOCK") {
        return PathBuf::from(path);
    }
    if let Ok(runtime) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime).join("agentwire").join("agent.sock");
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".agentwire").join("agent.sock")
}

#[cfg(windows)]
fn resolve_pipe_name(override_path: Option<String>) -> String {
    if let Some(path) = override_path {
        return path;
    }
    if let Ok(path) = std::env::var("AGENTWIRE_PIPE") {
        return path;
    }
    r"\\.\pipe\agentwire-agent".to_string()
}

#[cfg(unix)]
async fn run_unix(socket_path: PathBuf, vault: Arc<KeyVault>) -> std::io::Result<()> {
    use tokio::net::UnixListener;

    if let Some(dir) = socket_path.parent() {
        if let Err(err) = std::fs::create_dir_all(dir) {
            warn!(?err, "failed to create socket directory");
        }
    }
    if socket_path.exists() {
        if let Err(err) = std::fs::remove_file(&socket_path) {
            warn!(?err, "failed to remove existing socket file");
        }
    }

    let listener = UnixListener::bind(&socket_path)?;
    info!(path = %socket_path.display(), "agentwire agent listening");

    loop {
        tokio::select! {
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let vault = vault.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(stream, vault).await {
                                warn!(?err, "connection error");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(?err, "accept failed");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(windows)]
async fn run_windows(pipe_name: String, vault: Arc<KeyVault>) -> std::io::Result<()> {
    use tokio::net::windows::named_pipe::ServerOptions;

    info!(pipe = %pipe_name, "agentwire agent listening");

    loop {
        let server = ServerOptions::new().create(&pipe_name)?;
        server.connect().await?;
        let vault = vault.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(server, vault).await {
                warn!(?err, "connection error");
            }
        });
    }
}

async fn handle_connection<S>(stream: S, vault: Arc<KeyVault>) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut engine = ServerEngine::new(Arc::new(OpensshKeyParser));
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        buffer.clear();
        let n = reader.read_buf(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }

        let events = match engine.ingest(&buffer) {
            Ok(events) => events,
            Err(err) => {
                warn!(?err, "protocol error, dropping connection");
                return Ok(());
            }
        };

        for event in events {
            match event {
                ServerEvent::Identities { request } => {
                    if let Err(err) = engine.identities_reply(request, vault.identities()) {
                        warn!(?err, "identities reply failed");
                        let _ = engine.failure_reply(request);
                    }
                }
                ServerEvent::Sign { request, key, data, hash } => {
                    let vault = vault.clone();
                    let signed = tokio::task::spawn_blocking(move || {
                        vault.sign(&key, &data, hash)
                    })
                    .await;
                    match signed {
                        Ok(Ok(signature)) => {
                            if let Err(err) = engine.sign_reply(request, &signature) {
                                warn!(?err, "sign reply failed");
                                let _ = engine.failure_reply(request);
                            }
                        }
                        Ok(Err(err)) => {
                            warn!(?err, "sign request failed");
                            let _ = engine.failure_reply(request);
                        }
                        Err(err) => {
                            warn!(?err, "sign worker failed");
                            let _ = engine.failure_reply(request);
                        }
                    }
                }
            }
        }

        while let Some(frame) = engine.next_outbound() {
            writer.write_all(&frame).await?;
        }
        writer.flush().await?;
    }
}
