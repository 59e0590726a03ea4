use anyhow::{Context, Result};
use drivesync_lib::logging::init_logging;
use drivesync_lib::storage::LocalStorage;
use drivesync_lib::models::Version;
use drivesync_lib::{ConfigHandle, DirectoryVersion, DriveSyncEngine, FileVersion, SyncPlan, SyncSession};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

/// 一次同步请求
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum SyncRequest {
    Folders {
        session: SyncSession,
        #[serde(default)]
        original: Vec<DirectoryVersion>,
        #[serde(default)]
        client: Vec<DirectoryVersion>,
    },
    Files {
        path: String,
        session: SyncSession,
        #[serde(default)]
        original: Vec<FileVersion>,
        #[serde(default)]
        client: Vec<FileVersion>,
    },
}

/// 服务端动作交给存储执行，客户端只收到 `result`
fn render<T: Version>(plan: SyncPlan<T>) -> Result<String> {
    let server_actions = serde_json::to_value(&plan.server_actions)?;
    let result = plan.into_result();
    Ok(serde_json::to_string_pretty(&serde_json::json!({
        "serverActions": server_actions,
        "result": result,
    }))?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let (Some(local_root), Some(request_file)) = (args.next(), args.next()) else {
        eprintln!("usage: drivesync <local-root> <request.json>");
        std::process::exit(2);
    };

    let config_dir = drivesync_lib::dirs::app_config_dir();
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("无法创建配置目录 {}", config_dir.display()))?;
    let _guard = init_logging(&config_dir);

    let request_path = PathBuf::from(&request_file);
    let content = tokio::fs::read_to_string(&request_path)
        .await
        .with_context(|| format!("无法读取请求文件 {}", request_path.display()))?;
    let request: SyncRequest = serde_json::from_str(&content).context("请求格式无效")?;

    let config = Arc::new(ConfigHandle::load(&config_dir)?);
    let storage = Arc::new(LocalStorage::new(&local_root)?);
    let engine = DriveSyncEngine::new(config, storage);

    let output = match request {
        SyncRequest::Folders {
            session,
            original,
            client,
        } => render(engine.sync_folders(&session, original, client).await?)?,
        SyncRequest::Files {
            path,
            session,
            original,
            client,
        } => render(engine.sync_files(&session, &path, original, client).await?)?,
    };
    println!("{}", output);
    Ok(())
}
