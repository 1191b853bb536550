use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{AddRequest, DownloadEngine, EngineError, EngineHandle, EngineState, EngineStatus};

// aria2 单服务器连接数上限
const MAX_CONNECTION_PER_SERVER: u32 = 16;

const STATUS_KEYS: [&str; 6] = [
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "downloadSpeed",
    "errorMessage",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Aria2Options {
    pub binary: PathBuf,
    pub host: String,
    pub port: u16,
    pub secret: Option<String>,
    pub spawn_process: bool, // false 时连接已经在运行的 aria2
    pub startup_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for Aria2Options {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("aria2c"),
            host: "127.0.0.1".to_string(),
            port: 6800,
            secret: None,
            spawn_process: true,
            startup_timeout_ms: 5000,
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// 基于 aria2 JSON-RPC 的下载引擎
pub struct Aria2Engine {
    client: Client,
    options: Aria2Options,
    child: Mutex<Option<Child>>,
    next_id: AtomicU64,
}

impl Aria2Engine {
    pub fn new(options: Aria2Options) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(options.request_timeout_ms))
            .build()
            .map_err(|e| EngineError::Unavailable(format!("创建 RPC 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            options,
            child: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}:{}/jsonrpc", self.options.host, self.options.port)
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, EngineError> {
        let mut all_params = Vec::with_capacity(params.len() + 1);
        if let Some(secret) = &self.options.secret {
            all_params.push(json!(format!("token:{}", secret)));
        }
        all_params.extend(params);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id.to_string(),
            "method": method,
            "params": all_params,
        });

        debug!("aria2 RPC 调用: {}", method);
        let resp = self
            .client
            .post(self.endpoint())
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;

        // aria2 出错时 HTTP 状态码不是 200，但正文仍然是 JSON-RPC 错误
        let status = resp.status();
        let payload: RpcResponse = resp.json().await.map_err(|e| {
            if status.is_success() {
                EngineError::Rejected(format!("无法解析引擎响应: {}", e))
            } else {
                EngineError::Unavailable(format!("引擎返回 HTTP {}", status))
            }
        })?;

        if let Some(error) = payload.error {
            return Err(classify_error(error));
        }
        payload
            .result
            .ok_or_else(|| EngineError::Rejected(format!("{} 的响应缺少 result", method)))
    }

    /// 查询引擎版本，也用来探测 RPC 是否就绪
    pub async fn version(&self) -> Result<String, EngineError> {
        let result = self.call("aria2.getVersion", vec![]).await?;
        Ok(result
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }

    async fn spawn_process(&self) -> Result<(), EngineError> {
        let mut command = Command::new(&self.options.binary);
        command
            .arg("--enable-rpc")
            .arg(format!("--rpc-listen-port={}", self.options.port))
            .arg("--rpc-listen-all=false")
            .arg("--continue=true")
            .arg("--max-concurrent-downloads=16")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(secret) = &self.options.secret {
            command.arg(format!("--rpc-secret={}", secret));
        }

        let child = command.spawn().map_err(|e| {
            EngineError::Unavailable(format!(
                "无法启动 {}: {}",
                self.options.binary.display(),
                e
            ))
        })?;
        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn wait_until_ready(&self) -> Result<String, EngineError> {
        let deadline = Instant::now() + Duration::from_millis(self.options.startup_timeout_ms);
        loop {
            if let Ok(version) = self.version().await {
                return Ok(version);
            }

            {
                let mut child = self.child.lock().await;
                if let Some(process) = child.as_mut() {
                    if let Ok(Some(status)) = process.try_wait() {
                        *child = None;
                        return Err(EngineError::Unavailable(format!(
                            "引擎进程提前退出: {}",
                            status
                        )));
                    }
                }
            }

            if Instant::now() >= deadline {
                self.kill_process().await;
                return Err(EngineError::Unavailable("等待引擎 RPC 就绪超时".to_string()));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn kill_process(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!("结束引擎进程失败: {}", e);
            }
        }
    }
}

#[async_trait]
impl DownloadEngine for Aria2Engine {
    async fn launch(&self) -> Result<(), EngineError> {
        // 已经有可用的 aria2 时直接复用
        if let Ok(version) = self.version().await {
            info!("已连接 aria2 {}", version);
            return Ok(());
        }
        if !self.options.spawn_process {
            return Err(EngineError::Unavailable(format!(
                "{} 无响应",
                self.endpoint()
            )));
        }

        self.spawn_process().await?;
        let version = self.wait_until_ready().await?;
        info!("aria2 {} 已启动: {}", version, self.endpoint());
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        let spawned = self.child.lock().await.is_some();
        if spawned {
            if let Err(e) = self.call("aria2.shutdown", vec![]).await {
                debug!("aria2.shutdown 调用失败: {}", e);
            }
            self.kill_process().await;
        }
        Ok(())
    }

    async fn add_uri(&self, request: &AddRequest) -> Result<EngineHandle, EngineError> {
        let mut options = Map::new();
        options.insert("dir".to_string(), json!(request.dir.to_string_lossy()));
        options.insert("out".to_string(), json!(request.out));
        if !request.headers.is_empty() {
            options.insert("header".to_string(), json!(request.headers));
        }
        if let Some(user_agent) = &request.user_agent {
            options.insert("user-agent".to_string(), json!(user_agent));
        }
        let split = request.split.max(1);
        options.insert("split".to_string(), json!(split.to_string()));
        options.insert(
            "max-connection-per-server".to_string(),
            json!(split.min(MAX_CONNECTION_PER_SERVER).to_string()),
        );

        let result = self
            .call(
                "aria2.addUri",
                vec![json!([request.url]), Value::Object(options)],
            )
            .await?;

        result
            .as_str()
            .map(EngineHandle::new)
            .ok_or_else(|| EngineError::Rejected(format!("addUri 返回了无效的 gid: {}", result)))
    }

    async fn pause(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.call("aria2.pause", vec![json!(handle.as_str())]).await?;
        Ok(())
    }

    async fn unpause(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.call("aria2.unpause", vec![json!(handle.as_str())]).await?;
        Ok(())
    }

    async fn remove(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.call("aria2.forceRemove", vec![json!(handle.as_str())])
            .await?;
        Ok(())
    }

    async fn tell_status(&self, handle: &EngineHandle) -> Result<EngineStatus, EngineError> {
        let result = self
            .call(
                "aria2.tellStatus",
                vec![json!(handle.as_str()), json!(STATUS_KEYS)],
            )
            .await?;
        parse_status(handle, &result)
    }
}

fn classify_error(error: RpcError) -> EngineError {
    if error.message.contains("not found") {
        EngineError::UnknownHandle(error.message)
    } else {
        EngineError::Rejected(format!("{} (code {})", error.message, error.code))
    }
}

// aria2 的数值字段都是字符串
fn number_field(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn parse_status(handle: &EngineHandle, value: &Value) -> Result<EngineStatus, EngineError> {
    let state = value
        .get("status")
        .and_then(Value::as_str)
        .and_then(EngineState::parse)
        .ok_or_else(|| EngineError::Rejected(format!("无法识别的任务状态: {}", value)))?;

    Ok(EngineStatus {
        handle: handle.clone(),
        state,
        total_length: number_field(value, "totalLength"),
        completed_length: number_field(value, "completedLength"),
        download_speed: number_field(value, "downloadSpeed"),
        error_message: value
            .get("errorMessage")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    })
}
