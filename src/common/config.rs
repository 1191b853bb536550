use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::common::api::DEFAULT_API_BASE;
use crate::engine::Aria2Options;

pub const MIN_CONCURRENT_DOWNLOADS: u8 = 1;
pub const MAX_CONCURRENT_DOWNLOADS: u8 = 3;
pub const DEFAULT_USER_AGENT: &str = "netdisk;pan.baidu.com";

const CONFIG_FILE: &str = "config.json";
const DEFAULT_DOWNLOAD_DIR: &str = "Downloads";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO操作失败: {0}")]
    IoError(#[from] std::io::Error),

    #[error("配置文件格式错误: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    pub aria2: Aria2Options,
    pub threads: u32,           // 单文件连接数
    pub poll_interval_ms: u64,  // 状态轮询间隔
    pub stop_when_idle: bool,   // 任务清空后关闭引擎
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            aria2: Aria2Options::default(),
            threads: 64,
            poll_interval_ms: 1000,
            stop_when_idle: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub download_path: Option<PathBuf>,
    pub max_concurrent_downloads: u8,
    pub retry_limit: u32,
    pub user_agent: String,
    pub api_base: String,
    pub engine: EngineSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_path: None,
            max_concurrent_downloads: MAX_CONCURRENT_DOWNLOADS,
            retry_limit: 3,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            engine: EngineSettings::default(),
        }
    }
}

impl Settings {
    pub fn clamp_concurrency(value: u8) -> u8 {
        value.clamp(MIN_CONCURRENT_DOWNLOADS, MAX_CONCURRENT_DOWNLOADS)
    }

    // 手改的配置文件可能越界
    fn normalized(mut self) -> Self {
        self.max_concurrent_downloads = Self::clamp_concurrency(self.max_concurrent_downloads);
        self
    }
}

/// 配置持久化：`<data_dir>/config.json`
#[derive(Debug, Clone)]
pub struct SettingsStore {
    data_dir: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    fn load_raw(&self) -> Map<String, Value> {
        let path = self.config_path();
        let Ok(data) = std::fs::read_to_string(&path) else {
            return Map::new();
        };
        match serde_json::from_str::<Value>(&data) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!("配置文件无效，使用默认配置: {}", path.display());
                Map::new()
            }
        }
    }

    fn save_raw(&self, map: &Map<String, Value>) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_dir)?;
        let data = serde_json::to_string_pretty(map)?;
        std::fs::write(self.config_path(), data)?;
        debug!("配置已保存: {}", self.config_path().display());
        Ok(())
    }

    /// 读取配置，文件缺失或损坏时回退到默认值
    pub fn load(&self) -> Settings {
        let raw = Value::Object(self.load_raw());
        match serde_json::from_value::<Settings>(raw) {
            Ok(settings) => settings.normalized(),
            Err(e) => {
                warn!("配置字段无效，使用默认配置: {}", e);
                Settings::default()
            }
        }
    }

    pub fn save(&self, settings: &Settings) -> Result<(), ConfigError> {
        // 保留不认识的键
        let mut map = self.load_raw();
        if let Value::Object(known) = serde_json::to_value(settings)? {
            map.extend(known);
        }
        self.save_raw(&map)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.load_raw().remove(key)
    }

    pub fn set(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        let mut map = self.load_raw();
        map.insert(key.to_string(), value);
        self.save_raw(&map)
    }

    pub fn get_all(&self) -> Value {
        Value::Object(self.load_raw())
    }

    pub fn default_download_dir(&self) -> PathBuf {
        self.data_dir
            .parent()
            .unwrap_or(&self.data_dir)
            .join(DEFAULT_DOWNLOAD_DIR)
    }

    /// 当前下载目录：优先使用已存在的配置目录，否则使用默认目录（按需创建）
    pub fn current_download_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = self.load().download_path {
            if path.is_dir() {
                return Ok(path);
            }
            warn!("配置的下载目录不存在: {}", path.display());
        }
        let path = self.default_download_dir();
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    pub fn set_download_dir(&self, path: impl AsRef<Path>) -> Result<PathBuf, ConfigError> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        let mut settings = self.load();
        settings.download_path = Some(path.clone());
        self.save(&settings)?;
        Ok(path)
    }

    /// 限制在 1-3 之间并保存，返回实际生效的值
    pub fn set_max_concurrent_downloads(&self, value: u8) -> Result<u8, ConfigError> {
        let value = Settings::clamp_concurrency(value);
        let mut settings = self.load();
        settings.max_concurrent_downloads = value;
        self.save(&settings)?;
        Ok(value)
    }
}
