//! 配置管理模块
//!
//! 支持多层 TOML 配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use crate::observability::ObservabilityConfig;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// 推理引擎配置
///
/// 这里只保存原始字符串形式的策略名称，由内核在构建引擎时解析，
/// 以免共享库反向依赖内核类型。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// 触发模式：first_match 或 all_match
    pub mode: String,
    /// 单次运行的最大循环次数
    pub max_iterations: u64,
    /// 单次运行的截止时间（毫秒），None 表示不限制
    pub deadline_ms: Option<u64>,
    /// 最近触发排序策略：favor_idle 或 favor_recent
    pub recency_policy: String,
    /// 是否对未变化事实的规则复用上一轮匹配结果
    pub memoize_matches: bool,
    /// 是否把每轮循环事件输出到 tracing
    pub trace: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            mode: "first_match".to_string(),
            max_iterations: 1000,
            deadline_ms: None,
            recency_policy: "favor_idle".to_string(),
            memoize_matches: true,
            trace: false,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub engine: EngineSettings,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（KERNEL_ 前缀，层级用双下划线分隔，如
    ///    KERNEL_ENGINE__MAX_ITERATIONS -> engine.max_iterations）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("KERNEL_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        Self::load_from(Path::new(&config_dir), &env, service_name)
    }

    /// 从指定目录加载配置
    pub fn load_from(
        config_dir: &Path,
        environment: &str,
        service_name: &str,
    ) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", environment)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", environment))).required(false))
            .add_source(
                File::from(config_dir.join(format!("{}.toml", service_name))).required(false),
            )
            .add_source(
                Environment::with_prefix("KERNEL")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
