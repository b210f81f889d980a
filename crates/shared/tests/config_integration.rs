//! 配置加载集成测试
//!
//! 读取仓库自带的 config/ 目录，确认默认配置可以完整反序列化。

use kernel_shared::config::AppConfig;
use std::path::PathBuf;

fn repo_config_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config")
}

#[test]
fn test_repository_default_config() {
    let config = AppConfig::load_from(&repo_config_dir(), "test", "inference-kernel").unwrap();

    assert_eq!(config.service_name, "inference-kernel");
    assert_eq!(config.environment, "test");
    assert!(!config.is_production());

    assert_eq!(config.engine.mode, "first_match");
    assert_eq!(config.engine.max_iterations, 1000);
    assert_eq!(config.engine.deadline_ms, None);
    assert_eq!(config.engine.recency_policy, "favor_idle");
    assert!(config.engine.memoize_matches);

    assert_eq!(config.observability.log_level, "info");
    assert!(!config.observability.json_logs());
}
