//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HORNET__*` 覆盖（双下划线表示嵌套，
//! 如 `HORNET__TOOLS__TOOL_TIMEOUT_SECS=10`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default, rename = "loop")]
    pub loop_: LoopSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub tools: ToolsSection,
}

/// [app] 段：应用名与沙箱根目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
}

/// [loop] 段：决策循环上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopSection {
    /// 单次会话最大审计步数，防止死循环
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

impl Default for LoopSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
        }
    }
}

fn default_max_steps() -> usize {
    20
}

/// [context] 段：上下文合并参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    /// 保留的最近工具结果条数（FIFO）
    #[serde(default = "default_max_recent_results")]
    pub max_recent_results: usize,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_recent_results: default_max_recent_results(),
        }
    }
}

fn default_max_recent_results() -> usize {
    10
}

/// [tools] 段：工具超时、授予的权限、类别白名单与干跑开关
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 授予注册表的权限集合；工具声明的权限必须是其子集才允许执行
    #[serde(default = "default_granted_permissions")]
    pub granted_permissions: Vec<String>,
    /// 允许注册的工具类别；为空表示不限制
    #[serde(default)]
    pub allowed_categories: Vec<String>,
    /// 干跑模式：有副作用的工具只汇报将要做什么，不落盘
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            granted_permissions: default_granted_permissions(),
            allowed_categories: Vec::new(),
            dry_run: false,
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_granted_permissions() -> Vec<String> {
    vec!["fs_read".into()]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            loop_: LoopSection::default(),
            context: ContextSection::default(),
            tools: ToolsSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HORNET__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HORNET__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HORNET")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.loop_.max_steps, 20);
        assert_eq!(cfg.context.max_recent_results, 10);
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
        assert_eq!(cfg.tools.granted_permissions, vec!["fs_read".to_string()]);
        assert!(cfg.tools.allowed_categories.is_empty());
        assert!(!cfg.tools.dry_run);
    }
}
