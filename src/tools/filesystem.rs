//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸）；
//! FsReadTool / FsWriteTool / FsListTool 基于 SafeFs 提供读 / 写 / 列目录能力，
//! 分别声明 fs_read / fs_write 权限。写入在干跑模式下只汇报，不落盘。
//! 输入 Schema 用 schemars 从参数结构体派生，保证与实际解析一致。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

use crate::tools::registry::Tool;
use crate::tools::types::{ExecutionContext, FieldError, Permission, ToolCategory};

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 校验已存在路径在沙箱内
    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let path = path.trim_start_matches("./");
        let full = self.root_dir.join(path);
        let canonical = full
            .canonicalize()
            .map_err(|_| format!("Path not found: {}", path))?;
        let root_canon = self
            .root_dir
            .canonicalize()
            .unwrap_or_else(|_| self.root_dir.clone());
        if canonical.starts_with(root_canon) {
            Ok(canonical)
        } else {
            Err(format!("Path escapes workspace root: {}", path)) // 如 ../../etc/passwd
        }
    }

    /// 写入目标可能不存在：校验父目录在沙箱内后拼上文件名
    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, String> {
        let path = path.trim_start_matches("./");
        let full = self.root_dir.join(path);
        let file_name = full
            .file_name()
            .ok_or_else(|| format!("Not a file path: {}", path))?
            .to_os_string();
        let parent = full
            .parent()
            .ok_or_else(|| format!("Not a file path: {}", path))?;
        let parent_canon = parent
            .canonicalize()
            .map_err(|_| format!("Parent directory not found: {}", path))?;
        let root_canon = self
            .root_dir
            .canonicalize()
            .unwrap_or_else(|_| self.root_dir.clone());
        if parent_canon.starts_with(root_canon) {
            Ok(parent_canon.join(file_name))
        } else {
            Err(format!("Path escapes workspace root: {}", path))
        }
    }

    pub fn read_file(&self, path: &str) -> Result<String, String> {
        let resolved = self.resolve(path)?;
        std::fs::read_to_string(&resolved).map_err(|e| format!("Read failed: {}", e))
    }

    pub fn write_file(&self, path: &str, content: &str) -> Result<PathBuf, String> {
        let resolved = self.resolve_for_write(path)?;
        std::fs::write(&resolved, content).map_err(|e| format!("Write failed: {}", e))?;
        Ok(resolved)
    }

    /// 非递归列目录；隐藏项跳过，目录名带 / 后缀
    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, String> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&base).map_err(|e| format!("List failed: {}", e))? {
            let e = e.map_err(|e| e.to_string())?;
            let name = e.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                let ty = if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    "/"
                } else {
                    ""
                };
                entries.push(format!("{}{}", name, ty));
            }
        }
        entries.sort();
        Ok(entries)
    }

    /// 递归列目录（相对根的路径），隐藏项跳过
    pub fn list_recursive(&self, path: &str) -> Result<Vec<String>, String> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut entries = Vec::new();
        for entry in walkdir::WalkDir::new(&base)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'))
        {
            let entry = entry.map_err(|e| format!("List failed: {}", e))?;
            let rel = entry
                .path()
                .strip_prefix(&base)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            let ty = if entry.file_type().is_dir() { "/" } else { "" };
            entries.push(format!("{}{}", rel, ty));
        }
        entries.sort();
        Ok(entries)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReadArgs {
    /// 相对工作区根的文件路径
    path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct WriteArgs {
    /// 相对工作区根的文件路径
    path: String,
    /// 要写入的完整内容
    content: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ListArgs {
    /// 相对工作区根的目录路径，默认 "."
    path: Option<String>,
    /// 是否递归列出子目录
    recursive: Option<bool>,
}

fn schema_value<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| serde_json::json!({}))
}

/// 读文件工具：需要 fs_read 权限
pub struct FsReadTool {
    fs: SafeFs,
}

impl FsReadTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for FsReadTool {
    fn name(&self) -> &str {
        "fs_read"
    }

    fn description(&self) -> &str {
        "Read file contents. Args: {\"path\": \"file path relative to workspace\"}"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::from("filesystem")
    }

    fn required_permissions(&self) -> Vec<Permission> {
        vec![Permission::from("fs_read")]
    }

    fn input_schema(&self) -> Value {
        schema_value::<ReadArgs>()
    }

    fn validate(&self, input: &Value, _ctx: &ExecutionContext) -> Result<(), Vec<FieldError>> {
        if input.get("path").and_then(|v| v.as_str()).is_none() {
            return Err(vec![FieldError::new("path", "required string field")]);
        }
        Ok(())
    }

    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> Result<Value, String> {
        let args: ReadArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        tracing::info!(path = %args.path, "fs_read tool execute");
        let content = self.fs.read_file(&args.path)?;
        Ok(serde_json::json!({ "path": args.path, "content": content }))
    }
}

/// 写文件工具：需要 fs_write 权限，有副作用；干跑模式下只汇报不落盘
pub struct FsWriteTool {
    fs: SafeFs,
}

impl FsWriteTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for FsWriteTool {
    fn name(&self) -> &str {
        "fs_write"
    }

    fn description(&self) -> &str {
        "Write a file (overwrite). Args: {\"path\": \"...\", \"content\": \"...\"}"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::from("filesystem")
    }

    fn required_permissions(&self) -> Vec<Permission> {
        vec![Permission::from("fs_write")]
    }

    fn has_side_effects(&self) -> bool {
        true
    }

    fn input_schema(&self) -> Value {
        schema_value::<WriteArgs>()
    }

    fn validate(&self, input: &Value, _ctx: &ExecutionContext) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();
        if input.get("path").and_then(|v| v.as_str()).is_none() {
            errors.push(FieldError::new("path", "required string field"));
        }
        if input.get("content").and_then(|v| v.as_str()).is_none() {
            errors.push(FieldError::new("content", "required string field"));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> Result<Value, String> {
        let args: WriteArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        tracing::info!(path = %args.path, dry_run = ctx.dry_run, "fs_write tool execute");
        if ctx.dry_run {
            return Ok(serde_json::json!({
                "path": args.path,
                "dry_run": true,
                "bytes": args.content.len(),
            }));
        }
        self.fs.write_file(&args.path, &args.content)?;
        Ok(serde_json::json!({
            "path": args.path,
            "bytes": args.content.len(),
        }))
    }
}

/// 列目录工具：需要 fs_read 权限；recursive=true 时递归
pub struct FsListTool {
    fs: SafeFs,
}

impl FsListTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for FsListTool {
    fn name(&self) -> &str {
        "fs_list"
    }

    fn description(&self) -> &str {
        "List directory. Args: {\"path\": \"dir, default '.'\", \"recursive\": false}"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::from("filesystem")
    }

    fn required_permissions(&self) -> Vec<Permission> {
        vec![Permission::from("fs_read")]
    }

    fn input_schema(&self) -> Value {
        schema_value::<ListArgs>()
    }

    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> Result<Value, String> {
        let args: ListArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        let path = args.path.unwrap_or_else(|| ".".to_string());
        tracing::info!(path = %path, "fs_list tool execute");
        let entries = if args.recursive.unwrap_or(false) {
            self.fs.list_recursive(&path)?
        } else {
            self.fs.list_dir(&path)?
        };
        Ok(serde_json::json!(entries))
    }
}
