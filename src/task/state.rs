//! 状态管理：为每个任务准备独占资源，并在 Cleanup 时释放
//!
//! - FilesystemStateManager：把模板目录复制到唯一命名的沙箱目录，通过 `test_directory` 交给工具宿主
//! - NoopStateManager：无需准备外部状态的服务；共享浏览器会话的服务要求串行
//! 传入预置资源 id 时跳过复制，直接使用该资源，Cleanup 不删除它。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use walkdir::WalkDir;

use crate::config::AppConfig;
use crate::core::BenchError;
use crate::task::Task;
use crate::tools::ServiceConfig;

/// Setup 分配给任务的资源
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskResources {
    pub resource_id: String,
    /// 文件系统沙箱位置
    pub location: Option<PathBuf>,
    /// 合并进服务配置后交给工具宿主启动器
    pub service_config: ServiceConfig,
    /// 验证脚本的额外环境变量
    pub verification_env: HashMap<String, String>,
    /// 预置资源不由本进程删除
    pub pre_provisioned: bool,
}

#[async_trait]
pub trait StateManager: Send + Sync {
    /// 为 true 时工作池宽度固定为 1
    fn requires_sequential(&self) -> bool {
        false
    }

    async fn set_up(&self, task: &mut Task) -> Result<(), BenchError>;

    async fn clean_up(&self, task: &mut Task) -> Result<(), BenchError>;
}

#[derive(Clone, Debug, Default)]
pub struct NoopStateManager {
    sequential: bool,
    resource_id: Option<String>,
}

impl NoopStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }

    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }
}

#[async_trait]
impl StateManager for NoopStateManager {
    fn requires_sequential(&self) -> bool {
        self.sequential
    }

    async fn set_up(&self, task: &mut Task) -> Result<(), BenchError> {
        if let Some(id) = &self.resource_id {
            task.resources = Some(TaskResources {
                resource_id: id.clone(),
                service_config: HashMap::from([("resource_id".to_string(), id.clone())]),
                pre_provisioned: true,
                ..Default::default()
            });
        }
        Ok(())
    }

    async fn clean_up(&self, task: &mut Task) -> Result<(), BenchError> {
        task.resources = None;
        Ok(())
    }
}

/// 文件系统沙箱
#[derive(Clone, Debug)]
pub struct FilesystemStateManager {
    work_root: PathBuf,
    template_dir: Option<PathBuf>,
    pre_provisioned: Option<PathBuf>,
}

impl FilesystemStateManager {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            template_dir: None,
            pre_provisioned: None,
        }
    }

    pub fn with_template(mut self, dir: impl Into<PathBuf>) -> Self {
        self.template_dir = Some(dir.into());
        self
    }

    /// 使用已存在的目录作为沙箱
    pub fn with_resource_id(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pre_provisioned = Some(dir.into());
        self
    }

    fn resources_for(dir: &Path, pre_provisioned: bool) -> TaskResources {
        let path = dir.display().to_string();
        TaskResources {
            resource_id: path.clone(),
            location: Some(dir.to_path_buf()),
            service_config: HashMap::from([("test_directory".to_string(), path.clone())]),
            verification_env: HashMap::from([("FILESYSTEM_TEST_DIR".to_string(), path)]),
            pre_provisioned,
        }
    }
}

fn slug(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// 递归复制目录
fn copy_tree(from: &Path, to: &Path) -> Result<(), BenchError> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|e| BenchError::StateSetup(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| BenchError::StateSetup(e.to_string()))?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[async_trait]
impl StateManager for FilesystemStateManager {
    async fn set_up(&self, task: &mut Task) -> Result<(), BenchError> {
        if let Some(dir) = &self.pre_provisioned {
            if !dir.is_dir() {
                return Err(BenchError::StateSetup(format!(
                    "pre-provisioned directory {} does not exist",
                    dir.display()
                )));
            }
            task.resources = Some(Self::resources_for(dir, true));
            return Ok(());
        }

        let unique = uuid::Uuid::new_v4().simple().to_string();
        let dir = self.work_root.join(format!(
            "{}__{}__{}",
            slug(&task.category),
            slug(&task.task_id),
            &unique[..8]
        ));
        if dir.exists() {
            return Err(BenchError::StateSetup(format!(
                "sandbox {} already exists",
                dir.display()
            )));
        }

        let template = self.template_dir.clone();
        let target = dir.clone();
        tokio::task::spawn_blocking(move || -> Result<(), BenchError> {
            match template {
                Some(template) if !template.is_dir() => Err(BenchError::StateSetup(format!(
                    "template directory {} does not exist",
                    template.display()
                ))),
                Some(template) => copy_tree(&template, &target),
                None => Ok(std::fs::create_dir_all(&target)?),
            }
        })
        .await
        .map_err(|e| BenchError::StateSetup(e.to_string()))?
        .map_err(|e| match e {
            BenchError::StateSetup(_) => e,
            other => BenchError::StateSetup(other.to_string()),
        })?;

        tracing::info!(task = %task.name(), dir = %dir.display(), "Sandbox prepared");
        task.resources = Some(Self::resources_for(&dir, false));
        Ok(())
    }

    async fn clean_up(&self, task: &mut Task) -> Result<(), BenchError> {
        let Some(resources) = task.resources.take() else {
            return Ok(());
        };
        if resources.pre_provisioned {
            return Ok(());
        }
        if let Some(dir) = resources.location {
            if dir.exists() {
                tokio::fs::remove_dir_all(&dir).await?;
                tracing::info!(task = %task.name(), dir = %dir.display(), "Sandbox removed");
            }
        }
        Ok(())
    }
}

/// 按服务选择状态管理器
pub fn state_manager_for(
    service: &str,
    cfg: &AppConfig,
    resource_id: Option<String>,
) -> Box<dyn StateManager> {
    match service {
        "filesystem" => {
            let service_cfg = cfg.service(service);
            let work_root = service_cfg
                .get("work_root")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("taskbench"));
            let mut manager = FilesystemStateManager::new(work_root);
            if let Some(template) = service_cfg.get("template_dir") {
                manager = manager.with_template(template);
            }
            if let Some(id) = resource_id {
                manager = manager.with_resource_id(id);
            }
            Box::new(manager)
        }
        other => {
            let mut manager = NoopStateManager::new();
            if other.starts_with("playwright") {
                manager = manager.sequential();
            }
            if let Some(id) = resource_id {
                manager = manager.with_resource_id(id);
            }
            Box::new(manager)
        }
    }
}
