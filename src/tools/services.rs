//! 各服务的工具宿主启动参数与启动器
//!
//! notion / filesystem / playwright / postgres 通过子进程启动，github 走 HTTP 端点；
//! 缺少必要键时返回 config-missing，未知服务返回 config-invalid。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::BenchError;
use crate::tools::mcp::{HttpSpec, HttpToolHost, StdioSpec, StdioToolHost};
use crate::tools::ToolHost;

/// 服务配置：键值对（来自 [services.<name>] 与状态管理器，如 test_directory）
pub type ServiceConfig = HashMap<String, String>;

const GITHUB_MCP_URL: &str = "https://api.githubcopilot.com/mcp/";
const NOTION_VERSION: &str = "2022-06-28";

#[derive(Debug, Clone, PartialEq)]
pub enum HostSpec {
    Stdio(StdioSpec),
    Http(HttpSpec),
}

/// 读取配置键，未配置时回退到环境变量
fn lookup(cfg: &ServiceConfig, key: &str, env_var: Option<&str>) -> Option<String> {
    cfg.get(key)
        .cloned()
        .or_else(|| env_var.and_then(|v| std::env::var(v).ok()))
        .filter(|v| !v.trim().is_empty())
}

fn required(
    cfg: &ServiceConfig,
    key: &str,
    env_var: Option<&str>,
    what: &str,
) -> Result<String, BenchError> {
    lookup(cfg, key, env_var)
        .ok_or_else(|| BenchError::ConfigMissing(format!("{what} ({key}) is required")))
}

fn npx(args: &[&str]) -> StdioSpec {
    StdioSpec {
        command: "npx".to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// 计算服务的工具宿主启动参数
pub fn launch_spec(service: &str, cfg: &ServiceConfig) -> Result<HostSpec, BenchError> {
    match service {
        "notion" => {
            let key = required(cfg, "notion_key", Some("NOTION_API_KEY"), "Notion API key")?;
            let mut spec = npx(&["-y", "@notionhq/notion-mcp-server"]);
            let headers = serde_json::json!({
                "Authorization": format!("Bearer {key}"),
                "Notion-Version": NOTION_VERSION,
            });
            spec.env
                .insert("OPENAPI_MCP_HEADERS".to_string(), headers.to_string());
            Ok(HostSpec::Stdio(spec))
        }
        "filesystem" => {
            let dir = required(cfg, "test_directory", None, "Test directory")?;
            Ok(HostSpec::Stdio(npx(&[
                "-y",
                "@modelcontextprotocol/server-filesystem",
                &dir,
            ])))
        }
        "playwright" | "playwright_webarena" => {
            let browser = lookup(cfg, "browser", None).unwrap_or_else(|| "chromium".to_string());
            let headless = lookup(cfg, "headless", None)
                .map(|v| !matches!(v.to_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or(true);
            let viewport = lookup(cfg, "viewport", None).unwrap_or_else(|| "1280,720".to_string());
            let mut args = vec!["-y", "@playwright/mcp@latest"];
            if headless {
                args.push("--headless");
            }
            args.extend([
                "--isolated",
                "--no-sandbox",
                "--browser",
                browser.as_str(),
                "--viewport-size",
                viewport.as_str(),
            ]);
            Ok(HostSpec::Stdio(npx(&args)))
        }
        "postgres" => {
            let host = lookup(cfg, "host", None).unwrap_or_else(|| "localhost".to_string());
            let port = lookup(cfg, "port", None).unwrap_or_else(|| "5432".to_string());
            let user = lookup(cfg, "username", Some("POSTGRES_USERNAME"));
            let password = lookup(cfg, "password", Some("POSTGRES_PASSWORD"));
            let database = lookup(cfg, "current_database", None).or_else(|| lookup(cfg, "database", None));
            let (Some(user), Some(password), Some(database)) = (user, password, database) else {
                return Err(BenchError::ConfigMissing(
                    "PostgreSQL username, password and database are required".to_string(),
                ));
            };
            let mut env = HashMap::new();
            env.insert(
                "DATABASE_URI".to_string(),
                format!("postgresql://{user}:{password}@{host}:{port}/{database}"),
            );
            Ok(HostSpec::Stdio(StdioSpec {
                command: "pipx".to_string(),
                args: vec![
                    "run".to_string(),
                    "postgres-mcp".to_string(),
                    "--access-mode=unrestricted".to_string(),
                ],
                env,
                workdir: None,
            }))
        }
        "github" => {
            let token = required(cfg, "github_token", Some("GITHUB_TOKEN"), "GitHub token")?;
            let url = lookup(cfg, "url", None).unwrap_or_else(|| GITHUB_MCP_URL.to_string());
            Ok(HostSpec::Http(HttpSpec {
                url,
                headers: vec![
                    ("Authorization".to_string(), format!("Bearer {token}")),
                    (
                        "User-Agent".to_string(),
                        format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
                    ),
                ],
            }))
        }
        other => Err(BenchError::ConfigInvalid(format!(
            "Unsupported service: {other}"
        ))),
    }
}

/// 为任务打开工具宿主会话
#[async_trait]
pub trait ToolHostLauncher: Send + Sync {
    async fn launch(
        &self,
        service: &str,
        cfg: &ServiceConfig,
    ) -> Result<Box<dyn ToolHost>, BenchError>;
}

/// 按服务启动 MCP 工具宿主（子进程或 HTTP）
#[derive(Debug, Clone)]
pub struct McpLauncher {
    startup_timeout: Duration,
}

impl McpLauncher {
    pub fn new(startup_timeout: Duration) -> Self {
        Self { startup_timeout }
    }
}

impl Default for McpLauncher {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

#[async_trait]
impl ToolHostLauncher for McpLauncher {
    async fn launch(
        &self,
        service: &str,
        cfg: &ServiceConfig,
    ) -> Result<Box<dyn ToolHost>, BenchError> {
        let host: Box<dyn ToolHost> = match launch_spec(service, cfg)? {
            HostSpec::Stdio(spec) => {
                Box::new(StdioToolHost::start(service, &spec, self.startup_timeout).await?)
            }
            HostSpec::Http(spec) => {
                Box::new(HttpToolHost::connect(service, &spec, self.startup_timeout).await?)
            }
        };
        Ok(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(pairs: &[(&str, &str)]) -> ServiceConfig {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_filesystem_spec() {
        let spec = launch_spec("filesystem", &cfg(&[("test_directory", "/tmp/t1")])).unwrap();
        match spec {
            HostSpec::Stdio(s) => {
                assert_eq!(s.command, "npx");
                assert_eq!(s.args.last().map(String::as_str), Some("/tmp/t1"));
            }
            HostSpec::Http(_) => panic!("Expected stdio"),
        }
        let err = launch_spec("filesystem", &cfg(&[])).unwrap_err();
        assert!(matches!(err, BenchError::ConfigMissing(_)));
    }

    #[test]
    fn test_notion_headers_env() {
        let spec = launch_spec("notion", &cfg(&[("notion_key", "secret")])).unwrap();
        let HostSpec::Stdio(s) = spec else {
            panic!("Expected stdio");
        };
        let headers: serde_json::Value =
            serde_json::from_str(&s.env["OPENAPI_MCP_HEADERS"]).unwrap();
        assert_eq!(headers["Authorization"], "Bearer secret");
        assert_eq!(headers["Notion-Version"], NOTION_VERSION);
    }

    #[test]
    fn test_playwright_flags() {
        let HostSpec::Stdio(s) = launch_spec("playwright", &cfg(&[("headless", "false")])).unwrap() else {
            panic!("Expected stdio");
        };
        assert!(!s.args.contains(&"--headless".to_string()));
        assert!(s.args.contains(&"--isolated".to_string()));
        assert!(s.args.contains(&"1280,720".to_string()));
    }

    #[test]
    fn test_postgres_uri() {
        let HostSpec::Stdio(s) = launch_spec(
            "postgres",
            &cfg(&[("username", "u"), ("password", "p"), ("database", "db")]),
        )
        .unwrap() else {
            panic!("Expected stdio");
        };
        assert_eq!(s.command, "pipx");
        assert_eq!(s.env["DATABASE_URI"], "postgresql://u:p@localhost:5432/db");
    }

    #[test]
    fn test_github_http_and_unknown_service() {
        let HostSpec::Http(h) = launch_spec("github", &cfg(&[("github_token", "t")])).unwrap() else {
            panic!("Expected http");
        };
        assert_eq!(h.url, GITHUB_MCP_URL);
        assert!(h.headers.iter().any(|(k, v)| k == "Authorization" && v == "Bearer t"));

        let err = launch_spec("jira", &cfg(&[])).unwrap_err();
        assert!(matches!(err, BenchError::ConfigInvalid(_)));
    }
}
