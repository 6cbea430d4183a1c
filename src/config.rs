//! Server registry — deserialization and validation.
//!
//! The registry (`servers.yaml`) maps logical server identifiers to launch
//! specifications: a container image (or direct executable), command vector,
//! environment map, idle timeout, and the static tool descriptors advertised
//! for that server. The registry is read-only after load — anything dynamic
//! (process state, timestamps) lives in the pool, never here.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Idle timeout applied when a server entry does not set one, in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_call_timeout_secs() -> u64 {
    120
}

/// The full server registry, keyed by logical identifier.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Registry {
    pub servers: HashMap<String, ServerSpec>,
}

/// Launch specification for a single managed server.
///
/// Exactly one of `image` (run under `docker run -i --rm`) or `executable`
/// (spawned directly) must be set. Immutable once read from the registry.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSpec {
    /// Container image to run with `docker run -i --rm`.
    pub image: Option<String>,
    /// Direct executable, for servers that run unconfined.
    pub executable: Option<String>,
    /// Argument vector appended after the image or executable.
    #[serde(default)]
    pub command: Vec<String>,
    /// Environment variables passed to the subprocess exactly as declared.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Human-readable description of the server.
    #[serde(default)]
    pub description: String,
    /// Seconds of disuse after which the process is reclaimed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// MCP handshake timeout in seconds.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Per-call round-trip timeout in seconds.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Tools this server advertises, served from the registry without
    /// touching the process.
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

/// Static description of one tool offered by a registered server.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON-Schema-like parameter object.
    #[serde(default = "empty_schema")]
    pub parameters: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Registry-level tool listing entry: a tool plus the server that owns it.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub server: String,
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl Registry {
    /// Load and validate a registry from a YAML file.
    pub async fn load(path: &Path) -> crate::Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::Registry(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a registry from a YAML string.
    pub fn from_yaml(content: &str) -> crate::Result<Self> {
        let registry: Registry = serde_yaml::from_str(content)
            .map_err(|e| GatewayError::Registry(e.to_string()))?;
        registry.validate()?;
        Ok(registry)
    }

    /// Look up a server spec by logical identifier.
    pub fn get(&self, id: &str) -> Option<&ServerSpec> {
        self.servers.get(id)
    }

    /// Flatten the registry into one tool list, sorted by (server, name)
    /// for deterministic output.
    pub fn tool_descriptors(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .servers
            .iter()
            .flat_map(|(id, spec)| {
                spec.tools.iter().map(|t| ToolDescriptor {
                    server: id.clone(),
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                })
            })
            .collect();
        tools.sort_by(|a, b| (&a.server, &a.name).cmp(&(&b.server, &b.name)));
        tools
    }

    /// Validate the registry, failing fast before any process is spawned.
    pub fn validate(&self) -> crate::Result<()> {
        for (id, spec) in &self.servers {
            if id.is_empty()
                || !id
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
            {
                return Err(GatewayError::InvalidConfig(
                    id.clone(),
                    "server id must be non-empty alphanumeric with hyphens or underscores"
                        .to_string(),
                ));
            }

            match (&spec.image, &spec.executable) {
                (None, None) => {
                    return Err(GatewayError::InvalidConfig(
                        id.clone(),
                        "server requires either 'image' or 'executable'".to_string(),
                    ));
                }
                (Some(_), Some(_)) => {
                    return Err(GatewayError::InvalidConfig(
                        id.clone(),
                        "server must set only one of 'image' or 'executable'".to_string(),
                    ));
                }
                _ => {}
            }

            if let Some(image) = &spec.image {
                if image.is_empty() {
                    return Err(GatewayError::InvalidConfig(
                        id.clone(),
                        "'image' must be non-empty".to_string(),
                    ));
                }
            }
            if let Some(executable) = &spec.executable {
                if executable.is_empty() {
                    return Err(GatewayError::InvalidConfig(
                        id.clone(),
                        "'executable' must be non-empty".to_string(),
                    ));
                }
            }

            for tool in &spec.tools {
                if tool.name.is_empty() {
                    return Err(GatewayError::InvalidConfig(
                        id.clone(),
                        "tool name must be non-empty".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_yaml(yaml: &str) -> crate::Result<Registry> {
        Registry::from_yaml(yaml)
    }

    #[test]
    fn test_valid_image_config() {
        let registry = parse_yaml(
            r#"
            web-search:
              image: mcp/web-search:latest
              command: ["python", "server.py"]
              description: Web search tools
              tools:
                - name: search
                  description: Search the web
                  parameters:
                    type: object
                    properties:
                      query: { type: string }
                    required: [query]
            "#,
        )
        .unwrap();
        let spec = registry.get("web-search").unwrap();
        assert_eq!(spec.image.as_deref(), Some("mcp/web-search:latest"));
        assert_eq!(spec.command, vec!["python", "server.py"]);
        assert_eq!(spec.idle_timeout, DEFAULT_IDLE_TIMEOUT_SECS);
        assert_eq!(spec.tools.len(), 1);
    }

    #[test]
    fn test_valid_executable_config() {
        let registry = parse_yaml(
            r#"
            local:
              executable: /usr/local/bin/mcp-server
              idle_timeout: 60
            "#,
        )
        .unwrap();
        let spec = registry.get("local").unwrap();
        assert_eq!(spec.executable.as_deref(), Some("/usr/local/bin/mcp-server"));
        assert_eq!(spec.idle_timeout, 60);
    }

    #[test]
    fn test_missing_image_and_executable() {
        let result = parse_yaml(
            r#"
            broken:
              command: ["run"]
            "#,
        );
        assert!(
            matches!(result, Err(GatewayError::InvalidConfig(id, msg)) if id == "broken" && msg.contains("image")),
        );
    }

    #[test]
    fn test_image_and_executable_both_set() {
        let result = parse_yaml(
            r#"
            both:
              image: mcp/thing
              executable: /bin/thing
            "#,
        );
        assert!(
            matches!(result, Err(GatewayError::InvalidConfig(id, msg)) if id == "both" && msg.contains("only one")),
        );
    }

    #[test]
    fn test_invalid_id_rejected() {
        let result = parse_yaml(
            r#"
            "bad id!":
              image: mcp/thing
            "#,
        );
        assert!(matches!(result, Err(GatewayError::InvalidConfig(..))));
    }

    #[test]
    fn test_empty_tool_name_rejected() {
        let result = parse_yaml(
            r#"
            docs:
              image: mcp/docs
              tools:
                - name: ""
            "#,
        );
        assert!(
            matches!(result, Err(GatewayError::InvalidConfig(id, msg)) if id == "docs" && msg.contains("tool name")),
        );
    }

    #[test]
    fn test_invalid_yaml_is_registry_error() {
        let result = parse_yaml("this: is: not: valid: yaml:");
        assert!(matches!(result, Err(GatewayError::Registry(_))));
    }

    #[test]
    fn test_environment_preserved_verbatim() {
        let registry = parse_yaml(
            r#"
            gh:
              image: mcp/github
              environment:
                GITHUB_TOKEN: literal-token-value
            "#,
        )
        .unwrap();
        let spec = registry.get("gh").unwrap();
        assert_eq!(
            spec.environment.get("GITHUB_TOKEN").unwrap(),
            "literal-token-value"
        );
    }

    #[test]
    fn test_tool_descriptors_sorted() {
        let registry = parse_yaml(
            r#"
            zeta:
              image: mcp/zeta
              tools:
                - name: z_tool
                - name: a_tool
            alpha:
              image: mcp/alpha
              tools:
                - name: m_tool
            "#,
        )
        .unwrap();
        let tools = registry.tool_descriptors();
        let names: Vec<(String, String)> = tools
            .into_iter()
            .map(|t| (t.server, t.name))
            .collect();
        assert_eq!(
            names,
            vec![
                ("alpha".to_string(), "m_tool".to_string()),
                ("zeta".to_string(), "a_tool".to_string()),
                ("zeta".to_string(), "z_tool".to_string()),
            ]
        );
    }

    #[test]
    fn test_tool_default_schema() {
        let registry = parse_yaml(
            r#"
            docs:
              image: mcp/docs
              tools:
                - name: lookup
            "#,
        )
        .unwrap();
        let tools = registry.tool_descriptors();
        assert_eq!(tools[0].parameters["type"], "object");
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let result = Registry::load(Path::new("/nonexistent/servers.yaml")).await;
        assert!(matches!(result, Err(GatewayError::Registry(_))));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        use std::io::Write;
        let mut temp = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(
            temp,
            r#"
docs:
  image: mcp/docs
  idle_timeout: 120
"#
        )
        .expect("write temp file");

        let registry = Registry::load(temp.path()).await.unwrap();
        assert_eq!(registry.get("docs").unwrap().idle_timeout, 120);
    }
}
