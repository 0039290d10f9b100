//! Cluster Access Factory
//!
//! Turns a `kubeconfig` stack output into a typed client bundle. The output
//! is either a YAML/JSON string or a structured document; both are accepted.
//! EKS kubeconfigs authenticate through an exec plugin whose arguments carry
//! the cluster name, which is how probes match clusters to stack resources.

mod client;

pub use client::{ClusterClient, KubeClusterClient, Workload, WorkloadKind};
#[cfg(test)]
pub use client::MockClusterClient;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{Error, Result};

/// Connect timeout for probe clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout for probe clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Exec-plugin flags that precede the cluster name
const CLUSTER_NAME_FLAGS: &[&str] = &["--cluster-name", "--cluster-id", "-i"];

// =============================================================================
// Kubeconfig document
// =============================================================================

/// A cluster entry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEntry {
    /// API server URL
    pub server: String,
    /// Base64 CA bundle
    #[serde(
        rename = "certificate-authority-data",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub certificate_authority_data: Option<String>,
    /// Skip TLS verification
    #[serde(
        rename = "insecure-skip-tls-verify",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub insecure_skip_tls_verify: Option<bool>,
}

/// Named cluster entry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCluster {
    /// Entry name
    pub name: String,
    /// Cluster details
    pub cluster: ClusterEntry,
}

/// A context entry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Referenced cluster entry
    pub cluster: String,
    /// Referenced user entry
    #[serde(default)]
    pub user: String,
    /// Default namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Named context entry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedContext {
    /// Entry name
    pub name: String,
    /// Context details
    pub context: ContextEntry,
}

/// Environment variable of an exec plugin
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecEnvVar {
    /// Variable name
    pub name: String,
    /// Variable value
    pub value: String,
}

/// Exec credential plugin
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    /// client.authentication.k8s.io version
    #[serde(rename = "apiVersion", default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Plugin command, e.g. `aws`
    pub command: String,
    /// Plugin arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Plugin environment (`AWS_PROFILE`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<ExecEnvVar>>,
}

/// A user entry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    /// Bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Exec credential plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecConfig>,
    /// Base64 client certificate
    #[serde(
        rename = "client-certificate-data",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_certificate_data: Option<String>,
    /// Base64 client key
    #[serde(
        rename = "client-key-data",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_key_data: Option<String>,
}

/// Named user entry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedUser {
    /// Entry name
    pub name: String,
    /// User details
    #[serde(default)]
    pub user: UserEntry,
}

/// The parts of a kubeconfig the harness inspects
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeconfigDocument {
    /// Always `v1`
    #[serde(rename = "apiVersion", default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Always `Config`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Cluster entries
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    /// Context entries
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    /// User entries
    #[serde(default)]
    pub users: Vec<NamedUser>,
    /// Selected context
    #[serde(
        rename = "current-context",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub current_context: Option<String>,
}

/// How the client authenticates
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMaterial {
    /// Static bearer token
    Token(String),
    /// Exec credential plugin
    Exec(ExecConfig),
    /// Client certificate and key
    ClientCertificate {
        /// Base64 certificate
        certificate: String,
        /// Base64 key
        key: String,
    },
    /// No credentials
    Anonymous,
}

impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMaterial::Token(_) => f.write_str("Token([redacted])"),
            AuthMaterial::Exec(exec) => f
                .debug_struct("Exec")
                .field("command", &exec.command)
                .field("args", &exec.args)
                .finish(),
            AuthMaterial::ClientCertificate { .. } => f.write_str("ClientCertificate([redacted])"),
            AuthMaterial::Anonymous => f.write_str("Anonymous"),
        }
    }
}

impl KubeconfigDocument {
    /// Parse YAML or JSON text
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::kubeconfig(format!("invalid kubeconfig: {e}")))
    }

    /// Serialize back to YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// The selected context, falling back to the first one
    pub fn active_context(&self) -> Result<&ContextEntry> {
        let named = match &self.current_context {
            Some(name) if !name.is_empty() => self.contexts.iter().find(|c| &c.name == name),
            _ => self.contexts.first(),
        };
        named
            .map(|c| &c.context)
            .ok_or_else(|| Error::kubeconfig("kubeconfig has no usable context"))
    }

    /// API server URL of the active context
    pub fn server(&self) -> Result<&str> {
        let context = self.active_context()?;
        self.clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| c.cluster.server.as_str())
            .ok_or_else(|| {
                Error::kubeconfig(format!("cluster {:?} not found in kubeconfig", context.cluster))
            })
    }

    /// Credentials of the active context
    pub fn auth(&self) -> Result<AuthMaterial> {
        let context = self.active_context()?;
        let user = match self.users.iter().find(|u| u.name == context.user) {
            Some(u) => &u.user,
            None => return Ok(AuthMaterial::Anonymous),
        };
        if let Some(exec) = &user.exec {
            return Ok(AuthMaterial::Exec(exec.clone()));
        }
        if let Some(token) = &user.token {
            return Ok(AuthMaterial::Token(token.clone()));
        }
        if let (Some(certificate), Some(key)) = (&user.client_certificate_data, &user.client_key_data)
        {
            return Ok(AuthMaterial::ClientCertificate {
                certificate: certificate.clone(),
                key: key.clone(),
            });
        }
        Ok(AuthMaterial::Anonymous)
    }

    /// Cluster name taken from the exec plugin arguments
    pub fn cluster_name(&self) -> Result<String> {
        let exec = match self.auth()? {
            AuthMaterial::Exec(exec) => exec,
            _ => {
                return Err(Error::kubeconfig(
                    "cluster name not found: kubeconfig has no exec provider",
                ))
            }
        };
        exec.args
            .iter()
            .position(|a| CLUSTER_NAME_FLAGS.contains(&a.as_str()))
            .and_then(|i| exec.args.get(i + 1))
            .cloned()
            .ok_or_else(|| {
                Error::kubeconfig("cluster name not found in kubeconfig exec provider args")
            })
    }
}

/// Text of a kubeconfig stack output
///
/// Strings are returned as-is; structured documents are serialized to JSON,
/// which is valid YAML.
pub fn kubeconfig_text(output: &Value) -> Result<String> {
    match output {
        Value::String(s) if !s.trim().is_empty() => Ok(s.clone()),
        Value::Object(_) => Ok(serde_json::to_string(output)?),
        Value::Null => Err(Error::kubeconfig("kubeconfig output is missing")),
        other => Err(Error::kubeconfig(format!(
            "kubeconfig output must be a string or document, got {other}"
        ))),
    }
}

// =============================================================================
// ClusterAccess
// =============================================================================

/// Client bundle for one cluster
#[derive(Clone)]
pub struct ClusterAccess {
    /// Cluster name from the exec plugin, if the kubeconfig carries one
    pub cluster_name: Option<String>,
    /// Parsed kubeconfig
    pub config: KubeconfigDocument,
    /// Serialized kubeconfig, used when handing credentials to scripts
    pub raw: String,
    /// Cluster queries
    pub client: Arc<dyn ClusterClient>,
}

impl fmt::Debug for ClusterAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterAccess")
            .field("cluster_name", &self.cluster_name)
            .field("server", &self.config.server().ok())
            .finish()
    }
}

impl ClusterAccess {
    /// Bundle an already-built client with its kubeconfig
    pub fn with_client(raw: impl Into<String>, client: Arc<dyn ClusterClient>) -> Result<Self> {
        let raw = raw.into();
        let config = KubeconfigDocument::parse(&raw)?;
        config.server()?;
        Ok(Self {
            cluster_name: config.cluster_name().ok(),
            config,
            raw,
            client,
        })
    }

    /// Build access from a kubeconfig stack output
    pub async fn from_output(output: &Value) -> Result<Self> {
        let raw = kubeconfig_text(output)?;
        let client = kube_client(&raw).await?;
        let access = Self::with_client(raw, Arc::new(KubeClusterClient::new(client)))?;
        debug!(
            cluster = ?access.cluster_name,
            server = access.config.server().unwrap_or_default(),
            "Built cluster access"
        );
        Ok(access)
    }

    /// Build access for several kubeconfig outputs, failing on the first bad one
    pub async fn from_outputs(outputs: &[&Value]) -> Result<Vec<Self>> {
        let mut accesses = Vec::with_capacity(outputs.len());
        for (i, output) in outputs.iter().enumerate() {
            let access = Self::from_output(output)
                .await
                .map_err(|e| Error::kubeconfig(format!("kubeconfig #{i}: {e}")))?;
            accesses.push(access);
        }
        Ok(accesses)
    }

    /// Map of cluster name to access; clusters without a name are keyed by server URL
    pub fn by_cluster_name(accesses: Vec<Self>) -> BTreeMap<String, Self> {
        accesses
            .into_iter()
            .map(|a| {
                let key = a
                    .cluster_name
                    .clone()
                    .unwrap_or_else(|| a.config.server().unwrap_or_default().to_string());
                (key, a)
            })
            .collect()
    }
}

/// Turns a kubeconfig stack output into [`ClusterAccess`]
///
/// Validators connect through this seam so they can be exercised without a
/// cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Build access for one kubeconfig output
    async fn connect(&self, output: &Value) -> Result<ClusterAccess>;
}

/// [`ClusterConnector`] that builds real kube clients
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, output: &Value) -> Result<ClusterAccess> {
        ClusterAccess::from_output(output).await
    }
}

/// Install the rustls crypto provider once per process
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Build a kube client from kubeconfig text with the default timeouts
pub async fn kube_client(raw: &str) -> Result<Client> {
    install_crypto_provider();

    let kubeconfig = Kubeconfig::from_yaml(raw)
        .map_err(|e| Error::kubeconfig(format!("failed to parse kubeconfig: {e}")))?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::kubeconfig(format!("failed to load kubeconfig: {e}")))?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    Client::try_from(config)
        .map_err(|e| Error::kubeconfig(format!("failed to create client: {e}")))
}
