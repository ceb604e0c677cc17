use std::path::Path;

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};

/// Kubernetes client wrapper
pub struct KubeClient {
    /// `None` when running in-cluster without a kubeconfig
    kubeconfig: Option<Kubeconfig>,
    current_context: Option<String>,
}

impl KubeClient {
    /// Load the kubeconfig from `path`, or from the default locations.
    ///
    /// A missing default kubeconfig is not an error: the client then
    /// falls back to the in-cluster service account.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let kubeconfig = match path {
            Some(path) => Some(
                Kubeconfig::read_from(path)
                    .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?,
            ),
            None => match Kubeconfig::read() {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::debug!(error = %e, "no kubeconfig found; assuming in-cluster");
                    None
                }
            },
        };

        let current_context = kubeconfig.as_ref().and_then(|k| k.current_context.clone());

        Ok(Self {
            kubeconfig,
            current_context,
        })
    }

    /// Names of all contexts in the kubeconfig
    pub fn contexts(&self) -> Vec<String> {
        self.kubeconfig
            .iter()
            .flat_map(|k| k.contexts.iter().map(|ctx| ctx.name.clone()))
            .collect()
    }

    /// Get the current context name
    pub fn current_context(&self) -> Option<&str> {
        self.current_context.as_deref()
    }

    /// Default namespace configured for a context (or the current one)
    pub fn context_namespace(&self, context: Option<&str>) -> Option<String> {
        let kubeconfig = self.kubeconfig.as_ref()?;
        let name = context.or(self.current_context.as_deref())?;
        kubeconfig
            .contexts
            .iter()
            .find(|ctx| ctx.name == name)
            .and_then(|ctx| ctx.context.as_ref())
            .and_then(|ctx| ctx.namespace.clone())
    }

    /// Create a kube::Client for a context, or the current context when `None`
    pub async fn connect(&self, context: Option<&str>) -> Result<kube::Client> {
        let config = match &self.kubeconfig {
            Some(kubeconfig) => {
                if let Some(name) = context {
                    if !kubeconfig.contexts.iter().any(|ctx| ctx.name == name) {
                        anyhow::bail!(
                            "Context '{}' not found in kubeconfig (available: {})",
                            name,
                            self.contexts().join(", ")
                        );
                    }
                }

                kube::Config::from_custom_kubeconfig(
                    kubeconfig.clone(),
                    &KubeConfigOptions {
                        context: context.map(str::to_string),
                        ..Default::default()
                    },
                )
                .await
                .with_context(|| {
                    format!(
                        "Failed to create config for context: {}",
                        context.or(self.current_context()).unwrap_or("<current>")
                    )
                })?
            }
            None => {
                if context.is_some() {
                    anyhow::bail!("A context was requested but no kubeconfig could be read");
                }
                kube::Config::incluster().context("Failed to load in-cluster configuration")?
            }
        };

        let client = kube::Client::try_from(config).context("Failed to create Kubernetes client")?;
        Ok(client)
    }
}
