//! Connecting to the cluster, either from a kubeconfig file or from the in-cluster identity.

use std::path::Path;

use kube_client::{
    config::{InClusterError, KubeConfigOptions, Kubeconfig, KubeconfigError},
    Client, Config,
};

use crate::logger::Logger;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("error reading in-cluster configuration")]
    InCluster(#[source] InClusterError),
    #[error("error reading kubeconfig")]
    Kubeconfig(#[source] KubeconfigError),
    #[error("error creating client")]
    Client(#[source] kube_client::Error),
}

/// Creates a client from the kubeconfig at `path`,
/// or from the service account the process runs as if `path` is `None`.
pub async fn connect(path: Option<&Path>, logger: &dyn Logger) -> Result<Client, ConnectError> {
    let config = match path {
        None => {
            logger.info(format_args!("Using in-cluster configuration"));
            Config::incluster().map_err(ConnectError::InCluster)?
        }
        Some(path) => {
            logger.info(format_args!("Using configuration file: {}", path.display()));
            let kubeconfig = Kubeconfig::read_from(path).map_err(ConnectError::Kubeconfig)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(ConnectError::Kubeconfig)?
        }
    };
    Client::try_from(config).map_err(ConnectError::Client)
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn cause_is_left_to_the_source_chain() {
        let err = ConnectError::Kubeconfig(KubeconfigError::CurrentContextNotSet);
        assert_eq!(err.to_string(), "error reading kubeconfig");
        let source = err.source().map(ToString::to_string);
        assert_eq!(source, Some(KubeconfigError::CurrentContextNotSet.to_string()));
    }
}
