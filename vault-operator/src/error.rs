#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TLS material generation failed: {source}")]
    Rcgen {
        #[from]
        source: rcgen::Error,
    },

    #[error("Vault health probe failed: {source}")]
    Probe {
        #[from]
        source: reqwest::Error,
    },

    #[error("etcd cluster did not become ready after {attempts} attempts")]
    EtcdNotReady { attempts: u32 },

    #[error("missing required environment variable: {0}")]
    MissingEnv(&'static str),
}
