use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcscopeError {
    #[error("eBPF error: {0}")]
    EbpfError(String),

    #[error("Failed to load eBPF program: {0}")]
    ProgramLoadFailed(String),

    #[error("Failed to attach eBPF program: {0}")]
    AttachFailed(String),

    #[error("BTF error: {0}")]
    BtfError(String),

    #[error("procfs error: {0}")]
    ProcfsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Unsupported feature on this system: {0}")]
    UnsupportedFeature(String),
}

impl ProcscopeError {
    /// Wraps an agent error, keeping its whole context chain.
    pub fn ebpf(err: anyhow::Error) -> Self {
        Self::EbpfError(format!("{:#}", err))
    }

    pub fn load(err: anyhow::Error) -> Self {
        Self::ProgramLoadFailed(format!("{:#}", err))
    }

    pub fn attach(err: anyhow::Error) -> Self {
        Self::AttachFailed(format!("{:#}", err))
    }

    pub fn btf(err: anyhow::Error) -> Self {
        Self::BtfError(format!("{:#}", err))
    }

    pub fn procfs(err: anyhow::Error) -> Self {
        Self::ProcfsError(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, ProcscopeError>;
