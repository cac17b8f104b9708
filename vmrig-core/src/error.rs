use thiserror::Error;

/// Machine-readable classification of a [`VmrigError`].
///
/// Callers branch on this instead of matching individual variants, so new
/// variants can be added without breaking the recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Declared configuration is invalid or inconsistent with the backend.
    Configuration,
    /// A bounded wait ran out of budget.
    Transient,
    /// A resource already exists and must not be overwritten.
    ResourceConflict,
    /// The virtualization backend rejected or failed an operation.
    Backend,
    /// The run was cancelled by the user or a signal.
    Interrupted,
    /// Local filesystem or process failure.
    Io,
    /// Invariant violation inside the engine.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Transient => "transient",
            ErrorKind::ResourceConflict => "resource_conflict",
            ErrorKind::Backend => "backend",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Io => "io",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

#[derive(Error, Debug)]
pub enum VmrigError {
    #[error("Configuration error in {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Storage pool '{name}' not found; only the default pool is created automatically")]
    StoragePoolNotFound { name: String },

    #[error("Disk device '{device}' is declared twice: {first} and {second}")]
    DuplicateDiskDevice {
        device: String,
        first: String,
        second: String,
    },

    #[error("No free disk device left with prefix '{prefix}'")]
    NoDeviceAvailable { prefix: String },

    #[error(
        "Network '{network}' has DHCP {existing} but the configuration requests DHCP {declared}"
    )]
    NetworkDhcpMismatch {
        network: String,
        existing: &'static str,
        declared: &'static str,
    },

    #[error("Network name '{name}' does not match address {address}: {details}")]
    NetworkNameAndAddressMismatch {
        name: String,
        address: String,
        details: String,
    },

    #[error("Tunnel network for interface {index} requires a port")]
    TunnelPortNotDefined { index: usize },

    #[error("No free bridge name available")]
    NoBridgeAvailable,

    #[error("Volume '{volume}' already exists in pool '{pool}'")]
    DomainVolumeExists { pool: String, volume: String },

    #[error("Domain name '{name}' is already taken")]
    DomainNameExists { name: String },

    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    #[error("Operation '{operation}' was interrupted")]
    Interrupted { operation: String },

    #[error("Backend operation '{operation}' failed: {message}")]
    Backend { operation: String, message: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Invalid operation '{operation}': {reason}")]
    InvalidOperation { operation: String, reason: String },

    #[error("Failed to restore definition of '{domain}' after failed redefine ({cause}): {restore}")]
    RestoreFailed {
        domain: String,
        cause: String,
        restore: String,
    },

    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type VmrigResult<T> = std::result::Result<T, VmrigError>;

impl VmrigError {
    /// Classify this error for recovery and reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmrigError::Configuration { .. }
            | VmrigError::StoragePoolNotFound { .. }
            | VmrigError::DuplicateDiskDevice { .. }
            | VmrigError::NoDeviceAvailable { .. }
            | VmrigError::NetworkDhcpMismatch { .. }
            | VmrigError::NetworkNameAndAddressMismatch { .. }
            | VmrigError::TunnelPortNotDefined { .. }
            | VmrigError::TomlError(_) => ErrorKind::Configuration,
            VmrigError::Timeout { .. } => ErrorKind::Transient,
            VmrigError::DomainVolumeExists { .. }
            | VmrigError::DomainNameExists { .. }
            | VmrigError::NoBridgeAvailable => ErrorKind::ResourceConflict,
            VmrigError::Backend { .. }
            | VmrigError::NotFound { .. }
            | VmrigError::RestoreFailed { .. } => ErrorKind::Backend,
            VmrigError::Interrupted { .. } => ErrorKind::Interrupted,
            VmrigError::IoError(_) => ErrorKind::Io,
            VmrigError::InvalidOperation { .. }
            | VmrigError::Template(_)
            | VmrigError::JsonError(_)
            | VmrigError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Create a configuration error for a component
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        VmrigError::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Wrap a backend failure so backend-library error types never escape.
    pub fn backend(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        VmrigError::Backend {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        VmrigError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn interrupted(operation: impl Into<String>) -> Self {
        VmrigError::Interrupted {
            operation: operation.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        VmrigError::Internal {
            message: message.into(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}
