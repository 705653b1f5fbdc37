//! Repository descriptors and the master-index download workflow.

pub mod types;
pub mod workflow;

pub use types::{DownloadContext, RepoInfo, RepoType, ServiceInfo, ServiceType};
pub use workflow::{FileProvider, NoPluginVerifier, PluginVerifier, RepoDownloaderWorkflow};
