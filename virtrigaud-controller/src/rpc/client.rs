//! Typed provider RPC surface and the gRPC-backed implementation.
//!
//! Channels are long-lived and cached per (Provider, endpoint); endpoint
//! churn (pod restart behind a new address) evicts the cached entry and a
//! fresh lazy channel reconnects with the transport's bounded retries.
//! Every call carries a per-method deadline: short for Validate, medium
//! for read/driver operations, long for Create/Clone/ImportDisk.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, instrument};

use virtrigaud_api::provider::Provider as ProviderResource;
use virtrigaud_proto::provider::{
    CloneRequest, CloneResponse, CreateRequest, CreateResponse, DeleteRequest,
    DescribeRequest, DescribeResponse, ExportDiskRequest, GetCapabilitiesRequest,
    GetCapabilitiesResponse, ImagePrepareRequest, ImportDiskRequest, ImportDiskResponse,
    PowerOp, PowerRequest, ProviderClient, ReconfigureRequest, SnapshotCreateRequest,
    SnapshotCreateResponse, SnapshotDeleteRequest, SnapshotRevertRequest,
    TaskStatusRequest, TaskStatusResponse, ValidateRequest,
};

use super::error::ProviderError;

/// Deadline for Validate.
pub const VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for Describe/TaskStatus/Power/Reconfigure and the snapshot ops.
pub const MEDIUM_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for Create, Clone, ImportDisk and ExportDisk.
pub const LONG_TIMEOUT: Duration = Duration::from_secs(900);

/// A connected provider, shared across reconcilers.
pub type SharedProvider = Arc<dyn ProviderApi>;

/// Typed async surface of the provider contract.
///
/// Operations that may run asynchronously return the task ref, `None`
/// meaning the provider completed synchronously.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn validate(&self) -> Result<(), ProviderError>;
    async fn capabilities(&self) -> Result<GetCapabilitiesResponse, ProviderError>;
    async fn create(&self, req: CreateRequest) -> Result<CreateResponse, ProviderError>;
    async fn delete_vm(&self, id: &str) -> Result<Option<String>, ProviderError>;
    async fn power(
        &self,
        id: &str,
        op: PowerOp,
        graceful_timeout: Duration,
    ) -> Result<Option<String>, ProviderError>;
    async fn reconfigure(
        &self,
        id: &str,
        desired_json: String,
    ) -> Result<Option<String>, ProviderError>;
    async fn describe(&self, id: &str) -> Result<DescribeResponse, ProviderError>;
    async fn task_status(&self, task_ref: &str) -> Result<TaskStatusResponse, ProviderError>;
    async fn snapshot_create(
        &self,
        req: SnapshotCreateRequest,
    ) -> Result<SnapshotCreateResponse, ProviderError>;
    async fn snapshot_delete(
        &self,
        vm_id: &str,
        snapshot_id: &str,
    ) -> Result<Option<String>, ProviderError>;
    async fn snapshot_revert(
        &self,
        vm_id: &str,
        snapshot_id: &str,
    ) -> Result<Option<String>, ProviderError>;
    async fn clone_vm(&self, req: CloneRequest) -> Result<CloneResponse, ProviderError>;
    async fn image_prepare(
        &self,
        req: ImagePrepareRequest,
    ) -> Result<Option<String>, ProviderError>;
    async fn export_disk(&self, req: ExportDiskRequest) -> Result<Option<String>, ProviderError>;
    async fn import_disk(
        &self,
        req: ImportDiskRequest,
    ) -> Result<ImportDiskResponse, ProviderError>;
}

/// Resolves a Provider resource to a connected RPC surface.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    async fn connect(&self, provider: &ProviderResource) -> Result<SharedProvider, ProviderError>;
}

/// Empty task refs mean synchronous completion.
pub(crate) fn task_opt(task_ref: String) -> Option<String> {
    if task_ref.is_empty() {
        None
    } else {
        Some(task_ref)
    }
}

fn with_deadline<T>(message: T, deadline: Duration) -> tonic::Request<T> {
    let mut request = tonic::Request::new(message);
    request.set_timeout(deadline);
    request
}

// =============================================================================
// gRPC-backed implementation
// =============================================================================

/// Provider RPC over a cached tonic channel.
pub struct GrpcProvider {
    channel: Channel,
}

impl GrpcProvider {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    fn client(&self) -> ProviderClient<Channel> {
        ProviderClient::new(self.channel.clone())
    }
}

#[async_trait]
impl ProviderApi for GrpcProvider {
    async fn validate(&self) -> Result<(), ProviderError> {
        let response = self
            .client()
            .validate(with_deadline(ValidateRequest {}, VALIDATE_TIMEOUT))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner();
        if response.ok {
            Ok(())
        } else {
            Err(ProviderError::Retryable(response.message))
        }
    }

    async fn capabilities(&self) -> Result<GetCapabilitiesResponse, ProviderError> {
        Ok(self
            .client()
            .get_capabilities(with_deadline(GetCapabilitiesRequest {}, MEDIUM_TIMEOUT))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner())
    }

    async fn create(&self, req: CreateRequest) -> Result<CreateResponse, ProviderError> {
        Ok(self
            .client()
            .create(with_deadline(req, LONG_TIMEOUT))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner())
    }

    async fn delete_vm(&self, id: &str) -> Result<Option<String>, ProviderError> {
        let response = self
            .client()
            .delete(with_deadline(
                DeleteRequest { id: id.to_string() },
                MEDIUM_TIMEOUT,
            ))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner();
        Ok(task_opt(response.task_ref))
    }

    async fn power(
        &self,
        id: &str,
        op: PowerOp,
        graceful_timeout: Duration,
    ) -> Result<Option<String>, ProviderError> {
        let response = self
            .client()
            .power(with_deadline(
                PowerRequest {
                    id: id.to_string(),
                    op: op as i32,
                    graceful_timeout_seconds: graceful_timeout.as_secs() as u32,
                },
                MEDIUM_TIMEOUT,
            ))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner();
        Ok(task_opt(response.task_ref))
    }

    async fn reconfigure(
        &self,
        id: &str,
        desired_json: String,
    ) -> Result<Option<String>, ProviderError> {
        let response = self
            .client()
            .reconfigure(with_deadline(
                ReconfigureRequest {
                    id: id.to_string(),
                    desired_json,
                },
                MEDIUM_TIMEOUT,
            ))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner();
        Ok(task_opt(response.task_ref))
    }

    async fn describe(&self, id: &str) -> Result<DescribeResponse, ProviderError> {
        Ok(self
            .client()
            .describe(with_deadline(
                DescribeRequest { id: id.to_string() },
                MEDIUM_TIMEOUT,
            ))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner())
    }

    async fn task_status(&self, task_ref: &str) -> Result<TaskStatusResponse, ProviderError> {
        Ok(self
            .client()
            .task_status(with_deadline(
                TaskStatusRequest {
                    task_ref: task_ref.to_string(),
                },
                MEDIUM_TIMEOUT,
            ))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner())
    }

    async fn snapshot_create(
        &self,
        req: SnapshotCreateRequest,
    ) -> Result<SnapshotCreateResponse, ProviderError> {
        Ok(self
            .client()
            .snapshot_create(with_deadline(req, MEDIUM_TIMEOUT))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner())
    }

    async fn snapshot_delete(
        &self,
        vm_id: &str,
        snapshot_id: &str,
    ) -> Result<Option<String>, ProviderError> {
        let response = self
            .client()
            .snapshot_delete(with_deadline(
                SnapshotDeleteRequest {
                    vm_id: vm_id.to_string(),
                    snapshot_id: snapshot_id.to_string(),
                },
                MEDIUM_TIMEOUT,
            ))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner();
        Ok(task_opt(response.task_ref))
    }

    async fn snapshot_revert(
        &self,
        vm_id: &str,
        snapshot_id: &str,
    ) -> Result<Option<String>, ProviderError> {
        let response = self
            .client()
            .snapshot_revert(with_deadline(
                SnapshotRevertRequest {
                    vm_id: vm_id.to_string(),
                    snapshot_id: snapshot_id.to_string(),
                },
                MEDIUM_TIMEOUT,
            ))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner();
        Ok(task_opt(response.task_ref))
    }

    async fn clone_vm(&self, req: CloneRequest) -> Result<CloneResponse, ProviderError> {
        let mut client = self.client();
        Ok(ProviderClient::clone(&mut client, with_deadline(req, LONG_TIMEOUT))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner())
    }

    async fn image_prepare(
        &self,
        req: ImagePrepareRequest,
    ) -> Result<Option<String>, ProviderError> {
        let response = self
            .client()
            .image_prepare(with_deadline(req, LONG_TIMEOUT))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner();
        Ok(task_opt(response.task_ref))
    }

    async fn export_disk(&self, req: ExportDiskRequest) -> Result<Option<String>, ProviderError> {
        let response = self
            .client()
            .export_disk(with_deadline(req, LONG_TIMEOUT))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner();
        Ok(task_opt(response.task_ref))
    }

    async fn import_disk(
        &self,
        req: ImportDiskRequest,
    ) -> Result<ImportDiskResponse, ProviderError> {
        Ok(self
            .client()
            .import_disk(with_deadline(req, LONG_TIMEOUT))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner())
    }
}

// =============================================================================
// Channel cache
// =============================================================================

/// Caches one lazy channel per (Provider, endpoint).
///
/// Channel creation is singleflighted under the cache lock (lazy connect
/// never blocks); an endpoint change replaces the entry so clients follow
/// pod restarts.
pub struct GrpcConnector {
    channels: Mutex<HashMap<String, CachedChannel>>,
}

struct CachedChannel {
    endpoint: String,
    api: SharedProvider,
}

impl GrpcConnector {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for GrpcConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderConnector for GrpcConnector {
    #[instrument(skip(self, provider), fields(provider = %provider.meta.key()))]
    async fn connect(&self, provider: &ProviderResource) -> Result<SharedProvider, ProviderError> {
        let endpoint = provider
            .status
            .endpoint
            .clone()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                ProviderError::Retryable("provider endpoint not published yet".to_string())
            })?;
        let key = provider.meta.key();

        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = channels.get(&key) {
            if cached.endpoint == endpoint {
                return Ok(cached.api.clone());
            }
            debug!(old = %cached.endpoint, new = %endpoint, "Provider endpoint changed, reconnecting");
        }

        let channel = Endpoint::from_shared(endpoint.clone())
            .map_err(|e| {
                ProviderError::InvalidSpec(format!("bad provider endpoint {}: {}", endpoint, e))
            })?
            .connect_timeout(Duration::from_secs(5))
            .connect_lazy();

        let api: SharedProvider = Arc::new(GrpcProvider::new(channel));
        channels.insert(
            key,
            CachedChannel {
                endpoint,
                api: api.clone(),
            },
        );
        Ok(api)
    }
}
