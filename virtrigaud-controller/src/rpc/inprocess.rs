//! In-process provider plumbing: the reference mock provider exposed
//! through the same [`ProviderApi`] surface the gRPC client implements.
//! Used by `--dev` mode and the control-plane test suites; no sockets
//! involved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tonic::Request;

use virtrigaud_api::provider::Provider as ProviderResource;
use virtrigaud_proto::provider::provider_server::Provider as ProviderService;
use virtrigaud_proto::provider::{
    CloneRequest, CloneResponse, CreateRequest, CreateResponse, DeleteRequest,
    DescribeRequest, DescribeResponse, ExportDiskRequest, GetCapabilitiesRequest,
    GetCapabilitiesResponse, ImagePrepareRequest, ImportDiskRequest, ImportDiskResponse,
    PowerOp, PowerRequest, ReconfigureRequest, SnapshotCreateRequest,
    SnapshotCreateResponse, SnapshotDeleteRequest, SnapshotRevertRequest,
    TaskStatusRequest, TaskStatusResponse, ValidateRequest,
};
use virtrigaud_provider_mock::{MockOptions, MockProvider};

use super::client::{task_opt, ProviderApi, ProviderConnector, SharedProvider};
use super::error::ProviderError;

/// [`ProviderApi`] over a mock provider living in this process.
pub struct InProcessProvider {
    inner: Arc<MockProvider>,
}

impl InProcessProvider {
    pub fn new(inner: Arc<MockProvider>) -> Self {
        Self { inner }
    }

    /// The mock backend, for state assertions in tests.
    pub fn mock(&self) -> Arc<MockProvider> {
        self.inner.clone()
    }
}

#[async_trait]
impl ProviderApi for InProcessProvider {
    async fn validate(&self) -> Result<(), ProviderError> {
        let response = ProviderService::validate(&*self.inner, Request::new(ValidateRequest {}))
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
        Ok(
            ProviderService::get_capabilities(&*self.inner, Request::new(GetCapabilitiesRequest {}))
                .await
                .map_err(ProviderError::from_status)?
                .into_inner(),
        )
    }

    async fn create(&self, req: CreateRequest) -> Result<CreateResponse, ProviderError> {
        Ok(ProviderService::create(&*self.inner, Request::new(req))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner())
    }

    async fn delete_vm(&self, id: &str) -> Result<Option<String>, ProviderError> {
        let response = ProviderService::delete(
            &*self.inner,
            Request::new(DeleteRequest { id: id.to_string() }),
        )
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
        let response = ProviderService::power(
            &*self.inner,
            Request::new(PowerRequest {
                id: id.to_string(),
                op: op as i32,
                graceful_timeout_seconds: graceful_timeout.as_secs() as u32,
            }),
        )
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
        let response = ProviderService::reconfigure(
            &*self.inner,
            Request::new(ReconfigureRequest {
                id: id.to_string(),
                desired_json,
            }),
        )
        .await
        .map_err(ProviderError::from_status)?
        .into_inner();
        Ok(task_opt(response.task_ref))
    }

    async fn describe(&self, id: &str) -> Result<DescribeResponse, ProviderError> {
        Ok(ProviderService::describe(
            &*self.inner,
            Request::new(DescribeRequest { id: id.to_string() }),
        )
        .await
        .map_err(ProviderError::from_status)?
        .into_inner())
    }

    async fn task_status(&self, task_ref: &str) -> Result<TaskStatusResponse, ProviderError> {
        Ok(ProviderService::task_status(
            &*self.inner,
            Request::new(TaskStatusRequest {
                task_ref: task_ref.to_string(),
            }),
        )
        .await
        .map_err(ProviderError::from_status)?
        .into_inner())
    }

    async fn snapshot_create(
        &self,
        req: SnapshotCreateRequest,
    ) -> Result<SnapshotCreateResponse, ProviderError> {
        Ok(ProviderService::snapshot_create(&*self.inner, Request::new(req))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner())
    }

    async fn snapshot_delete(
        &self,
        vm_id: &str,
        snapshot_id: &str,
    ) -> Result<Option<String>, ProviderError> {
        let response = ProviderService::snapshot_delete(
            &*self.inner,
            Request::new(SnapshotDeleteRequest {
                vm_id: vm_id.to_string(),
                snapshot_id: snapshot_id.to_string(),
            }),
        )
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
        let response = ProviderService::snapshot_revert(
            &*self.inner,
            Request::new(SnapshotRevertRequest {
                vm_id: vm_id.to_string(),
                snapshot_id: snapshot_id.to_string(),
            }),
        )
        .await
        .map_err(ProviderError::from_status)?
        .into_inner();
        Ok(task_opt(response.task_ref))
    }

    async fn clone_vm(&self, req: CloneRequest) -> Result<CloneResponse, ProviderError> {
        Ok(ProviderService::clone(&*self.inner, Request::new(req))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner())
    }

    async fn image_prepare(
        &self,
        req: ImagePrepareRequest,
    ) -> Result<Option<String>, ProviderError> {
        let response = ProviderService::image_prepare(&*self.inner, Request::new(req))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner();
        Ok(task_opt(response.task_ref))
    }

    async fn export_disk(&self, req: ExportDiskRequest) -> Result<Option<String>, ProviderError> {
        let response = ProviderService::export_disk(&*self.inner, Request::new(req))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner();
        Ok(task_opt(response.task_ref))
    }

    async fn import_disk(
        &self,
        req: ImportDiskRequest,
    ) -> Result<ImportDiskResponse, ProviderError> {
        Ok(ProviderService::import_disk(&*self.inner, Request::new(req))
            .await
            .map_err(ProviderError::from_status)?
            .into_inner())
    }
}

/// Connector materializing one in-process mock provider per Provider
/// resource. All providers share the migration mount root (the stand-in
/// for the shared PVC) while keeping per-provider storage pools.
pub struct InProcessConnector {
    base: MockOptions,
    providers: Mutex<HashMap<String, Arc<InProcessProvider>>>,
}

impl InProcessConnector {
    pub fn new(base: MockOptions) -> Self {
        Self {
            base,
            providers: Mutex::new(HashMap::new()),
        }
    }

    /// The shared migration mount root.
    pub fn mount_root(&self) -> std::path::PathBuf {
        self.base.mount_root.clone()
    }

    fn entry(&self, provider: &ProviderResource) -> Arc<InProcessProvider> {
        let key = provider.meta.key();
        let mut providers = self.providers.lock().unwrap_or_else(|e| e.into_inner());
        providers
            .entry(key)
            .or_insert_with(|| {
                let options = MockOptions {
                    pool_root: self.base.pool_root.join(&provider.meta.name),
                    ..self.base.clone()
                };
                Arc::new(InProcessProvider::new(Arc::new(MockProvider::with_options(
                    options,
                ))))
            })
            .clone()
    }

    /// The mock backend serving a Provider resource, for tests.
    pub fn mock_for(&self, provider: &ProviderResource) -> Arc<MockProvider> {
        self.entry(provider).mock()
    }
}

#[async_trait]
impl ProviderConnector for InProcessConnector {
    async fn connect(&self, provider: &ProviderResource) -> Result<SharedProvider, ProviderError> {
        Ok(self.entry(provider))
    }
}
